//! Layered configuration resolution
//!
//! Configuration is assembled from an ordered stack of sources. Precedence,
//! highest first:
//!
//! 1. command-line arguments
//! 2. bus-sourced dynamic configuration
//! 3. per-service environment overrides (`{TYPE}_{VARIANT}_{FIELD}`,
//!    `{TYPE}_{FIELD}`)
//! 4. the YAML file, with `${NAME}` environment expansion applied at load
//! 5. built-in defaults
//!
//! Per-instance resolution additionally merges, inside every layer, the
//! global keys, then the `services` entry matching the type alone, then the
//! entry matching type + variant.
//!
//! Resolution is deterministic: identical layers always produce equal maps.

use crate::error::{Result, TcsError};
use regex::Regex;
use schema::ServiceDescriptor;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Top-level keys consumed by the framework itself
const RESERVED_KEYS: [&str; 3] = ["services", "registry", "bus"];

/// Source rank of a configuration layer; higher wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LayerKind {
    /// Built-in defaults
    Defaults,
    /// Configuration file (env-expanded at load)
    File,
    /// Bus-sourced dynamic configuration
    Bus,
    /// Command-line arguments
    Args,
}

struct Layer {
    kind: LayerKind,
    data: Map<String, Value>,
}

/// Ordered stack of configuration sources
pub struct ConfigResolver {
    layers: RwLock<Vec<Layer>>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver {
    /// Create an empty resolver
    #[must_use]
    pub fn new() -> Self {
        Self {
            layers: RwLock::new(Vec::new()),
        }
    }

    fn push_layer(&self, kind: LayerKind, data: Map<String, Value>) {
        let mut layers = self.layers.write().unwrap();
        layers.push(Layer { kind, data });
        // Same-kind layers keep insertion order, so a later push of the
        // same rank still wins on conflicting keys.
        layers.sort_by_key(|l| l.kind);
    }

    /// Add built-in defaults (lowest precedence)
    pub fn push_defaults(&self, data: Map<String, Value>) {
        self.push_layer(LayerKind::Defaults, data);
    }

    /// Load a YAML file as a layer, expanding `${NAME}` tokens
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TcsError::Config(format!("cannot read {}: {e}", path.display())))?;
        let value: Value = serde_yaml::from_str(&raw)
            .map_err(|e| TcsError::Config(format!("cannot parse {}: {e}", path.display())))?;
        let value = expand_env(value);
        match value {
            Value::Object(map) => {
                debug!(path = %path.display(), "loaded config file");
                self.push_layer(LayerKind::File, map);
                Ok(())
            }
            Value::Null => {
                self.push_layer(LayerKind::File, Map::new());
                Ok(())
            }
            other => Err(TcsError::Config(format!(
                "{}: top level must be a mapping, got {other}",
                path.display()
            ))),
        }
    }

    /// Add the bus-sourced dynamic layer
    pub fn push_bus(&self, data: Map<String, Value>) {
        self.push_layer(LayerKind::Bus, data);
    }

    /// Add command-line overrides (highest precedence)
    pub fn push_args(&self, data: Map<String, Value>) {
        self.push_layer(LayerKind::Args, data);
    }

    /// Merge of all layers, lowest to highest
    #[must_use]
    pub fn merged(&self) -> Map<String, Value> {
        let layers = self.layers.read().unwrap();
        let mut out = Map::new();
        for layer in layers.iter() {
            deep_merge(&mut out, &layer.data);
        }
        out
    }

    /// Look up a dotted path (`bus.host`) across the merged layers
    #[must_use]
    pub fn get(&self, dotted: &str) -> Option<Value> {
        let mut current = Value::Object(self.merged());
        for token in dotted.split('.') {
            current = current.get(token)?.clone();
        }
        Some(current)
    }

    /// The declared service descriptors
    ///
    /// Entries using the deprecated `instance_context` key are accepted
    /// with a warning.
    pub fn services(&self) -> Result<Vec<ServiceDescriptor>> {
        let merged = self.merged();
        let Some(list) = merged.get("services") else {
            return Ok(Vec::new());
        };
        let Value::Array(entries) = list else {
            return Err(TcsError::Config("'services' must be a list".to_string()));
        };

        let mut descriptors = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if entry.get("instance_context").is_some() {
                warn!(
                    "services[{i}]: 'instance_context' is deprecated, use 'variant'"
                );
            }
            let descriptor: ServiceDescriptor = serde_json::from_value(entry.clone())
                .map_err(|e| TcsError::Config(format!("services[{i}]: {e}")))?;
            descriptor
                .validate()
                .map_err(|e| TcsError::Config(format!("services[{i}]: {e}")))?;
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }

    /// Resolve the program hosting a service type in subprocess mode
    ///
    /// A string entry in the top-level `registry` mapping wins; a missing
    /// or null entry (`~`) selects the conventional internal program name
    /// `tcs-svc-{type}`.
    pub fn registry_program(&self, service_type: &str) -> Result<String> {
        let merged = self.merged();
        match merged.get("registry").and_then(|r| r.get(service_type)) {
            Some(Value::String(program)) => Ok(program.clone()),
            Some(Value::Null) | None => {
                Ok(format!("tcs-svc-{}", service_type.replace('.', "-")))
            }
            Some(other) => Err(TcsError::Config(format!(
                "registry.{service_type}: expected a program path or ~, got {other}"
            ))),
        }
    }

    /// Assemble the effective configuration of one service instance
    #[must_use]
    pub fn resolve_instance(&self, service_type: &str, variant: &str) -> Map<String, Value> {
        let layers = self.layers.read().unwrap();
        let mut out = Map::new();

        for layer in layers.iter().filter(|l| l.kind <= LayerKind::File) {
            let extracted = extract_instance(&layer.data, service_type, variant);
            deep_merge(&mut out, &extracted);
        }

        apply_env_overrides(&mut out, service_type, variant);

        for layer in layers.iter().filter(|l| l.kind > LayerKind::File) {
            let extracted = extract_instance(&layer.data, service_type, variant);
            deep_merge(&mut out, &extracted);
        }

        out.insert("type".to_string(), Value::String(service_type.to_string()));
        out.insert("variant".to_string(), Value::String(variant.to_string()));
        out
    }
}

/// Merge per-instance keys out of one layer's data
fn extract_instance(data: &Map<String, Value>, service_type: &str, variant: &str) -> Map<String, Value> {
    let mut out = Map::new();

    for (key, value) in data {
        if !RESERVED_KEYS.contains(&key.as_str()) {
            out.insert(key.clone(), value.clone());
        }
    }

    let Some(Value::Array(entries)) = data.get("services") else {
        return out;
    };

    let entry_variant = |entry: &Value| -> Option<String> {
        entry
            .get("variant")
            .or_else(|| entry.get("instance_context"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    // Type-level section first, then the exact instance section.
    for entry in entries {
        if entry.get("type").and_then(Value::as_str) == Some(service_type)
            && entry_variant(entry).is_none()
        {
            if let Value::Object(map) = entry {
                deep_merge(&mut out, map);
            }
        }
    }
    for entry in entries {
        if entry.get("type").and_then(Value::as_str) == Some(service_type)
            && entry_variant(entry).as_deref() == Some(variant)
        {
            if let Value::Object(map) = entry {
                deep_merge(&mut out, map);
            }
        }
    }
    out
}

/// Apply `{TYPE}_{VARIANT}_{FIELD}` / `{TYPE}_{FIELD}` environment overrides
fn apply_env_overrides(out: &mut Map<String, Value>, service_type: &str, variant: &str) {
    let type_key = service_type.to_uppercase().replace('.', "_");
    let variant_key = variant.to_uppercase().replace('.', "_");
    let instance_prefix = format!("{type_key}_{variant_key}_");
    let type_prefix = format!("{type_key}_");

    let vars: Vec<(String, String)> = std::env::vars().collect();

    // Type-generic first so instance-specific values win.
    for (name, value) in &vars {
        if let Some(field) = name.strip_prefix(&type_prefix) {
            if name.starts_with(&instance_prefix) || field.is_empty() {
                continue;
            }
            out.insert(field.to_lowercase(), retype_scalar(value));
        }
    }
    for (name, value) in &vars {
        if let Some(field) = name.strip_prefix(&instance_prefix) {
            if field.is_empty() {
                continue;
            }
            out.insert(field.to_lowercase(), retype_scalar(value));
        }
    }
}

/// Parse an environment string into the narrowest JSON scalar
fn retype_scalar(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::from(f);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

/// Recursively expand `${NAME}` tokens in string scalars
///
/// A scalar that is exactly one token is re-typed when the resolved value
/// parses as integer, float or bool; mixed tokens stay strings. Undefined
/// names keep the literal placeholder and produce a warning.
#[must_use]
pub fn expand_env(value: Value) -> Value {
    // Tokens are strict: ${NAME} with NAME = [A-Za-z_][A-Za-z0-9_]*
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern");
    expand_env_with(&pattern, value)
}

fn expand_env_with(pattern: &Regex, value: Value) -> Value {
    match value {
        Value::String(s) => {
            if let Some(m) = pattern.captures(&s) {
                if m.get(0).map(|w| w.as_str()) == Some(s.as_str()) {
                    // Pure token: substitute and re-type
                    let name = &m[1];
                    return match std::env::var(name) {
                        Ok(resolved) => retype_scalar(&resolved),
                        Err(_) => {
                            warn!("environment variable '${{{name}}}' not set, keeping placeholder");
                            Value::String(s)
                        }
                    };
                }
            }
            let replaced = pattern.replace_all(&s, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                match std::env::var(name) {
                    Ok(resolved) => resolved,
                    Err(_) => {
                        warn!("environment variable '${{{name}}}' not set, keeping placeholder");
                        caps[0].to_string()
                    }
                }
            });
            Value::String(replaced.into_owned())
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, expand_env_with(pattern, v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| expand_env_with(pattern, v))
                .collect(),
        ),
        other => other,
    }
}

/// Deep-merge `update` into `base`; scalars and arrays replace, maps recurse
pub fn deep_merge(base: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (key, value) in update {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Field type in a per-service config schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// String value
    Str,
    /// Integer value
    Int,
    /// Floating-point value (integers coerce)
    Float,
    /// Boolean value
    Bool,
}

/// One declared configuration field of a service
#[derive(Debug, Clone)]
pub struct ConfigField {
    /// Field name
    pub name: String,
    /// Expected type
    pub kind: FieldKind,
    /// Default when no layer provides a value
    pub default: Option<Value>,
    /// Whether resolution fails when absent and without default
    pub required: bool,
}

/// Declared configuration schema of a service type
///
/// The resolver returns a typed map; services read named fields from it.
#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    /// Declared fields
    pub fields: Vec<ConfigField>,
}

impl ConfigSchema {
    /// Empty schema: every field passes through untyped
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an optional field with a default
    #[must_use]
    pub fn field(mut self, name: &str, kind: FieldKind, default: Value) -> Self {
        self.fields.push(ConfigField {
            name: name.to_string(),
            kind,
            default: Some(default),
            required: false,
        });
        self
    }

    /// Declare a required field without a default
    #[must_use]
    pub fn required(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(ConfigField {
            name: name.to_string(),
            kind,
            default: None,
            required: true,
        });
        self
    }

    /// Validate and type a resolved map against this schema
    pub fn apply(&self, map: Map<String, Value>) -> Result<ResolvedConfig> {
        let mut out = map;
        for field in &self.fields {
            match out.get(&field.name) {
                None => {
                    if let Some(default) = &field.default {
                        out.insert(field.name.clone(), default.clone());
                    } else if field.required {
                        return Err(TcsError::Config(format!(
                            "required field '{}' has no default and no value",
                            field.name
                        )));
                    }
                }
                Some(value) => {
                    let ok = match field.kind {
                        FieldKind::Str => value.is_string(),
                        FieldKind::Int => value.is_i64() || value.is_u64(),
                        FieldKind::Float => value.is_number(),
                        FieldKind::Bool => value.is_boolean(),
                    };
                    if !ok {
                        return Err(TcsError::Config(format!(
                            "field '{}' has wrong type: {value}",
                            field.name
                        )));
                    }
                }
            }
        }
        Ok(ResolvedConfig { map: out })
    }
}

/// Effective configuration handed to a service instance
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    map: Map<String, Value>,
}

impl ResolvedConfig {
    /// Wrap a raw map without schema validation
    #[must_use]
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self { map }
    }

    /// Raw access to the underlying map
    #[must_use]
    pub fn raw(&self) -> &Map<String, Value> {
        &self.map
    }

    /// Look up a field
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }

    /// String field
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.map.get(name).and_then(Value::as_str)
    }

    /// Integer field
    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.map.get(name).and_then(Value::as_i64)
    }

    /// Float field (integers coerce)
    #[must_use]
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.map.get(name).and_then(Value::as_f64)
    }

    /// Boolean field
    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.map.get(name).and_then(Value::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn write_yaml(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_layer_precedence_for_instance() {
        // File sets 10, env sets 30, args set 50; args win, then env, then file
        let resolver = ConfigResolver::new();
        let file = write_yaml(
            "services:\n  - type: echolay\n    variant: t1\n    timeout: 10\n",
        );
        resolver.load_file(file.path()).unwrap();

        std::env::set_var("ECHOLAY_T1_TIMEOUT", "30");
        let resolved = resolver.resolve_instance("echolay", "t1");
        assert_eq!(resolved.get("timeout"), Some(&json!(30)));

        resolver.push_args(obj(json!({ "timeout": 50 })));
        let resolved = resolver.resolve_instance("echolay", "t1");
        assert_eq!(resolved.get("timeout"), Some(&json!(50)));

        std::env::remove_var("ECHOLAY_T1_TIMEOUT");
        // Without args and env the file value resurfaces
        let bare = ConfigResolver::new();
        bare.load_file(file.path()).unwrap();
        assert_eq!(
            bare.resolve_instance("echolay", "t1").get("timeout"),
            Some(&json!(10))
        );
    }

    #[test]
    fn test_type_section_then_instance_section() {
        let resolver = ConfigResolver::new();
        let file = write_yaml(
            "log_level: info\nservices:\n  - type: cam\n    exposure: 1\n    gain: 2\n  - type: cam\n    variant: fast\n    exposure: 5\n",
        );
        resolver.load_file(file.path()).unwrap();

        let fast = resolver.resolve_instance("cam", "fast");
        // Instance entry overrides the type-level entry; untouched keys survive
        assert_eq!(fast.get("exposure"), Some(&json!(5)));
        assert_eq!(fast.get("gain"), Some(&json!(2)));
        assert_eq!(fast.get("log_level"), Some(&json!("info")));
        assert_eq!(fast.get("variant"), Some(&json!("fast")));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let build = || {
            let resolver = ConfigResolver::new();
            resolver.push_defaults(obj(json!({ "a": 1, "nested": { "x": 1 } })));
            resolver.push_args(obj(json!({ "nested": { "y": 2 } })));
            resolver.push_bus(obj(json!({ "a": 3 })));
            resolver.resolve_instance("svc", "v")
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_env_expansion_retypes_pure_tokens() {
        std::env::set_var("TCS_TEST_PORT", "4222");
        std::env::set_var("TCS_TEST_RATIO", "0.5");
        std::env::set_var("TCS_TEST_FLAG", "true");
        std::env::set_var("TCS_TEST_HOST", "nats.obs");

        let value = expand_env(json!({
            "port": "${TCS_TEST_PORT}",
            "ratio": "${TCS_TEST_RATIO}",
            "flag": "${TCS_TEST_FLAG}",
            "url": "nats://${TCS_TEST_HOST}:${TCS_TEST_PORT}",
            "missing": "${TCS_TEST_UNSET_XYZ}",
            "partial_missing": "x-${TCS_TEST_UNSET_XYZ}",
        }));

        assert_eq!(value["port"], json!(4222));
        assert_eq!(value["ratio"], json!(0.5));
        assert_eq!(value["flag"], json!(true));
        assert_eq!(value["url"], json!("nats://nats.obs:4222"));
        // Undefined names keep the literal placeholder
        assert_eq!(value["missing"], json!("${TCS_TEST_UNSET_XYZ}"));
        assert_eq!(value["partial_missing"], json!("x-${TCS_TEST_UNSET_XYZ}"));
    }

    #[test]
    fn test_variant_env_override_beats_type_override() {
        std::env::set_var("OVERR_RATE", "1");
        std::env::set_var("OVERR_V2_RATE", "2");
        let resolver = ConfigResolver::new();
        let v1 = resolver.resolve_instance("overr", "v1");
        let v2 = resolver.resolve_instance("overr", "v2");
        assert_eq!(v1.get("rate"), Some(&json!(1)));
        assert_eq!(v2.get("rate"), Some(&json!(2)));
        std::env::remove_var("OVERR_RATE");
        std::env::remove_var("OVERR_V2_RATE");
    }

    #[test]
    fn test_services_parsing_and_validation() {
        let resolver = ConfigResolver::new();
        let file = write_yaml(
            "services:\n  - type: echo\n    variant: t1\n    restart: on-failure\n  - type: echo\n    variant: t2\n    enabled: false\n",
        );
        resolver.load_file(file.path()).unwrap();
        let services = resolver.services().unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].service_id(), "echo.t1");
        assert!(!services[1].enabled);
    }

    #[test]
    fn test_unreadable_file_is_config_error() {
        let resolver = ConfigResolver::new();
        let err = resolver.load_file("/definitely/not/there.yaml").unwrap_err();
        assert!(matches!(err, TcsError::Config(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_registry_program_mapping() {
        let resolver = ConfigResolver::new();
        let file = write_yaml(
            "registry:\n  importer: /opt/tcs/bin/importer\n  guiding.ofp: ~\n",
        );
        resolver.load_file(file.path()).unwrap();

        assert_eq!(
            resolver.registry_program("importer").unwrap(),
            "/opt/tcs/bin/importer"
        );
        // `~` and missing entries both fall back to the conventional name
        assert_eq!(
            resolver.registry_program("guiding.ofp").unwrap(),
            "tcs-svc-guiding-ofp"
        );
        assert_eq!(resolver.registry_program("echo").unwrap(), "tcs-svc-echo");
    }

    #[test]
    fn test_schema_defaults_and_required() {
        let schema = ConfigSchema::new()
            .field("timeout", FieldKind::Int, json!(10))
            .required("target", FieldKind::Str);

        let ok = schema
            .apply(obj(json!({ "target": "m31" })))
            .unwrap();
        assert_eq!(ok.get_i64("timeout"), Some(10));
        assert_eq!(ok.get_str("target"), Some("m31"));

        let err = schema.apply(Map::new()).unwrap_err();
        assert!(matches!(err, TcsError::Config(_)));

        let bad_type = schema.apply(obj(json!({ "target": 5 }))).unwrap_err();
        assert!(matches!(bad_type, TcsError::Config(_)));
    }

    #[test]
    fn test_dotted_get() {
        let resolver = ConfigResolver::new();
        resolver.push_defaults(obj(json!({ "bus": { "host": "localhost", "port": 4222 } })));
        resolver.push_args(obj(json!({ "bus": { "host": "nats.obs" } })));
        assert_eq!(resolver.get("bus.host"), Some(json!("nats.obs")));
        assert_eq!(resolver.get("bus.port"), Some(json!(4222)));
        assert_eq!(resolver.get("bus.missing"), None);
    }
}
