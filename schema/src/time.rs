//! UTC wire timestamps
//!
//! All timestamps on the wire use the 7-tuple array form
//! `[year, month, day, hour, minute, second, microsecond]`, always UTC.
//! The array form keeps payloads language-neutral and trivially sortable
//! without a date parser on the consuming side.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// UTC timestamp in wire form `[Y, M, D, h, m, s, µs]`
///
/// The derived ordering is chronological because the fields are stored
/// most-significant first.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Utc7(pub [i64; 7]);

impl Utc7 {
    /// Current UTC time in wire form
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert a `chrono` UTC datetime into wire form
    #[must_use]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self([
            i64::from(dt.year()),
            i64::from(dt.month()),
            i64::from(dt.day()),
            i64::from(dt.hour()),
            i64::from(dt.minute()),
            i64::from(dt.second()),
            i64::from(dt.nanosecond() / 1000),
        ])
    }

    /// Convert back into a `chrono` UTC datetime
    ///
    /// Returns `None` for arrays that do not denote a valid instant.
    #[must_use]
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let [y, mo, d, h, mi, s, us] = self.0;
        let y = i32::try_from(y).ok()?;
        let base = Utc
            .with_ymd_and_hms(
                y,
                u32::try_from(mo).ok()?,
                u32::try_from(d).ok()?,
                u32::try_from(h).ok()?,
                u32::try_from(mi).ok()?,
                u32::try_from(s).ok()?,
            )
            .single()?;
        Some(base + chrono::Duration::microseconds(us))
    }

    /// Seconds elapsed between `self` and `later` (negative if `later` is earlier)
    #[must_use]
    pub fn seconds_until(&self, later: &Utc7) -> Option<f64> {
        let a = self.to_datetime()?;
        let b = later.to_datetime()?;
        Some((b - a).num_microseconds()? as f64 / 1_000_000.0)
    }
}
