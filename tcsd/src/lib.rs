//! Built-in services shipped with the launcher daemon
//!
//! The binaries in this package (the `tcsd` launcher and the standalone
//! service hosts) share the service implementations defined here.

pub mod services;
