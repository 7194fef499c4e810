//! Configuration management

mod settings;

pub use settings::{ListenConfig, Settings};

/// Typed key/value lookups by section
///
/// This is the interface the protocol's `cfg` command and the variable
/// timeout overrides read through. Missing or mistyped entries yield the
/// supplied default.
pub trait ConfigProvider: Send + Sync {
    fn get_string(&self, section: &str, key: &str, default: &str) -> String;
    fn get_int(&self, section: &str, key: &str, default: i64) -> i64;
    fn get_double(&self, section: &str, key: &str, default: f64) -> f64;
    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool;
}

/// Section holding per-variable timeout overrides, in seconds
pub const TIMEOUTS_SECTION: &str = "timeouts";
