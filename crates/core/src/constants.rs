//! Shared constants for the daemon and its modules

/// Default TCP port clients connect to
pub const DEFAULT_PORT: u16 = 7000;

/// Default scheduler tick in seconds
pub const DEFAULT_INTERVAL_SECS: f64 = 1.0;

/// Bytes read from a client socket per readiness event
pub const READ_CHUNK: usize = 1024;

/// Longest unterminated client line kept before it is discarded
pub const MAX_LINE: usize = 4096;

/// File extension of loadable provider modules on this platform
pub const PLUGIN_EXTENSION: &str = std::env::consts::DLL_EXTENSION;

/// Pushes queued for one client before it counts as gone
pub const OUTBOX_CAPACITY: usize = 256;
