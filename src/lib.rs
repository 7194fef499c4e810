//! sensd: a metrics daemon that streams provider values to TCP clients
//!
//! This library provides the daemon's building blocks:
//! - Module registry and variable directory for provider modules
//! - Subscription scheduler with checksum-based change detection
//! - Connection manager and line protocol
//! - Configuration and native module loading

pub mod config;
pub mod core;
pub mod daemon;
pub mod plugin;
pub mod server;

// Re-export commonly used types
pub use config::{ConfigProvider, Settings};
pub use daemon::{Daemon, RunningDaemon};
