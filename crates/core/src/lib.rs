//! sensd-core: Provider module contract for the sensd daemon.
//!
//! This crate contains the traits a provider module implements
//! (`ProviderModule`, `Registrar`), the tagged `Callable` that variables
//! evaluate through, the `ModuleLoader` seam used by the registry, the
//! error taxonomy for loading and symbol resolution, and shared constants.

pub mod constants;
mod callable;
mod error;
mod loader;
mod module;

pub use callable::Callable;
pub use constants::{
    DEFAULT_INTERVAL_SECS, DEFAULT_PORT, MAX_LINE, OUTBOX_CAPACITY, PLUGIN_EXTENSION, READ_CHUNK,
};
pub use error::{LoadError, ResolveError};
pub use loader::{BoxedModule, ModuleFactory, ModuleLoader};
pub use module::{ProviderModule, Registrar, StaticModule};

// Re-export types used in trait signatures for convenience
pub use sensd_types::{ArgKind, Value, VarKind, VarType};
