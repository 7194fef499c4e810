//! Module loader seam

use super::{LoadError, ProviderModule};
use std::path::Path;

/// Type-erased provider module
pub type BoxedModule = Box<dyn ProviderModule>;

/// Function that creates a built-in module
pub type ModuleFactory = fn() -> BoxedModule;

/// Opens provider modules found on disk
///
/// The registry only talks to modules through this trait, which keeps
/// native library handling (and its `unsafe`) behind one implementation.
pub trait ModuleLoader: Send + Sync {
    /// Whether `path` looks like something this loader can open
    fn accepts(&self, path: &Path) -> bool;

    /// Open the unit at `path` and verify it exports the module contract
    fn open(&self, path: &Path) -> Result<BoxedModule, LoadError>;
}
