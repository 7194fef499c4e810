//! Native provider modules
//!
//! Shared libraries are opened with `libloading` and wrapped as
//! `ProviderModule`s. All FFI in the daemon lives here.

mod dylib;

pub use dylib::DylibLoader;
