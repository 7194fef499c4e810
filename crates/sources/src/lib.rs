//! sensd-sources: Built-in provider modules for sensd.
//!
//! These modules are compiled into the daemon but go through the same
//! registration and resolution contract as natively loaded ones.

mod clock;
mod shared_system;
mod sys;

pub use clock::clock_module;
pub use sys::sys_module;

use sensd_core::{BoxedModule, ModuleFactory};

fn create_sys() -> BoxedModule {
    Box::new(sys_module())
}

fn create_clock() -> BoxedModule {
    Box::new(clock_module())
}

/// Name and factory of every built-in module
pub fn builtin_modules() -> Vec<(&'static str, ModuleFactory)> {
    vec![("sys", create_sys as ModuleFactory), ("clock", create_clock)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensd_core::ProviderModule;

    #[test]
    fn test_builtin_names_match_modules() {
        for (name, factory) in builtin_modules() {
            assert_eq!(factory().name(), name);
        }
    }
}
