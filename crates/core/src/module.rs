//! Provider module trait and the in-process module builder

use super::{Callable, ResolveError};
use anyhow::Result;
use sensd_types::VarType;
use std::collections::HashMap;

/// Receives variable registrations while a module initializes
pub trait Registrar {
    /// Offer a variable to the daemon
    ///
    /// Returns true if the variable was registered. A false return means
    /// nothing references the name (or it clashes with another module) and
    /// the module need not keep any state for it.
    fn register_variable(
        &mut self,
        name: &str,
        method: &str,
        default_timeout: u32,
        var_type: VarType,
    ) -> bool;
}

/// Trait for all provider modules
///
/// A module is a loaded unit of code that exposes named variables. The
/// registry calls `init` once after loading, `resolve` lazily the first
/// time a variable is evaluated, and `teardown` once before dropping it.
pub trait ProviderModule: Send {
    /// Module name, unique case-insensitively among loaded modules
    fn name(&self) -> &str;

    /// Register variables through `registrar`
    fn init(&self, registrar: &mut dyn Registrar) -> Result<()>;

    /// Bind a method name to a callable matching `var_type`'s signature
    fn resolve(&self, method: &str, var_type: VarType) -> Result<Callable, ResolveError>;

    /// Release module resources; best effort, never retried
    fn teardown(&self) {}
}

struct VariableDecl {
    name: String,
    method: String,
    default_timeout: u32,
    var_type: VarType,
}

type InitHook = Box<dyn Fn() -> Result<()> + Send + Sync>;
type TeardownHook = Box<dyn Fn() + Send + Sync>;

/// A provider module compiled into the daemon
///
/// Built-in sources and tests use this to go through the exact same
/// registration and resolution path as natively loaded modules.
pub struct StaticModule {
    name: String,
    variables: Vec<VariableDecl>,
    methods: HashMap<String, Callable>,
    on_init: Option<InitHook>,
    on_teardown: Option<TeardownHook>,
}

impl StaticModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: Vec::new(),
            methods: HashMap::new(),
            on_init: None,
            on_teardown: None,
        }
    }

    /// Declare a variable whose method has the same name
    pub fn variable(
        self,
        name: &str,
        default_timeout: u32,
        var_type: VarType,
        callable: Callable,
    ) -> Self {
        self.declare(name, name, default_timeout, var_type)
            .method(name, callable)
    }

    /// Declare a variable bound to `method`, which may be added separately
    pub fn declare(
        mut self,
        name: &str,
        method: &str,
        default_timeout: u32,
        var_type: VarType,
    ) -> Self {
        self.variables.push(VariableDecl {
            name: name.to_string(),
            method: method.to_string(),
            default_timeout,
            var_type,
        });
        self
    }

    /// Add a resolvable method
    pub fn method(mut self, method: &str, callable: Callable) -> Self {
        self.methods.insert(method.to_string(), callable);
        self
    }

    /// Run `hook` before variables are registered; an error aborts loading
    pub fn on_init(mut self, hook: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        self.on_init = Some(Box::new(hook));
        self
    }

    pub fn on_teardown(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_teardown = Some(Box::new(hook));
        self
    }
}

impl ProviderModule for StaticModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, registrar: &mut dyn Registrar) -> Result<()> {
        if let Some(hook) = &self.on_init {
            hook()?;
        }
        for decl in &self.variables {
            registrar.register_variable(
                &decl.name,
                &decl.method,
                decl.default_timeout,
                decl.var_type,
            );
        }
        Ok(())
    }

    fn resolve(&self, method: &str, var_type: VarType) -> Result<Callable, ResolveError> {
        let callable = self
            .methods
            .get(method)
            .ok_or_else(|| ResolveError::UnknownMethod {
                module: self.name.clone(),
                method: method.to_string(),
            })?;
        if callable.arg_kind() != var_type.arg_kind() {
            return Err(ResolveError::SignatureMismatch {
                method: method.to_string(),
            });
        }
        Ok(callable.clone())
    }

    fn teardown(&self) {
        if let Some(hook) = &self.on_teardown {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensd_types::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Collect {
        names: Vec<(String, String, u32, VarType)>,
    }

    impl Registrar for Collect {
        fn register_variable(
            &mut self,
            name: &str,
            method: &str,
            timeout: u32,
            ty: VarType,
        ) -> bool {
            self.names.push((name.into(), method.into(), timeout, ty));
            true
        }
    }

    #[test]
    fn test_init_registers_declared_variables() {
        let module = StaticModule::new("battery")
            .variable("battper", 5, VarType::VARIABLE_BAR, Callable::no_arg(|| Value::Level(80)))
            .declare("battstatus", "status_impl", 30, VarType::VARIABLE_STR);

        let mut collect = Collect::default();
        module.init(&mut collect).unwrap();

        assert_eq!(collect.names.len(), 2);
        assert_eq!(collect.names[0].0, "battper");
        assert_eq!(collect.names[1].1, "status_impl");
        assert_eq!(collect.names[1].2, 30);
    }

    #[test]
    fn test_resolve_checks_signature() {
        let module = StaticModule::new("m")
            .method("temp", Callable::with_int(|_| Value::Level(1)));

        assert!(module.resolve("temp", VarType::VARIABLE_BAR | VarType::ARG_INT).is_ok());
        assert!(matches!(
            module.resolve("temp", VarType::VARIABLE_BAR),
            Err(ResolveError::SignatureMismatch { .. })
        ));
        assert!(matches!(
            module.resolve("missing", VarType::VARIABLE_STR),
            Err(ResolveError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn test_init_hook_failure_propagates() {
        let module = StaticModule::new("broken").on_init(|| anyhow::bail!("no sensor"));
        let mut collect = Collect::default();
        assert!(module.init(&mut collect).is_err());
        assert!(collect.names.is_empty());
    }

    #[test]
    fn test_teardown_hook_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let module = StaticModule::new("m").on_teardown(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        module.teardown();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
