//! Module registry
//!
//! Tracks loaded provider modules by name, registers their variables in the
//! directory while they initialize, and counts the subscriptions holding
//! each module resident.

use super::directory::{VariableDirectory, VariableId};
use super::template::TemplateRefs;
use crate::config::{ConfigProvider, TIMEOUTS_SECTION};
use log::{debug, info, warn};
use sensd_core::{
    BoxedModule, LoadError, ModuleFactory, ModuleLoader, ProviderModule, Registrar, VarType,
};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Stable handle to a loaded module; never reused within a daemon run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

impl ModuleId {
    #[cfg(test)]
    pub(crate) fn for_tests(raw: u64) -> Self {
        ModuleId(raw)
    }
}

/// Where a module's code comes from, so it can be loaded again on demand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleOrigin {
    Builtin(String),
    File(PathBuf),
}

impl fmt::Display for ModuleOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleOrigin::Builtin(name) => write!(f, "builtin:{}", name),
            ModuleOrigin::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A loaded provider module
pub struct Module {
    pub id: ModuleId,
    pub name: String,
    pub origin: ModuleOrigin,
    unit: BoxedModule,
    /// Live subscriptions on any of this module's variables, plus one
    /// implicit client when the module exports a CRON variable
    clients: usize,
    pinned: bool,
    variables: Vec<VariableId>,
}

impl Module {
    pub fn clients(&self) -> usize {
        self.clients
    }

    /// Whether a CRON variable keeps this module loaded
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn variables(&self) -> &[VariableId] {
        &self.variables
    }

    pub fn unit(&self) -> &dyn ProviderModule {
        self.unit.as_ref()
    }
}

/// A variable a module offered while initializing
struct Offer {
    name: String,
    method: String,
    default_timeout: u32,
    var_type: VarType,
}

/// Records a module's registrations without touching the directory
struct StagingSink<'a> {
    module_name: &'a str,
    template: &'a dyn TemplateRefs,
    offers: Vec<Offer>,
}

impl Registrar for StagingSink<'_> {
    fn register_variable(
        &mut self,
        name: &str,
        method: &str,
        default_timeout: u32,
        var_type: VarType,
    ) -> bool {
        // CRON variables refresh module state and are never displayed, so
        // they skip the layout check
        if !var_type.is_cron() && !self.template.is_variable_referenced(name) {
            debug!("Variable {} of {} is not referenced, skipping", name, self.module_name);
            return false;
        }
        if self.offers.iter().any(|offer| offer.name == name) {
            warn!("Variable {} registered twice by {}", name, self.module_name);
            return false;
        }

        self.offers.push(Offer {
            name: name.to_string(),
            method: method.to_string(),
            default_timeout,
            var_type,
        });
        true
    }
}

/// A module that was opened and initialized but is not registered yet
pub struct PreparedModule {
    unit: BoxedModule,
    origin: ModuleOrigin,
    offers: Vec<Offer>,
}

impl PreparedModule {
    pub fn name(&self) -> &str {
        self.unit.name()
    }
}

/// Opens and initializes modules apart from the registry's tables
///
/// All provider code of a load runs here, so callers sharing the registry
/// behind a lock can prepare a module with the lock released and only
/// take it for [`ModuleRegistry::install`].
#[derive(Clone)]
pub struct ModulePreparer {
    loader: Arc<dyn ModuleLoader>,
    builtins: HashMap<String, ModuleFactory>,
    template: Arc<dyn TemplateRefs>,
}

impl ModulePreparer {
    /// Open the unit behind `origin` and run its init entry point
    ///
    /// `is_loaded` is asked about the module name before init runs, so a
    /// module that is already resident is never initialized twice.
    pub fn prepare(
        &self,
        origin: &ModuleOrigin,
        is_loaded: impl Fn(&str) -> bool,
    ) -> Result<PreparedModule, LoadError> {
        let unit = match origin {
            ModuleOrigin::Builtin(name) => {
                let factory = self
                    .builtins
                    .get(&name.to_lowercase())
                    .copied()
                    .ok_or_else(|| LoadError::UnknownBuiltin(name.clone()))?;
                factory()
            }
            ModuleOrigin::File(path) => {
                if !path.exists() {
                    return Err(LoadError::NotFound(path.clone()));
                }
                self.loader.open(path)?
            }
        };

        let name = unit.name().to_string();
        if is_loaded(&name) {
            return Err(LoadError::AlreadyLoaded(name));
        }

        let mut sink = StagingSink {
            module_name: &name,
            template: self.template.as_ref(),
            offers: Vec::new(),
        };
        let init_result = unit.init(&mut sink);
        let offers = sink.offers;

        if let Err(e) = init_result {
            teardown_unit(&name, unit.as_ref());
            return Err(LoadError::Init {
                name,
                reason: format!("{:#}", e),
            });
        }
        Ok(PreparedModule {
            unit,
            origin: origin.clone(),
            offers,
        })
    }
}

/// Registry of loaded provider modules
pub struct ModuleRegistry {
    loader: Arc<dyn ModuleLoader>,
    builtins: HashMap<String, ModuleFactory>,
    modules: HashMap<ModuleId, Module>,
    /// Lowercased module name to id
    by_name: HashMap<String, ModuleId>,
    /// Variable name to the origin of the module that registered it
    catalog: HashMap<String, ModuleOrigin>,
    template: Arc<dyn TemplateRefs>,
    config: Arc<dyn ConfigProvider>,
    next_id: u64,
}

impl ModuleRegistry {
    pub fn new(
        loader: Arc<dyn ModuleLoader>,
        template: Arc<dyn TemplateRefs>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            loader,
            builtins: HashMap::new(),
            modules: HashMap::new(),
            by_name: HashMap::new(),
            catalog: HashMap::new(),
            template,
            config,
            next_id: 0,
        }
    }

    /// Make a compiled-in module available under `name`
    pub fn register_builtin(&mut self, name: &str, factory: ModuleFactory) {
        self.builtins.insert(name.to_lowercase(), factory);
    }

    /// List all registered built-in module names
    pub fn builtin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builtins.keys().cloned().collect();
        names.sort();
        names
    }

    /// Handle that opens and initializes modules for this registry
    pub fn preparer(&self) -> ModulePreparer {
        ModulePreparer {
            loader: self.loader.clone(),
            builtins: self.builtins.clone(),
            template: self.template.clone(),
        }
    }

    /// Load a native module from `path`
    pub fn load(
        &mut self,
        path: &Path,
        directory: &mut VariableDirectory,
    ) -> Result<ModuleId, LoadError> {
        self.load_origin(&ModuleOrigin::File(path.to_path_buf()), directory)
    }

    /// Load a compiled-in module
    pub fn load_builtin(
        &mut self,
        name: &str,
        directory: &mut VariableDirectory,
    ) -> Result<ModuleId, LoadError> {
        self.load_origin(&ModuleOrigin::Builtin(name.to_string()), directory)
    }

    pub fn load_origin(
        &mut self,
        origin: &ModuleOrigin,
        directory: &mut VariableDirectory,
    ) -> Result<ModuleId, LoadError> {
        let prepared = self
            .preparer()
            .prepare(origin, |name| self.find_by_name(name).is_some())?;
        self.install(prepared, directory)
    }

    /// Register a prepared module's variables and make it resident
    ///
    /// Offers whose name another module already holds are skipped. A
    /// module left without any displayed variable is torn down again.
    pub fn install(
        &mut self,
        prepared: PreparedModule,
        directory: &mut VariableDirectory,
    ) -> Result<ModuleId, LoadError> {
        let PreparedModule {
            unit,
            origin,
            offers,
        } = prepared;
        let name = unit.name().to_string();
        if self.by_name.contains_key(&name.to_lowercase()) {
            teardown_unit(&name, unit.as_ref());
            return Err(LoadError::AlreadyLoaded(name));
        }

        self.next_id += 1;
        let id = ModuleId(self.next_id);

        let mut registered = Vec::new();
        let mut used = 0;
        let mut has_cron = false;
        for offer in offers {
            let timeout = self
                .config
                .get_int(TIMEOUTS_SECTION, &offer.name, i64::from(offer.default_timeout));
            let timeout = u32::try_from(timeout).unwrap_or(offer.default_timeout);

            let inserted =
                directory.insert(&offer.name, &offer.method, offer.var_type, timeout, id);
            let Some(var) = inserted else {
                warn!(
                    "Variable {} from {} is already registered by another module",
                    offer.name, name
                );
                continue;
            };
            debug!(
                "Registered variable {} (type {}, timeout {}s) from {}",
                offer.name, offer.var_type, timeout, name
            );
            self.template.bind_variable(&offer.name, var);
            registered.push(var);
            if offer.var_type.is_cron() {
                has_cron = true;
            } else {
                used += 1;
            }
        }

        if used == 0 {
            for var in &registered {
                directory.remove(*var);
            }
            teardown_unit(&name, unit.as_ref());
            return Err(LoadError::Unused(name));
        }

        for var in &registered {
            if let Some(variable) = directory.get(*var) {
                if !variable.is_cron() {
                    self.catalog.insert(variable.name.clone(), origin.clone());
                }
            }
        }

        info!(
            "Loaded module {} from {} ({} variables{})",
            name,
            origin,
            registered.len(),
            if has_cron { ", pinned by CRON" } else { "" }
        );

        self.by_name.insert(name.to_lowercase(), id);
        self.modules.insert(
            id,
            Module {
                id,
                name,
                origin,
                unit,
                clients: usize::from(has_cron),
                pinned: has_cron,
                variables: registered,
            },
        );
        Ok(id)
    }

    /// Tear a module down and drop its variables
    ///
    /// Unknown ids are ignored, so unloading twice is harmless. Callers are
    /// expected to have released every subscription first.
    pub fn unload(&mut self, id: ModuleId, directory: &mut VariableDirectory) {
        let Some(module) = self.modules.remove(&id) else {
            return;
        };
        self.by_name.remove(&module.name.to_lowercase());
        if module.clients > usize::from(module.pinned) {
            warn!(
                "Unloading module {} with {} active clients",
                module.name, module.clients
            );
        }
        for var in &module.variables {
            directory.remove(*var);
        }
        teardown_unit(&module.name, module.unit.as_ref());
        info!("Unloaded module {}", module.name);
    }

    /// Case-insensitive lookup
    pub fn find_by_name(&self, name: &str) -> Option<ModuleId> {
        self.by_name.get(&name.to_lowercase()).copied()
    }

    pub fn get(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(&id)
    }

    /// Origin of the module that registered `variable`, loaded or not
    pub fn origin_of(&self, variable: &str) -> Option<&ModuleOrigin> {
        self.catalog.get(variable)
    }

    /// Try every file in `dir` the loader recognizes
    ///
    /// Failures are logged and skipped. Returns the number of modules that
    /// stayed loaded.
    pub fn load_all(&mut self, dir: &Path, directory: &mut VariableDirectory) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read plugin directory {}: {}", dir.display(), e);
                return 0;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && self.loader.accepts(path))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match self.load(&path, directory) {
                Ok(_) => loaded += 1,
                Err(LoadError::Unused(name)) => {
                    info!("Module {} is not used by the layout, unloaded", name)
                }
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        loaded
    }

    /// Load every compiled-in module; returns how many stayed loaded
    pub fn load_builtins(&mut self, directory: &mut VariableDirectory) -> usize {
        let mut loaded = 0;
        for name in self.builtin_names() {
            match self.load_builtin(&name, directory) {
                Ok(_) => loaded += 1,
                Err(LoadError::Unused(name)) => {
                    info!("Module {} is not used by the layout, unloaded", name)
                }
                Err(e) => warn!("Skipping built-in module {}: {}", name, e),
            }
        }
        loaded
    }

    /// Count one more subscription on `id`
    pub fn acquire(&mut self, id: ModuleId) -> bool {
        match self.modules.get_mut(&id) {
            Some(module) => {
                module.clients += 1;
                true
            }
            None => false,
        }
    }

    /// Count one subscription less; returns the remaining client count
    pub fn release(&mut self, id: ModuleId) -> usize {
        let Some(module) = self.modules.get_mut(&id) else {
            return 0;
        };
        if module.clients == 0 {
            warn!("Module {} released with no clients", module.name);
            return 0;
        }
        module.clients -= 1;
        module.clients
    }

    /// Unload every module nobody holds; returns how many went away
    pub fn sweep_idle(&mut self, directory: &mut VariableDirectory) -> usize {
        let mut idle: Vec<ModuleId> = self
            .modules
            .values()
            .filter(|m| m.clients == 0)
            .map(|m| m.id)
            .collect();
        idle.sort();
        for id in &idle {
            self.unload(*id, directory);
        }
        idle.len()
    }

    /// Unload everything, pinned modules included
    pub fn unload_all(&mut self, directory: &mut VariableDirectory) {
        let mut ids: Vec<ModuleId> = self.modules.keys().copied().collect();
        ids.sort();
        for id in ids {
            if let Some(module) = self.modules.get_mut(&id) {
                module.clients = 0;
            }
            self.unload(id, directory);
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Best-effort teardown; a panicking module is logged and dropped anyway
fn teardown_unit(name: &str, unit: &dyn ProviderModule) {
    if catch_unwind(AssertUnwindSafe(|| unit.teardown())).is_err() {
        warn!("Teardown of module {} panicked", name);
    }
}
