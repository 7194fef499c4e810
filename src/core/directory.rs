//! Variable directory
//!
//! Metadata and evaluation state for every registered variable. This is a
//! passive table: the registry inserts and removes entries as modules come
//! and go, the scheduler records evaluations.

use super::registry::ModuleId;
use log::error;
use sensd_core::{Callable, ResolveError, VarType};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Stable handle to a variable; never reused within a daemon run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(u64);

/// Whether a push is due for one subscription
///
/// Pushes happen when the value changed since it was last sent, when the
/// subscription has never been served, or as a final flush before removal.
pub fn push_warranted(changed: bool, first_evaluation: bool, pending_removal: bool) -> bool {
    changed || first_evaluation || pending_removal
}

enum Binding {
    Unresolved,
    Ready(Callable),
    /// Resolution failed once; the variable stays inert
    Broken,
}

/// Last evaluation of a variable for one argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub checksum: u64,
    pub evaluated_at: Instant,
}

/// A named, typed value exported by a module
pub struct Variable {
    pub id: VariableId,
    pub name: String,
    pub method: String,
    pub var_type: VarType,
    /// Seconds between re-evaluations; 0 re-evaluates every tick
    pub timeout: u32,
    pub module: ModuleId,
    binding: Binding,
    /// Keyed by argument; a missing argument and an empty one are the same
    samples: HashMap<String, Sample>,
}

impl Variable {
    /// Whether the timeout for `arg` has elapsed at `now`
    pub fn is_due(&self, arg: Option<&str>, now: Instant) -> bool {
        if self.timeout == 0 {
            return true;
        }
        match self.samples.get(arg.unwrap_or("")) {
            None => true,
            Some(sample) => {
                now.saturating_duration_since(sample.evaluated_at)
                    >= Duration::from_secs(u64::from(self.timeout))
            }
        }
    }

    pub fn last_sample(&self, arg: Option<&str>) -> Option<Sample> {
        self.samples.get(arg.unwrap_or("")).copied()
    }

    pub fn is_broken(&self) -> bool {
        matches!(self.binding, Binding::Broken)
    }

    pub fn is_cron(&self) -> bool {
        self.var_type.is_cron()
    }
}

/// Table of all registered variables
#[derive(Default)]
pub struct VariableDirectory {
    variables: HashMap<VariableId, Variable>,
    by_name: HashMap<String, VariableId>,
    next_id: u64,
}

impl VariableDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable; returns None if the name is already taken
    pub fn insert(
        &mut self,
        name: &str,
        method: &str,
        var_type: VarType,
        timeout: u32,
        module: ModuleId,
    ) -> Option<VariableId> {
        if self.by_name.contains_key(name) {
            return None;
        }
        self.next_id += 1;
        let id = VariableId(self.next_id);
        self.variables.insert(
            id,
            Variable {
                id,
                name: name.to_string(),
                method: method.to_string(),
                var_type,
                timeout,
                module,
                binding: Binding::Unresolved,
                samples: HashMap::new(),
            },
        );
        self.by_name.insert(name.to_string(), id);
        Some(id)
    }

    pub fn remove(&mut self, id: VariableId) -> Option<Variable> {
        let variable = self.variables.remove(&id)?;
        self.by_name.remove(&variable.name);
        Some(variable)
    }

    pub fn get(&self, id: VariableId) -> Option<&Variable> {
        self.variables.get(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<VariableId> {
        self.by_name.get(name).copied()
    }

    /// Bind the variable's method, calling `resolver` only the first time
    ///
    /// A failed resolution is logged once and leaves the variable
    /// permanently inert; later calls return None without logging.
    pub fn resolve_symbol<F>(&mut self, id: VariableId, resolver: F) -> Option<Callable>
    where
        F: FnOnce(&str, VarType) -> Result<Callable, ResolveError>,
    {
        let variable = self.variables.get_mut(&id)?;
        match &variable.binding {
            Binding::Ready(callable) => return Some(callable.clone()),
            Binding::Broken => return None,
            Binding::Unresolved => {}
        }
        match resolver(&variable.method, variable.var_type) {
            Ok(callable) => {
                variable.binding = Binding::Ready(callable.clone());
                Some(callable)
            }
            Err(e) => {
                error!("Variable {} is unusable: {}", variable.name, e);
                variable.binding = Binding::Broken;
                None
            }
        }
    }

    /// Record an evaluation; returns whether the checksum changed
    pub fn mark_evaluated(
        &mut self,
        id: VariableId,
        arg: Option<&str>,
        now: Instant,
        checksum: u64,
    ) -> Option<bool> {
        let variable = self.variables.get_mut(&id)?;
        let sample = Sample {
            checksum,
            evaluated_at: now,
        };
        let previous = variable.samples.insert(arg.unwrap_or("").to_string(), sample);
        Some(previous.map_or(true, |p| p.checksum != checksum))
    }

    /// All CRON-tagged variables
    pub fn cron_variables(&self) -> Vec<VariableId> {
        let mut ids: Vec<VariableId> = self
            .variables
            .values()
            .filter(|v| v.is_cron())
            .map(|v| v.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}
