//! Layout variable references
//!
//! Variables are only registered when the display layout refers to them.
//! Rendering the layout is someone else's job; all the daemon needs is the
//! set of names the layout mentions.

use super::directory::VariableId;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

/// The template engine's side of variable registration
pub trait TemplateRefs: Send + Sync {
    fn is_variable_referenced(&self, name: &str) -> bool;

    /// Called for each variable that was registered
    fn bind_variable(&self, _name: &str, _id: VariableId) {}
}

/// Treats every variable as referenced; used when no layout is configured
#[derive(Debug, Default)]
pub struct AcceptAll;

impl TemplateRefs for AcceptAll {
    fn is_variable_referenced(&self, _name: &str) -> bool {
        true
    }
}

/// `$$` escapes, `${name args}` and `$name` references
static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:\$|\{\s*([A-Za-z_][A-Za-z0-9_]*)|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("reference pattern is valid")
});

/// Variable references found in a layout text
#[derive(Debug, Default)]
pub struct LayoutTemplate {
    referenced: HashSet<String>,
    bound: Mutex<HashMap<String, VariableId>>,
}

impl LayoutTemplate {
    pub fn parse(layout: &str) -> Self {
        let referenced = REFERENCE
            .captures_iter(layout)
            .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
            .map(|m| m.as_str().to_string())
            .collect();
        Self {
            referenced,
            bound: Mutex::new(HashMap::new()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let layout = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read layout: {}", path.display()))?;
        Ok(Self::parse(&layout))
    }

    pub fn referenced_count(&self) -> usize {
        self.referenced.len()
    }

    /// Variable bound to a referenced name, if registered
    pub fn bound(&self, name: &str) -> Option<VariableId> {
        self.bound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }
}

impl TemplateRefs for LayoutTemplate {
    fn is_variable_referenced(&self, name: &str) -> bool {
        self.referenced.contains(name)
    }

    fn bind_variable(&self, name: &str, id: VariableId) {
        self.bound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), id);
    }
}
