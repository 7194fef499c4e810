//! Client subscriptions

use super::directory::VariableId;
use super::registry::ModuleId;
use super::state::ConnectionId;
use std::collections::BTreeMap;

/// Stable handle to a subscription; ids grow monotonically, so ordering by
/// id is insertion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// One client's interest in a variable
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// Correlation id chosen by the client, echoed in every push
    pub client_id: String,
    pub connection: ConnectionId,
    pub variable: VariableId,
    pub module: ModuleId,
    pub arg: Option<String>,
    /// Remove after the first successful push
    pub once: bool,
    /// Forces an unconditional push on the next evaluation
    pub first_evaluation: bool,
    pub pending_removal: bool,
}

/// What a new subscription points at
pub struct NewSubscription {
    pub client_id: String,
    pub connection: ConnectionId,
    pub variable: VariableId,
    pub module: ModuleId,
    pub arg: Option<String>,
    pub once: bool,
}

/// Every live subscription, iterated in insertion order
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: BTreeMap<SubscriptionId, Subscription>,
    next_id: u64,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, new: NewSubscription) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.insert(
            id,
            Subscription {
                id,
                client_id: new.client_id,
                connection: new.connection,
                variable: new.variable,
                module: new.module,
                arg: new.arg,
                once: new.once,
                first_evaluation: true,
                pending_removal: false,
            },
        );
        id
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Option<Subscription> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: SubscriptionId) -> Option<&mut Subscription> {
        self.entries.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.values()
    }

    /// Subscriptions flagged for removal, in insertion order
    pub fn pending_removal(&self) -> Vec<SubscriptionId> {
        self.entries
            .values()
            .filter(|s| s.pending_removal)
            .map(|s| s.id)
            .collect()
    }

    /// Live subscriptions holding `module`
    pub fn count_for_module(&self, module: ModuleId) -> usize {
        self.entries.values().filter(|s| s.module == module).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
