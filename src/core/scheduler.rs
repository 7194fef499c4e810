//! Subscription scheduler
//!
//! Re-evaluates variables on a fixed tick and pushes values that changed.
//! Each tick runs in three phases: plan under the state lock, evaluate
//! providers on the blocking pool with the lock released, then apply the
//! results under the lock again.

use super::directory::{push_warranted, VariableId};
use super::state::{lock, DaemonState, SharedState};
use super::subscription::SubscriptionId;
use anyhow::{Context, Result};
use log::{debug, error, trace, warn};
use sensd_core::{Callable, Value, VarType};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// One provider call scheduled for this tick
struct Job {
    variable: VariableId,
    name: String,
    var_type: VarType,
    arg: Option<String>,
    callable: Callable,
}

/// Work collected while holding the lock
#[derive(Default)]
pub(crate) struct TickPlan {
    jobs: Vec<Job>,
    /// Subscriptions served by each job, by job index
    targets: Vec<(SubscriptionId, usize)>,
    /// Subscriptions whose variable vanished
    orphans: Vec<SubscriptionId>,
}

impl TickPlan {
    pub(crate) fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

/// Summary of one tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub evaluated: usize,
    pub pushed: usize,
    pub removed: usize,
    pub unloaded: usize,
}

/// Drives periodic evaluation of subscribed and CRON variables
pub struct Scheduler {
    state: SharedState,
    interval: Duration,
}

impl Scheduler {
    pub fn new(state: SharedState, interval: Duration) -> Self {
        Self { state, interval }
    }

    /// Run ticks until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Scheduler running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let start = Instant::now();
            match self.tick(&cancel).await {
                Ok(Some(report)) => trace!("Tick {:?} took {:?}", report, start.elapsed()),
                Ok(None) => break,
                Err(e) => error!("Scheduler tick failed: {:#}", e),
            }
        }
        debug!("Scheduler stopped");
    }

    /// Run a single tick; None if cancelled before it could finish
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<Option<TickReport>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let plan = plan(&mut lock(&self.state), Instant::now());

        if cancel.is_cancelled() {
            return Ok(None);
        }
        let (plan, values) = tokio::task::spawn_blocking(move || {
            let values = evaluate(&plan);
            (plan, values)
        })
        .await
        .context("Evaluation task failed")?;

        if cancel.is_cancelled() {
            return Ok(None);
        }
        let report = apply(&mut lock(&self.state), plan, values, Instant::now());
        Ok(Some(report))
    }
}

/// Collect CRON calls and due subscriptions
///
/// Each (variable, argument) pair gets at most one job. Once a pair has a
/// job, every live subscription on it becomes a target, so a subscriber
/// that is not due itself still sees a change found on its behalf.
pub(crate) fn plan(state: &mut DaemonState, now: Instant) -> TickPlan {
    let mut plan = TickPlan::default();
    let mut index = HashMap::new();

    for variable in state.directory.cron_variables() {
        job_for(state, &mut plan, &mut index, variable, None);
    }

    let mut live = Vec::new();
    let mut due = Vec::new();
    for sub in state.subscriptions.iter() {
        let Some(var) = state.directory.get(sub.variable) else {
            plan.orphans.push(sub.id);
            continue;
        };
        if var.is_broken() {
            continue;
        }
        if var.is_due(sub.arg.as_deref(), now) || sub.first_evaluation || sub.pending_removal {
            due.push((sub.variable, sub.arg.clone()));
        }
        live.push((sub.id, sub.variable, sub.arg.clone()));
    }

    for (variable, arg) in due {
        job_for(state, &mut plan, &mut index, variable, arg.as_deref());
    }

    for (sub, variable, arg) in live {
        let key = (variable, arg.unwrap_or_default());
        if let Some(&slot) = index.get(&key) {
            plan.targets.push((sub, slot));
        }
    }
    plan
}

/// Index of the job evaluating `variable` with `arg`, adding it if needed
fn job_for(
    state: &mut DaemonState,
    plan: &mut TickPlan,
    index: &mut HashMap<(VariableId, String), usize>,
    variable: VariableId,
    arg: Option<&str>,
) -> Option<usize> {
    let key = (variable, arg.unwrap_or("").to_string());
    if let Some(&slot) = index.get(&key) {
        return Some(slot);
    }

    let module = state.directory.get(variable)?.module;
    let unit = state.registry.get(module)?.unit();
    let callable = state
        .directory
        .resolve_symbol(variable, |method, ty| unit.resolve(method, ty))?;
    let var = state.directory.get(variable)?;
    plan.jobs.push(Job {
        variable,
        name: var.name.clone(),
        var_type: var.var_type,
        arg: arg.map(str::to_string),
        callable,
    });
    let slot = plan.jobs.len() - 1;
    index.insert(key, slot);
    Some(slot)
}

/// Run every job; a panicking provider yields no value
fn evaluate(plan: &TickPlan) -> Vec<Option<Value>> {
    plan.jobs
        .iter()
        .map(|job| {
            match catch_unwind(AssertUnwindSafe(|| job.callable.invoke(job.arg.as_deref()))) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Provider for {} panicked", job.name);
                    None
                }
            }
        })
        .collect()
}

/// Record results, push warranted values and retire finished subscriptions
pub(crate) fn apply(
    state: &mut DaemonState,
    plan: TickPlan,
    values: Vec<Option<Value>>,
    now: Instant,
) -> TickReport {
    let mut report = TickReport::default();

    let mut changed = vec![false; plan.jobs.len()];
    for (slot, (job, value)) in plan.jobs.iter().zip(&values).enumerate() {
        if let Some(value) = value {
            report.evaluated += 1;
            changed[slot] = state
                .directory
                .mark_evaluated(job.variable, job.arg.as_deref(), now, value.checksum())
                .unwrap_or(false);
        }
    }

    for (sub_id, slot) in &plan.targets {
        let (Some(job), Some(Some(value))) = (plan.jobs.get(*slot), values.get(*slot)) else {
            continue;
        };
        // Removed while the providers ran
        let Some(sub) = state.subscriptions.get(*sub_id) else {
            continue;
        };

        let mut pending_removal = sub.pending_removal;
        if push_warranted(changed[*slot], sub.first_evaluation, sub.pending_removal) {
            let line = format!("{}:{}:{}\r\n", sub.client_id, job.var_type.bits(), value.to_wire());
            if state.send(sub.connection, line) {
                report.pushed += 1;
                if sub.once {
                    pending_removal = true;
                }
            } else {
                debug!("Peer of subscription {} is gone", sub.client_id);
                pending_removal = true;
            }
        }

        if let Some(sub) = state.subscriptions.get_mut(*sub_id) {
            sub.first_evaluation = false;
            sub.pending_removal = pending_removal;
        }
    }

    for orphan in &plan.orphans {
        if let Some(sub) = state.subscriptions.get_mut(*orphan) {
            sub.pending_removal = true;
        }
    }

    for sub in state.subscriptions.pending_removal() {
        if state.remove_subscription(sub) {
            report.removed += 1;
        }
    }

    report.unloaded = state.sweep_idle();
    report
}
