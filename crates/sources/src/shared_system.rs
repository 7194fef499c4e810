//! Shared sysinfo cache
//!
//! One `sysinfo::System` is shared by every `sys` variable. It is refreshed
//! by the module's CRON variable once per scheduler tick; the readers only
//! look at the cached numbers.

use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Minimum interval between refreshes, sysinfo needs a gap to compute CPU usage
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(200);

pub struct SystemSnapshot {
    system: System,
    last_refresh: Option<Instant>,
    pub global_cpu: f32,
    pub per_core: Vec<f32>,
    pub total_memory: u64,
    pub used_memory: u64,
}

impl SystemSnapshot {
    fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(MemoryRefreshKind::new().with_ram()),
        );
        Self {
            system,
            last_refresh: None,
            global_cpu: 0.0,
            per_core: Vec::new(),
            total_memory: 0,
            used_memory: 0,
        }
    }

    /// Refresh only if enough time has passed since last refresh
    pub fn refresh_if_needed(&mut self) {
        if self
            .last_refresh
            .is_some_and(|last| last.elapsed() < MIN_REFRESH_INTERVAL)
        {
            return;
        }
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.global_cpu = self.system.global_cpu_usage();
        self.per_core = self.system.cpus().iter().map(|c| c.cpu_usage()).collect();
        self.total_memory = self.system.total_memory();
        self.used_memory = self.system.used_memory();
        self.last_refresh = Some(Instant::now());
    }

    pub fn memory_percent(&self) -> i64 {
        if self.total_memory == 0 {
            return 0;
        }
        (self.used_memory as f64 * 100.0 / self.total_memory as f64).round() as i64
    }
}

static SHARED_SYSTEM: Lazy<Mutex<SystemSnapshot>> = Lazy::new(|| {
    log::info!("Creating shared sysinfo::System instance");
    Mutex::new(SystemSnapshot::new())
});

/// Run `f` against the shared snapshot
pub fn with_snapshot<T>(f: impl FnOnce(&mut SystemSnapshot) -> T) -> T {
    // Recover from a poisoned mutex, the cached numbers are still usable
    let mut snapshot = SHARED_SYSTEM.lock().unwrap_or_else(|poisoned| {
        log::warn!("Shared system mutex was poisoned, recovering");
        poisoned.into_inner()
    });
    f(&mut snapshot)
}
