//! Daemon lifecycle
//!
//! A `Daemon` owns everything one run needs. Reloading throws it away and
//! bootstraps a fresh one, so no state leaks from one run to the next.

use crate::config::{ConfigProvider, Settings};
use crate::core::{
    lock, AcceptAll, DaemonState, LayoutTemplate, ModuleRegistry, Scheduler, SharedState,
    TemplateRefs,
};
use crate::plugin::DylibLoader;
use crate::server::ConnectionManager;
use anyhow::{Context, Result};
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A bootstrapped daemon that is not serving yet
pub struct Daemon {
    settings: Arc<Settings>,
    state: SharedState,
}

impl Daemon {
    /// Build the registry and load built-in and native modules
    pub fn bootstrap(settings: Settings) -> Result<Self> {
        let template: Arc<dyn TemplateRefs> = match &settings.layout {
            Some(path) => {
                let layout = LayoutTemplate::load(path).context("Failed to load layout")?;
                info!(
                    "Layout {} references {} variables",
                    path.display(),
                    layout.referenced_count()
                );
                Arc::new(layout)
            }
            None => Arc::new(AcceptAll),
        };

        let settings = Arc::new(settings);
        let config: Arc<dyn ConfigProvider> = settings.clone();
        let mut registry = ModuleRegistry::new(Arc::new(DylibLoader), template, config);
        if settings.builtin_modules {
            for (name, factory) in sensd_sources::builtin_modules() {
                registry.register_builtin(name, factory);
            }
        }

        let mut state = DaemonState::new(registry);
        let DaemonState {
            registry, directory, ..
        } = &mut state;
        let builtin = registry.load_builtins(directory);
        let native = match &settings.plugin_dir {
            Some(dir) => registry.load_all(dir, directory),
            None => 0,
        };
        info!(
            "Loaded {} built-in and {} native modules, {} variables",
            builtin,
            native,
            directory.len()
        );

        Ok(Self {
            settings,
            state: state.into_shared(),
        })
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Bind the listener and spawn the scheduler and the server
    pub async fn start(self) -> Result<RunningDaemon> {
        let bound = ConnectionManager::bind(
            &self.settings.listen,
            self.state.clone(),
            self.settings.clone(),
        )
        .await;
        let manager = match bound {
            Ok(manager) => manager,
            Err(e) => {
                lock(&self.state).shutdown();
                return Err(e);
            }
        };
        let local_addr = manager.local_addr()?;

        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(self.state.clone(), self.settings.tick_interval());
        let scheduler_token = cancel.child_token();
        let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_token).await });
        let server_task = tokio::spawn(manager.run(cancel.child_token()));

        Ok(RunningDaemon {
            state: self.state,
            cancel,
            scheduler_task,
            server_task,
            local_addr,
        })
    }
}

/// A daemon serving clients
pub struct RunningDaemon {
    state: SharedState,
    cancel: CancellationToken,
    scheduler_task: JoinHandle<()>,
    server_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl RunningDaemon {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Stop the scheduler and the server, then release every module
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.scheduler_task.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
        if let Err(e) = self.server_task.await {
            warn!("Server task ended abnormally: {}", e);
        }
        lock(&self.state).shutdown();
        info!("Daemon stopped");
    }
}

/// What ended a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Reload,
    Stop,
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<Signal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        _ = hangup.recv() => Ok(Signal::Reload),
        _ = terminate.recv() => Ok(Signal::Stop),
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("Failed to listen for Ctrl-C")?;
            Ok(Signal::Stop)
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<Signal> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    Ok(Signal::Stop)
}

/// Serve until stopped, rebuilding from fresh settings on every reload
pub async fn run<F>(load_settings: F) -> Result<()>
where
    F: Fn() -> Result<Settings>,
{
    loop {
        let settings = load_settings()?;
        let running = Daemon::bootstrap(settings)?.start().await?;
        info!("sensd serving on {}", running.local_addr());

        let signal = wait_for_signal().await;
        running.stop().await;
        match signal? {
            Signal::Reload => info!("Reloading"),
            Signal::Stop => return Ok(()),
        }
    }
}
