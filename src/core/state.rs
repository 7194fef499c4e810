//! Shared daemon state
//!
//! The registry, the variable directory, the subscription table and the
//! connection set live behind one mutex. The connection tasks and the
//! scheduler both take it for short, non-blocking critical sections.
//! Evaluations and on-demand module loads run their provider code with it
//! released.

use super::directory::VariableDirectory;
use super::registry::{ModuleId, ModuleOrigin, ModulePreparer, ModuleRegistry, PreparedModule};
use super::subscription::{NewSubscription, SubscriptionId, SubscriptionTable};
use log::{debug, warn};
use sensd_core::LoadError;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

/// Identity of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a `var`/`varonce` command could not be honoured
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("variable {0} cannot be evaluated")]
    Unresolvable(String),

    #[error("failed to load module for {name}: {source}")]
    Load {
        name: String,
        #[source]
        source: LoadError,
    },

    #[error("loading the module for {0} was interrupted")]
    Interrupted(String),
}

struct ConnectionEntry {
    outbox: Sender<String>,
    subscriptions: Vec<SubscriptionId>,
}

/// Everything the connection tasks and the scheduler share
pub struct DaemonState {
    pub registry: ModuleRegistry,
    pub directory: VariableDirectory,
    pub subscriptions: SubscriptionTable,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Serializes on-demand loads so a module is never initialized twice
    load_gate: Arc<tokio::sync::Mutex<()>>,
}

/// A module to bring back before a subscription can be made
struct PendingLoad {
    preparer: ModulePreparer,
    origin: ModuleOrigin,
    gate: Arc<tokio::sync::Mutex<()>>,
}

/// Handle to the daemon state, cloned into every task
pub type SharedState = Arc<Mutex<DaemonState>>;

/// Lock the shared state, recovering from a poisoned mutex
pub fn lock(state: &SharedState) -> MutexGuard<'_, DaemonState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl DaemonState {
    pub fn new(registry: ModuleRegistry) -> Self {
        Self {
            registry,
            directory: VariableDirectory::new(),
            subscriptions: SubscriptionTable::new(),
            connections: HashMap::new(),
            load_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// Start tracking a connection; pushes for it go to `outbox`
    pub fn register_connection(&mut self, id: ConnectionId, outbox: Sender<String>) {
        self.connections.insert(
            id,
            ConnectionEntry {
                outbox,
                subscriptions: Vec::new(),
            },
        );
    }

    /// Queue a line for a connection
    ///
    /// False if the peer is gone or has stopped draining its outbox.
    pub fn send(&self, id: ConnectionId, line: String) -> bool {
        let Some(entry) = self.connections.get(&id) else {
            return false;
        };
        match entry.outbox.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Outbox of connection {} is full", id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Subscribe a connection to a registered variable
    ///
    /// The variable's method is resolved here so an unusable variable is
    /// refused up front. Use [`subscribe_shared`] to also bring back a
    /// module that was unloaded for lack of clients.
    pub fn subscribe(
        &mut self,
        connection: ConnectionId,
        client_id: &str,
        name: &str,
        arg: Option<&str>,
        once: bool,
    ) -> Result<SubscriptionId, SubscribeError> {
        if !self.connections.contains_key(&connection) {
            return Err(SubscribeError::UnknownConnection(connection));
        }

        let variable = self
            .directory
            .find_by_name(name)
            .ok_or_else(|| SubscribeError::UnknownVariable(name.to_string()))?;
        let module = self
            .directory
            .get(variable)
            .map(|v| v.module)
            .ok_or_else(|| SubscribeError::UnknownVariable(name.to_string()))?;

        let Some(unit) = self.registry.get(module).map(|m| m.unit()) else {
            return Err(SubscribeError::UnknownVariable(name.to_string()));
        };
        if self
            .directory
            .resolve_symbol(variable, |method, var_type| unit.resolve(method, var_type))
            .is_none()
        {
            return Err(SubscribeError::Unresolvable(name.to_string()));
        }

        self.registry.acquire(module);
        let id = self.subscriptions.insert(NewSubscription {
            client_id: client_id.to_string(),
            connection,
            variable,
            module,
            arg: arg.map(str::to_string),
            once,
        });
        if let Some(entry) = self.connections.get_mut(&connection) {
            entry.subscriptions.push(id);
        }
        debug!(
            "Connection {} subscribed {} to {}{}",
            connection,
            client_id,
            name,
            if once { " once" } else { "" }
        );
        Ok(id)
    }

    /// What to load for `name` if its module was unloaded
    fn pending_load(&self, name: &str) -> Option<PendingLoad> {
        if self.directory.find_by_name(name).is_some() {
            return None;
        }
        let origin = self.registry.origin_of(name)?.clone();
        Some(PendingLoad {
            preparer: self.registry.preparer(),
            origin,
            gate: self.load_gate.clone(),
        })
    }

    fn install(&mut self, prepared: PreparedModule, name: &str) -> Result<(), SubscribeError> {
        match self.registry.install(prepared, &mut self.directory) {
            Ok(_) => Ok(()),
            Err(LoadError::AlreadyLoaded(_)) => Ok(()),
            Err(source) => Err(SubscribeError::Load {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Detach a subscription from its connection and module
    ///
    /// The module is not unloaded here even if it becomes idle; the
    /// scheduler sweeps idle modules at the end of each tick.
    pub fn remove_subscription(&mut self, id: SubscriptionId) -> bool {
        let Some(sub) = self.subscriptions.remove(id) else {
            return false;
        };
        if let Some(entry) = self.connections.get_mut(&sub.connection) {
            entry.subscriptions.retain(|s| *s != id);
        }
        self.registry.release(sub.module);
        true
    }

    /// Forget a connection and everything it subscribed to
    ///
    /// Returns the number of subscriptions removed.
    pub fn drop_connection(&mut self, id: ConnectionId) -> usize {
        let Some(entry) = self.connections.remove(&id) else {
            return 0;
        };
        let mut removed = 0;
        for sub in entry.subscriptions {
            if let Some(sub) = self.subscriptions.remove(sub) {
                self.registry.release(sub.module);
                removed += 1;
            }
        }
        debug!("Connection {} dropped with {} subscriptions", id, removed);
        removed
    }

    /// Unload every module nobody holds
    pub fn sweep_idle(&mut self) -> usize {
        self.registry.sweep_idle(&mut self.directory)
    }

    pub fn client_count(&self, module: ModuleId) -> Option<usize> {
        self.registry.get(module).map(|m| m.clients())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_subscriptions(&self, id: ConnectionId) -> &[SubscriptionId] {
        self.connections
            .get(&id)
            .map(|entry| entry.subscriptions.as_slice())
            .unwrap_or(&[])
    }

    /// Release every connection and module
    ///
    /// Dropping the outboxes tells connection tasks to close their sockets.
    pub fn shutdown(&mut self) {
        let connections: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in connections {
            self.drop_connection(id);
        }
        if !self.subscriptions.is_empty() {
            warn!(
                "{} subscriptions had no connection at shutdown",
                self.subscriptions.len()
            );
            for id in self.subscriptions.iter().map(|s| s.id).collect::<Vec<_>>() {
                self.remove_subscription(id);
            }
        }
        self.registry.unload_all(&mut self.directory);
    }
}

/// Subscribe through the shared state, reloading the variable's module
/// through the registry's catalog if it was unloaded for lack of clients
///
/// The module is opened and initialized on the blocking pool with the
/// state unlocked. Registering it and creating the subscription happen in
/// one critical section, so the idle sweep cannot unload it in between.
pub async fn subscribe_shared(
    shared: &SharedState,
    connection: ConnectionId,
    client_id: &str,
    name: &str,
    arg: Option<&str>,
    once: bool,
) -> Result<SubscriptionId, SubscribeError> {
    let pending = lock(shared).pending_load(name);
    let Some(PendingLoad {
        preparer,
        origin,
        gate,
    }) = pending
    else {
        return lock(shared).subscribe(connection, client_id, name, arg, once);
    };

    let _loading = gate.lock_owned().await;
    // Another subscriber may have brought the module back while we waited
    let present = lock(shared).directory.find_by_name(name).is_some();
    let mut prepared = None;
    if !present {
        debug!("Reloading {} for variable {}", origin, name);
        let registry_state = shared.clone();
        let result = tokio::task::spawn_blocking(move || {
            preparer.prepare(&origin, |module| {
                lock(&registry_state).registry.find_by_name(module).is_some()
            })
        })
        .await
        .map_err(|_| SubscribeError::Interrupted(name.to_string()))?;

        match result {
            Ok(module) => prepared = Some(module),
            Err(LoadError::AlreadyLoaded(_)) => {}
            Err(source) => {
                return Err(SubscribeError::Load {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    let mut state = lock(shared);
    if let Some(module) = prepared {
        state.install(module, name)?;
    }
    state.subscribe(connection, client_id, name, arg, once)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::core::template::{AcceptAll, LayoutTemplate, TemplateRefs};
    use sensd_core::{
        BoxedModule, Callable, ModuleLoader, StaticModule, Value, VarType,
    };
    use sensd_core::OUTBOX_CAPACITY;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::{channel, Receiver};

    /// Loader for tests that never finds anything on disk
    pub(crate) struct NoFiles;

    impl ModuleLoader for NoFiles {
        fn accepts(&self, _path: &Path) -> bool {
            false
        }

        fn open(&self, path: &Path) -> Result<BoxedModule, LoadError> {
            Err(LoadError::NotFound(path.to_path_buf()))
        }
    }

    pub(crate) fn battery() -> BoxedModule {
        Box::new(
            StaticModule::new("battery")
                .variable(
                    "battper",
                    0,
                    VarType::VARIABLE_STR | VarType::ARG_STR,
                    Callable::with_str(|_| Value::text("42")),
                )
                .variable(
                    "battbar",
                    5,
                    VarType::VARIABLE_BAR,
                    Callable::no_arg(|| Value::Level(42)),
                )
                .declare("battbroken", "no_such_method", 5, VarType::VARIABLE_STR),
        )
    }

    pub(crate) fn state_with(template: Arc<dyn TemplateRefs>) -> DaemonState {
        let settings = Arc::new(Settings::default());
        let mut registry = ModuleRegistry::new(Arc::new(NoFiles), template, settings);
        registry.register_builtin("battery", battery);
        let mut state = DaemonState::new(registry);
        state.registry.load_builtins(&mut state.directory);
        state
    }

    pub(crate) fn state() -> DaemonState {
        state_with(Arc::new(AcceptAll))
    }

    pub(crate) fn connect(state: &mut DaemonState) -> (ConnectionId, Receiver<String>) {
        let (tx, rx) = channel(OUTBOX_CAPACITY);
        let id = ConnectionId::new();
        state.register_connection(id, tx);
        (id, rx)
    }

    fn battery_id(state: &DaemonState) -> ModuleId {
        state.registry.find_by_name("battery").unwrap()
    }

    #[test]
    fn test_subscribe_counts_clients() {
        let mut state = state();
        let (conn, _rx) = connect(&mut state);
        state.subscribe(conn, "1", "battper", None, false).unwrap();
        state.subscribe(conn, "2", "battbar", None, false).unwrap();

        let module = battery_id(&state);
        assert_eq!(state.client_count(module), Some(2));
        assert_eq!(state.subscriptions.count_for_module(module), 2);
        assert_eq!(state.connection_subscriptions(conn).len(), 2);
    }

    #[test]
    fn test_subscribe_errors() {
        let mut state = state();
        let (conn, _rx) = connect(&mut state);
        assert!(matches!(
            state.subscribe(conn, "1", "nosuchvar", None, false),
            Err(SubscribeError::UnknownVariable(_))
        ));
        assert!(matches!(
            state.subscribe(conn, "1", "battbroken", None, false),
            Err(SubscribeError::Unresolvable(_))
        ));
        assert!(matches!(
            state.subscribe(ConnectionId::new(), "1", "battper", None, false),
            Err(SubscribeError::UnknownConnection(_))
        ));
        assert_eq!(state.client_count(battery_id(&state)), Some(0));
        assert!(state.subscriptions.is_empty());
    }

    #[test]
    fn test_drop_connection_releases_clients() {
        let mut state = state();
        let (a, _rx_a) = connect(&mut state);
        let (b, _rx_b) = connect(&mut state);
        state.subscribe(a, "1", "battper", None, false).unwrap();
        state.subscribe(a, "2", "battbar", None, false).unwrap();
        state.subscribe(b, "1", "battper", Some("BAT1"), false).unwrap();

        assert_eq!(state.drop_connection(a), 2);
        let module = battery_id(&state);
        assert_eq!(state.client_count(module), Some(1));
        assert_eq!(state.connection_count(), 1);
        // Dropping twice is harmless
        assert_eq!(state.drop_connection(a), 0);

        state.drop_connection(b);
        assert_eq!(state.client_count(module), Some(0));
        assert_eq!(state.sweep_idle(), 1);
        assert!(state.registry.find_by_name("battery").is_none());
    }

    #[tokio::test]
    async fn test_subscribe_reloads_unloaded_module() {
        let mut state = state();
        assert_eq!(state.sweep_idle(), 1);
        assert!(state.directory.find_by_name("battper").is_none());
        let (conn, _rx) = connect(&mut state);
        // Without the shared path nothing is loaded
        assert!(matches!(
            state.subscribe(conn, "1", "battper", None, false),
            Err(SubscribeError::UnknownVariable(_))
        ));

        let shared = state.into_shared();
        subscribe_shared(&shared, conn, "1", "battper", None, false).await.unwrap();
        subscribe_shared(&shared, conn, "2", "battbar", None, false).await.unwrap();
        let state = lock(&shared);
        assert_eq!(state.client_count(battery_id(&state)), Some(2));
        assert_eq!(state.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_shared_unknown_variable() {
        let mut state = state();
        let (conn, _rx) = connect(&mut state);
        let shared = state.into_shared();
        assert!(matches!(
            subscribe_shared(&shared, conn, "1", "nosuchvar", None, false).await,
            Err(SubscribeError::UnknownVariable(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reload_initializes_with_state_unlocked() {
        static STARTED: AtomicBool = AtomicBool::new(false);
        static RELEASED: AtomicBool = AtomicBool::new(true);
        let mut state = state();
        state.registry.register_builtin("sluggish", || {
            Box::new(
                StaticModule::new("sluggish")
                    .variable(
                        "slowvar",
                        1,
                        VarType::VARIABLE_STR,
                        Callable::no_arg(|| Value::text("1")),
                    )
                    .on_init(|| {
                        STARTED.store(true, Ordering::SeqCst);
                        while !RELEASED.load(Ordering::SeqCst) {
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        Ok(())
                    }),
            )
        });
        let DaemonState { registry, directory, .. } = &mut state;
        registry.load_builtin("sluggish", directory).unwrap();
        state.sweep_idle();
        assert!(state.directory.find_by_name("slowvar").is_none());

        let (conn, _rx) = connect(&mut state);
        let shared = state.into_shared();
        STARTED.store(false, Ordering::SeqCst);
        RELEASED.store(false, Ordering::SeqCst);

        let task_state = shared.clone();
        let task = tokio::spawn(async move {
            subscribe_shared(&task_state, conn, "1", "slowvar", None, false).await
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while !STARTED.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Init is still running, yet the state is free for everyone else
        assert!(shared.try_lock().is_ok());
        assert_eq!(lock(&shared).connection_count(), 1);

        RELEASED.store(true, Ordering::SeqCst);
        task.await.unwrap().unwrap();
        assert_eq!(lock(&shared).subscriptions.len(), 1);
    }

    #[test]
    fn test_unreferenced_variable_is_unknown() {
        let mut state = state_with(Arc::new(LayoutTemplate::parse("${battbar}")));
        let (conn, _rx) = connect(&mut state);
        assert!(matches!(
            state.subscribe(conn, "1", "battper", None, false),
            Err(SubscribeError::UnknownVariable(_))
        ));
        assert!(state.subscribe(conn, "1", "battbar", None, false).is_ok());
    }

    #[test]
    fn test_send_to_full_outbox_fails() {
        let mut state = state();
        let (conn, mut rx) = connect(&mut state);
        for _ in 0..OUTBOX_CAPACITY {
            assert!(state.send(conn, "x\r\n".into()));
        }
        assert!(!state.send(conn, "y\r\n".into()));

        // Draining makes room again
        rx.try_recv().unwrap();
        assert!(state.send(conn, "z\r\n".into()));
    }

    #[test]
    fn test_send_to_closed_outbox_fails() {
        let mut state = state();
        let (conn, rx) = connect(&mut state);
        assert!(state.send(conn, "x\r\n".into()));
        drop(rx);
        assert!(!state.send(conn, "y\r\n".into()));
        assert!(!state.send(ConnectionId::new(), "z\r\n".into()));
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut state = state();
        let (conn, mut rx) = connect(&mut state);
        state.subscribe(conn, "1", "battper", None, false).unwrap();

        state.shutdown();
        assert_eq!(state.connection_count(), 0);
        assert!(state.subscriptions.is_empty());
        assert!(state.registry.is_empty());
        assert!(state.directory.is_empty());
        // The outbox sender is gone, so the connection task sees the channel close
        assert!(rx.try_recv().is_err());
    }
}
