//! Registry, variables, subscriptions and the scheduler

mod directory;
mod registry;
mod scheduler;
pub(crate) mod state;
mod subscription;
mod template;

pub use directory::{push_warranted, Variable, VariableDirectory, VariableId};
pub use registry::{Module, ModuleId, ModuleOrigin, ModulePreparer, ModuleRegistry, PreparedModule};
pub use scheduler::{Scheduler, TickReport};
pub use state::{lock, subscribe_shared, ConnectionId, DaemonState, SharedState, SubscribeError};
pub use subscription::{Subscription, SubscriptionId, SubscriptionTable};
pub use template::{AcceptAll, LayoutTemplate, TemplateRefs};
