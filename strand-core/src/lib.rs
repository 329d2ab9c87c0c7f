// Core library for the strand runtime
// This crate contains the workers, execution contexts, dispatcher and mailboxes

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod mailbox;
pub mod runtime;
pub mod worker;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use context::{ContextId, ContextRegistry, current_context};
pub use dispatcher::Dispatcher;
pub use error::*;
pub use mailbox::{HandlerId, Mailbox};
pub use runtime::Runtime;
pub use worker::{WorkerId, WorkerPool, WorkerStats};
