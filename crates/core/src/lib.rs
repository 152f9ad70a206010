//! Rights, requests, cancellation, signals, and error definitions.
//!
//! Foundation crate -- no async or I/O dependencies.

pub mod cancel;
pub mod error;
pub mod executor;
pub mod listener;
pub mod scheduler;
pub mod signal;
pub mod types;

pub use cancel::{CancelToken, CancellationSource};
pub use error::{ArbiterError, ArbiterResult, ErrorCollector};
pub use executor::{
    Cleanup, ContextAwareExecutor, SyncExecutor, Task, TaskExecutor, TaskExecutorExt, TaskHandle,
    TaskOutcome,
};
pub use listener::{ListenerRef, ListenerRegistry, OnceListener, OneShotListeners};
pub use scheduler::TaskScheduler;
pub use signal::ReleaseSignal;
pub use types::{AccessMode, AccessRequest, AccessState, Right, RightsSnapshot, Segment};
