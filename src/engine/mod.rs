// Engine: request dispatch, token pool, timers and the bounded work scheduler.

pub mod callback;
pub mod locker;
pub mod maintainer;
pub mod request;
pub mod stats;
pub mod timed_events;
pub mod work_manager;

pub use callback::CallbackExecutor;
pub use locker::{SessionMaintainerLocker, TokenCounts, TokenLimits};
pub use maintainer::SessionMaintainer;
pub use request::{RequestHandle, RequestRef};
pub use stats::{MaintainerStats, StatsSnapshot};
pub use timed_events::{EventOutcome, TimedEvents};
pub use work_manager::{Suspension, WorkManager, WorkStatus};
