pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod transport;

pub use api::{ConnectionState, Credentials, Descriptor, SessionState};
pub use config::MaintainerConfig;
pub use engine::{CallbackExecutor, RequestHandle, SessionMaintainer, WorkManager};
pub use error::{ApiError, TimeoutKind, TransportErrorKind};
pub use transport::{HttpTransport, Transport};
