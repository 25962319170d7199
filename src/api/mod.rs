// API data model: credentials, tokens, observable states and call descriptors.

pub mod connection_state;
pub mod credentials;
pub mod descriptor;
pub mod session_state;
pub mod token;

pub use connection_state::ConnectionState;
pub use credentials::Credentials;
pub use descriptor::{ApiResponse, Descriptor, JsonResponse, SessionCall, TokenlessCall};
pub use session_state::SessionState;
pub use token::{SessionTokenData, SessionTokenResponse};
