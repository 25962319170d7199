// Transport abstraction: how API calls and token fetches reach the server.

pub mod http;
pub mod traits;

pub use http::{HttpTransport, RequestSigner, UnsignedRequests};
pub use traits::{ApiCall, Transport};
