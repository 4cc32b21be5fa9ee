//! Library surface of the gateway daemon, exposed for integration tests.

pub mod http;
pub mod state;

pub use http::router;
pub use state::AppState;
