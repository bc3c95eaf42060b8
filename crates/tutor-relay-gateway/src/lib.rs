//! WebSocket gateway for the tutor relay.
//!
//! Every client connection gets its own [`session::Session`] actor, which owns
//! the recognition, generation, and synthesis upstreams for that connection
//! and is torn down with it.

pub mod connection;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod session;
pub mod state;

pub use server::start_gateway;
pub use state::GatewayState;
