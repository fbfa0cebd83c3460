//! Request-routing gateway: `/{service}/{rest}` is looked up in a routing
//! table, checked against the service's auth and rate-limit policies, and
//! relayed to the service's upstream with the service prefix stripped.

pub mod auth;
pub mod config;
pub mod error;
pub mod forward;
pub mod handlers;
pub mod metrics;
pub mod rate_limit;
pub mod routes;
pub mod server;
pub mod state;

pub use config::{Args, GatewayConfig};
pub use error::{ConfigError, GatewayError, UpstreamError};
pub use forward::Forwarder;
pub use rate_limit::{AdmissionController, SlidingWindowLimiter};
pub use routes::RoutingTable;
pub use state::AppState;
