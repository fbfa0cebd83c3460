mod health;
mod metrics;
mod dispatch;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use dispatch::{dispatch_handler, rewrite_path, split_service_path};
