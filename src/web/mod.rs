pub mod admin;
pub mod health;
pub mod metrics;

pub use admin::AdminApi;
pub use health::{health_endpoint, ready_endpoint};
pub use metrics::{global_metrics, metrics_endpoint, ScopedTimer};
