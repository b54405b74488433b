pub mod config;
pub mod dedupe;
pub mod mask;
pub mod metrics;
pub mod retry;
pub mod telemetry;
pub mod types;
