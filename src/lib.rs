//! Icon generation gateway: admission control, an asynchronous job engine
//! and tiered provider fallback.

pub mod artifact;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod jobs;
pub mod orchestrator;
pub mod provider;
pub mod quota;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod ui;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::Gateway;
