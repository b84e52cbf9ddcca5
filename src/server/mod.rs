//! Thin HTTP surface over [`Gateway`].
//!
//! - `routes.rs`: handlers, one per endpoint
//! - `errors.rs`: the uniform JSON error body
//! - `identity.rs`: how a request is turned into a [`Caller`](crate::identity::Caller)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Extension, Router};
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::GatewayConfig;
use crate::gateway::Gateway;

pub mod errors;
pub mod identity;
pub mod routes;

pub use identity::{HeaderIdentityResolver, IdentityResolver};

pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub identity: Arc<dyn IdentityResolver>,
}

/// Build the full router.
pub fn build_app(gateway: Arc<Gateway>, identity: Arc<dyn IdentityResolver>) -> Router {
    let state = Arc::new(AppState { gateway, identity });
    Router::new()
        .route("/health", get(routes::health))
        .merge(routes::router())
        .layer(Extension(state))
}

/// Periodically evict finished jobs older than `ttl`.
pub fn spawn_retention_sweeper(gateway: Arc<Gateway>, ttl: Duration) -> tokio::task::JoinHandle<()> {
    let period = ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            gateway.evict_expired(ttl, Utc::now()).await;
        }
    })
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

pub async fn serve(config: GatewayConfig) -> Result<()> {
    let gateway = Gateway::new(&config)?;
    gateway.log_startup_diagnostics(&config);
    if let Some(ttl) = gateway.job_ttl() {
        info!(ttl_secs = ttl.as_secs(), "job retention sweeper enabled");
        spawn_retention_sweeper(Arc::clone(&gateway), ttl);
    }

    let app = build_app(gateway, Arc::new(HeaderIdentityResolver));
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %listener.local_addr()?, public_url = %config.public_base(), "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
