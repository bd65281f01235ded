//! HTTP health endpoint using Axum.
//!
//! Runs beside the socket transport so process supervisors and load balancers
//! can probe liveness without speaking the framed protocol.

use axum::{routing::get, Json, Router};
use std::net::SocketAddr;
use tether_core::HealthStatus;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

async fn handle_health() -> Json<HealthStatus> {
    Json(HealthStatus::now())
}

pub fn router() -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new().route("/health", get(handle_health)).layer(cors)
}

/// Bind and serve `/health` in the background.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_health_server(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Health endpoint listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router()).await {
            error!("Health server error: {}", e);
        }
    });

    Ok(actual_addr)
}
