//! HTTP front door
//!
//! Thin axum layer over the admission queue plus read-only queries. Trades
//! are acknowledged at admission; staging outcomes are not reported back.

pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    Router,
    routing::{get, post},
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

pub use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/trade", post(handlers::submit_trade))
        .route("/api/health", get(handlers::health_check))
        .nest(
            "/api/v1",
            Router::new()
                .route("/positions/{user_id}", get(handlers::get_positions))
                .route("/trades/{user_id}", get(handlers::get_trades))
                .route("/portfolio/{user_id}", get(handlers::get_portfolio))
                .route("/leaderboard", get(handlers::get_leaderboard))
                .route("/stats", get(handlers::get_stats)),
        )
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn run_server(
    host: &str,
    port: u16,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind gateway");
        e
    })?;

    tracing::info!("Gateway listening on http://{}", addr);
    tracing::info!("  POST /api/trade");
    tracing::info!("  GET  /api/health");
    tracing::info!("  GET  /api/v1/positions/{{user_id}}, /api/v1/trades/{{user_id}}, /api/v1/stats");
    tracing::info!("  GET  /api/v1/portfolio/{{user_id}}, /api/v1/leaderboard");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
