//! Gatewatch HTTP API
//!
//! Serves log queries, dashboard aggregates, CSV exports, the setup
//! wizard, and the controller/threat configuration surfaces as JSON
//! under `/api`.

pub mod annotate;
pub mod error;
pub mod filter;
pub mod routes;
pub mod state;

use std::net::SocketAddr;

pub use state::AppState;

/// Create the web application router.
pub fn create_app(state: AppState) -> axum::Router {
    routes::build_router(state)
}

/// Start the API server.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = create_app(state);
    tracing::info!("API server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
