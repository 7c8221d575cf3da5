use std::net::SocketAddr;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::broker::BrokerSnapshot;

#[derive(Clone)]
pub struct DashboardState {
    pub snapshot: watch::Receiver<BrokerSnapshot>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    workers: usize,
    in_flight_jobs: usize,
}

/// Read-only broker status API.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/workers", get(workers_handler))
        .route("/api/services", get(services_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = served {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn health_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let snapshot = state.snapshot.borrow();
    Json(HealthResponse {
        status: "ok",
        workers: snapshot.workers.len(),
        in_flight_jobs: snapshot.in_flight_jobs,
    })
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.snapshot.borrow().clone())
}

async fn workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.snapshot.borrow().workers.clone())
}

async fn services_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.snapshot.borrow().services.clone())
}
