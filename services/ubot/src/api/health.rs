//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    pub node: u32,
    /// Current timestamp (ISO 8601).
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    pub ledger: ComponentStatus,
    pub processors: ProcessorCounts,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// "ok" or "unavailable".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProcessorCounts {
    pub live: usize,
    pub finished: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

/// Liveness: the server is up.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "ubot".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node: state.node().me.number.value(),
        timestamp: Utc::now().to_rfc3339(),
        components: None,
    })
}

/// Readiness: the ledger answers. Returns 503 otherwise.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let ledger = state.node().ledger.health_check().await;
    let ledger_ok = ledger.is_ok();

    let components = ComponentHealth {
        ledger: ComponentStatus {
            status: if ledger_ok { "ok" } else { "unavailable" }.to_string(),
            message: ledger.err().map(|e| e.to_string()),
        },
        processors: ProcessorCounts {
            live: state.table().live_count().await,
            finished: state.table().finished_count().await,
        },
    };

    let response = HealthResponse {
        status: if ledger_ok { "ok" } else { "degraded" }.to_string(),
        service: "ubot".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node: state.node().me.number.value(),
        timestamp: Utc::now().to_rfc3339(),
        components: Some(components),
    };

    if ledger_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}
