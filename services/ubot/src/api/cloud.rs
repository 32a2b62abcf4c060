//! Cloud method endpoints: the external trigger plus the records peers
//! download from this node.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use ubot_id::{PoolId, ResultHash};

use super::error::ApiError;
use crate::caches::StartingContractBlob;
use crate::contract::ErrorRecord;
use crate::processor::{PoolState, ProcessorError};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/executeCloudMethod", post(execute_cloud_method))
        .route("/getState", post(get_state))
        .route("/getStartingContract/{pool_id}", get(get_starting_contract))
        .route("/getSingleStorageResult/{hash}", get(get_storage_result))
        .route("/getMultiStorageResult/{hash}", get(get_storage_result))
}

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    /// Packed starting contract, base64.
    pub contract: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub status: String,
    pub pool_id: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct ErrorsResponse {
    pub errors: Vec<ErrorRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetStateRequest {
    pub starting_contract_id: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct StateResponse {
    pub state: PoolState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorRecord>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn execute_cloud_method(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    let contract_bin = match STANDARD.decode(request.contract.trim()) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            return rejected(ErrorRecord::bad_value("contract", format!("invalid base64: {e}")));
        }
    };

    match state.table().execute(contract_bin).await {
        Ok(pool_id) => {
            info!(pool_id = %pool_id, "Cloud method accepted");
            Json(ExecuteResponse {
                status: "ok".to_string(),
                pool_id: pool_id.to_string(),
            })
            .into_response()
        }
        Err(ProcessorError::ShuttingDown) => {
            ApiError::service_unavailable("shutting_down", "node is shutting down").into_response()
        }
        Err(e) => {
            warn!(error = %e, "Cloud method rejected");
            rejected(ErrorRecord::bad_value("contract", e.to_string()))
        }
    }
}

fn rejected(record: ErrorRecord) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorsResponse {
            errors: vec![record],
        }),
    )
        .into_response()
}

async fn get_state(
    State(state): State<AppState>,
    Json(request): Json<GetStateRequest>,
) -> Result<Json<StateResponse>, ApiError> {
    let pool_id = PoolId::parse(&request.starting_contract_id)
        .map_err(|e| ApiError::bad_request("invalid_pool_id", e.to_string()))?;

    let snapshot = state
        .table()
        .snapshot(pool_id)
        .await
        .ok_or_else(|| ApiError::not_found("unknown_pool", format!("no processor for pool {pool_id}")))?;

    Ok(Json(StateResponse {
        state: snapshot.state,
        result: snapshot.result,
        errors: snapshot.errors,
    }))
}

async fn get_starting_contract(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> Result<Response, ApiError> {
    let pool_id =
        PoolId::parse(&pool_id).map_err(|e| ApiError::bad_request("invalid_pool_id", e.to_string()))?;

    let session = state
        .caches()
        .starting_contract(pool_id)
        .await
        .map_err(|e| ApiError::internal("cache_error", e.to_string()))?;

    Ok(match session {
        Some(session) => Json(StartingContractBlob::from(&session)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn get_storage_result(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Response, ApiError> {
    let hash =
        ResultHash::parse(&hash).map_err(|e| ApiError::bad_request("invalid_hash", e.to_string()))?;

    let data = state
        .caches()
        .result(hash)
        .await
        .map_err(|e| ApiError::internal("cache_error", e.to_string()))?;

    Ok(match data {
        Some(data) => ([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}
