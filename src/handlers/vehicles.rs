use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{
    error::{AppError, Result},
    middleware_layer::auth::VendorSession,
    services::vendor,
    state::AppState,
};

/// Lists the signed-in account's vehicles.
pub async fn list_vehicles(
    State(state): State<AppState>,
    Extension(session): Extension<VendorSession>,
) -> Result<Response> {
    let (_, region) = state
        .config
        .region(session.region.as_deref())
        .ok_or_else(|| AppError::Misconfigured("No vendor region configured".to_string()))?;

    let vehicles = vendor::list_vehicles(&state, region, &session.access_token).await?;
    tracing::debug!("🚗 Listed {} vehicles", vehicles.len());

    Ok((StatusCode::OK, Json(serde_json::json!({ "data": vehicles }))).into_response())
}

/// Liveness probe.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "vfdash gateway" }))
}
