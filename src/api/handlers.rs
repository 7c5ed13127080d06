//! API request handlers

use super::models::{ModelDetail, ModelSummary, PingResponse, RegisterModelRequest};
use super::routes::AppState;
use crate::config::ModelConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::ModelState;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::time::Duration;

/// Header a caller may use to override the per-request deadline
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout-ms";

/// GET /ping - Healthy when nothing is registered or at least one model serves
pub async fn ping(State(state): State<AppState>) -> Json<PingResponse> {
    let models = state.registry.list();
    let healthy = models.is_empty() || models.iter().any(|m| m.state == ModelState::Healthy);

    Json(PingResponse {
        status: if healthy { "Healthy" } else { "Degraded" }.to_string(),
    })
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /models - List registered models
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelSummary>> {
    let models: Vec<ModelSummary> = state
        .registry
        .list()
        .into_iter()
        .map(|entry| ModelSummary {
            instances: state.supervisor.instance_count(&entry.name),
            name: entry.name,
            state: entry.state,
        })
        .collect();

    crate::metrics::update_model_count(models.len());

    Json(models)
}

/// POST /models - Register a model and start its workers
pub async fn register_model(
    State(state): State<AppState>,
    payload: Result<Json<RegisterModelRequest>, JsonRejection>,
) -> GatewayResult<(StatusCode, Json<ModelSummary>)> {
    let Json(req) = payload.map_err(|e| GatewayError::Validation {
        message: e.body_text(),
    })?;

    let entry = state.registry.register(ModelConfig::from(req))?;

    // Workers come up in the background; the caller polls GET /models
    let supervisor = state.supervisor.clone();
    let name = entry.name.clone();
    tokio::spawn(async move {
        if let Err(e) = supervisor.ensure(&name).await {
            tracing::warn!(model = %name, error = %e, "Failed to start model workers");
        }
    });

    save_in_background(&state);

    crate::metrics::record_model_registered(&entry.name);
    crate::metrics::update_model_count(state.registry.count());

    Ok((
        StatusCode::CREATED,
        Json(ModelSummary {
            name: entry.name,
            state: entry.state,
            instances: 0,
        }),
    ))
}

/// GET /models/{name} - Model details, including per-worker state
pub async fn get_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> GatewayResult<Json<ModelDetail>> {
    let entry = state.registry.lookup(&name)?;
    let status = state.supervisor.status(&name).await;
    let queued = state.router.queued(&name);

    Ok(Json(ModelDetail::new(entry, status, queued)))
}

/// DELETE /models/{name} - Unregister a model; its workers drain in the background
pub async fn delete_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> GatewayResult<Json<ModelSummary>> {
    let entry = state.registry.unregister(&name)?;
    let instances = state.supervisor.instance_count(&name);
    state.router.forget(&name, entry.generation);

    let supervisor = state.supervisor.clone();
    let removed = entry.clone();
    tokio::spawn(async move {
        let model = &removed.name;
        match supervisor.terminate_entry(&removed).await {
            Ok(()) => tracing::info!(model = %model, "Model workers stopped"),
            // Never got as far as spawning workers
            Err(GatewayError::NotFound { .. }) => {}
            Err(e) => tracing::error!(model = %model, error = %e, "Failed to stop model"),
        }
    });

    save_in_background(&state);

    crate::metrics::record_model_unregistered(&name);
    crate::metrics::update_model_count(state.registry.count());

    Ok(Json(ModelSummary {
        name: entry.name,
        state: entry.state,
        instances,
    }))
}

/// POST /predictions/{name} - Run one prediction, relaying the worker's reply
pub async fn predict(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<Response> {
    let timeout = request_timeout(&headers)?;
    let request = state.router.request(&name, body, timeout);
    let reply = state.router.dispatch(request).await?;

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
    let mut response = (status, reply.body).into_response();
    if let Some(content_type) = reply
        .content_type
        .and_then(|ct| HeaderValue::from_str(&ct).ok())
    {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }

    Ok(response)
}

fn request_timeout(headers: &HeaderMap) -> GatewayResult<Option<Duration>> {
    let Some(value) = headers.get(REQUEST_TIMEOUT_HEADER) else {
        return Ok(None);
    };

    let millis = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .ok_or_else(|| GatewayError::Validation {
            message: format!(
                "{} must be a positive integer of milliseconds",
                REQUEST_TIMEOUT_HEADER
            ),
        })?;

    Ok(Some(Duration::from_millis(millis)))
}

fn save_in_background(state: &AppState) {
    let state_manager = state.state_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = state_manager.save().await {
            tracing::error!(error = %format!("{:#}", e), "Failed to save state");
        }
    });
}
