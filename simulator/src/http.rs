//! Local control API for poking the simulator while it runs.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::warn;

use crate::{error::SimulatorError, simulator::Simulator};

type AppState = Arc<Simulator>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(simulator: Arc<Simulator>) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/room", post(handle_set_room))
        .route("/api/humidity", post(handle_set_humidity))
        .route("/api/capture/start", post(handle_capture_start))
        .route("/api/capture/stop", post(handle_capture_stop))
        .route("/api/capture/interval", post(handle_capture_interval))
        .route("/api/events", post(handle_send_event))
        .route("/api/reported", post(handle_update_reported))
        .with_state(simulator)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.snapshot())
}

async fn handle_set_room(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let temperature = match finite_value(&params, "value") {
        Ok(value) => value,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    state.room(temperature);
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_humidity(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let humidity = match finite_value(&params, "value") {
        Ok(value) if (0.0..=100.0).contains(&value) => value,
        Ok(_) => {
            return error_response(StatusCode::BAD_REQUEST, "Humidity must be between 0 and 100")
        }
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    state.humidity(humidity);
    handle_get_status(State(state)).await.into_response()
}

async fn handle_capture_start(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let interval_ms = if params.contains_key("intervalMs") {
        match query_value::<u64>(&params, "intervalMs") {
            Ok(value) if value > 0 => value,
            Ok(_) => return error_response(StatusCode::BAD_REQUEST, "intervalMs must be > 0"),
            Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
        }
    } else {
        state.snapshot().capture_interval_ms
    };

    if let Err(err) = state.start_capture(interval_ms) {
        return simulator_error_response(&err);
    }
    handle_get_status(State(state)).await.into_response()
}

async fn handle_capture_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.end_capture().await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_capture_interval(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let interval_ms = match query_value::<u64>(&params, "value") {
        Ok(value) if value > 0 => value,
        Ok(_) => return error_response(StatusCode::BAD_REQUEST, "value must be > 0"),
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    state.change_capture_interval(interval_ms);
    handle_get_status(State(state)).await.into_response()
}

async fn handle_send_event(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match state.send_event(&body).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => simulator_error_response(&err),
    }
}

async fn handle_update_reported(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match state.update_reported_state(&body).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => simulator_error_response(&err),
    }
}

fn query_value<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    key: &str,
) -> Result<T, String> {
    let raw = params
        .get(key)
        .ok_or_else(|| format!("Missing '{key}' parameter"))?;
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("Invalid '{key}' value"))
}

/// Rejects `NaN` and infinities, which `f64::from_str` accepts.
fn finite_value(params: &HashMap<String, String>, key: &str) -> Result<f64, String> {
    let value = query_value::<f64>(params, key)?;
    if !value.is_finite() {
        return Err(format!("Invalid '{key}' value"));
    }
    Ok(value)
}

fn status_for(err: &SimulatorError) -> StatusCode {
    match err {
        SimulatorError::ConfigParse(_) | SimulatorError::Serialization(_) => {
            StatusCode::BAD_REQUEST
        }
        SimulatorError::CaptureAlreadyRunning | SimulatorError::AlreadyStarted => {
            StatusCode::CONFLICT
        }
        SimulatorError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        SimulatorError::Transport(_) => StatusCode::BAD_GATEWAY,
        SimulatorError::Capture(_) | SimulatorError::Cancelled => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn simulator_error_response(err: &SimulatorError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        warn!("control request failed: {err}");
    }
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
