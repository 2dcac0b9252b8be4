//! HTTP surface (A3): the three `/kasa/*` routes the control-point facade
//! fronts. CORS and static file serving are left to whatever outer router
//! composes this one in.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::config::KasaDocument;
use crate::error::{ApiError, ManagerError};
use crate::facade::Handle;
use crate::manager::Status;

#[derive(Clone)]
pub struct AppState {
    pub manager: Handle,
    pub proxy: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    host: String,
    proxy: String,
    timestamp: u64,
    control: ControlBlock,
}

#[derive(Debug, Serialize)]
struct ControlBlock {
    status: Status,
}

fn status_response(proxy: &str, status: Status) -> StatusResponse {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    StatusResponse {
        host,
        proxy: proxy.to_string(),
        timestamp: crate::time::now(),
        control: ControlBlock { status },
    }
}

async fn get_status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .manager
        .status()
        .await
        .map_err(|err| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err))?;
    Ok(Json(status_response(&state.proxy, status)))
}

#[derive(Debug, Deserialize)]
struct SetQuery {
    #[serde(default)]
    point: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    pulse: Option<i64>,
    #[serde(default)]
    cause: Option<String>,
}

fn parse_state(raw: &str) -> Option<bool> {
    match raw {
        "on" | "1" => Some(true),
        "off" | "0" => Some(false),
        _ => None,
    }
}

async fn get_set(
    State(state): State<AppState>,
    Query(query): Query<SetQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let point = query
        .point
        .ok_or_else(|| ApiError::not_found(ManagerError::UnknownPoint(String::new())))?;
    let raw_state = query
        .state
        .ok_or_else(|| ApiError::bad_request(ManagerError::InvalidState(String::new())))?;
    let on = parse_state(&raw_state)
        .ok_or_else(|| ApiError::bad_request(ManagerError::InvalidState(raw_state.clone())))?;
    let pulse = query.pulse.unwrap_or(0);
    let cause = query.cause.unwrap_or_else(|| "http".to_string());

    let outcome = state
        .manager
        .set(&point, on, pulse, &cause)
        .await
        .map_err(|err| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err))?;

    let status = outcome.map_err(|err| match err {
        ManagerError::UnknownPoint(_) => ApiError::not_found(err),
        ManagerError::InvalidPulse | ManagerError::InvalidState(_) => ApiError::bad_request(err),
    })?;

    Ok(Json(status_response(&state.proxy, status)))
}

async fn get_config(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let document = state
        .manager
        .get_config()
        .await
        .map_err(|err| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err))?;
    Ok(Json(document))
}

async fn post_config(
    State(state): State<AppState>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let document = KasaDocument::from_json(&body).map_err(ApiError::bad_request)?;
    state
        .manager
        .set_config(document)
        .await
        .map_err(|err| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err))?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/kasa/status", get(get_status))
        .route("/kasa/set", get(get_set))
        .route("/kasa/config", get(get_config).post(post_config))
        .with_state(state)
}
