//! Thin HTTP surface over the control plane.

use crate::control::{GatewayControl, ReconfigureRequest};
use crate::raw_events::EventFilter;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            message: message.into(),
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("internal_error", e.to_string())),
    )
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub event_type: Option<String>,
    pub message_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl SearchQuery {
    fn filter(&self) -> EventFilter {
        EventFilter {
            event_type: self.event_type.clone(),
            message_id: self.message_id.clone(),
            from: self.from,
            to: self.to,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResendRequest {
    pub ids: Vec<i64>,
    #[serde(default)]
    pub force_message_id: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResendAllRequest {
    #[serde(default)]
    pub filter: EventFilter,
    #[serde(default)]
    pub force_message_id: bool,
}

pub fn router(control: Arc<GatewayControl>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/gateway/status", get(status))
        .route("/api/gateway/start", post(start_all))
        .route("/api/gateway/stop", post(stop_all))
        .route("/api/gateway/reconfigure", post(reconfigure))
        .route("/api/events", get(search_events))
        .route("/api/events/count", get(count_events))
        .route("/api/events/resend", post(resend_events))
        .route("/api/events/resend-all", post(resend_all))
        .with_state(control)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "module": "gateway",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn status(State(control): State<Arc<GatewayControl>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(control.status()).unwrap_or_default())
}

async fn start_all(State(control): State<Arc<GatewayControl>>) -> Result<StatusCode, ApiError> {
    control.start_all().await.map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_all(State(control): State<Arc<GatewayControl>>) -> StatusCode {
    control.stop_all().await;
    StatusCode::NO_CONTENT
}

async fn reconfigure(
    State(control): State<Arc<GatewayControl>>,
    Json(request): Json<ReconfigureRequest>,
) -> Result<StatusCode, ApiError> {
    control.reconfigure(request).await.map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn search_events(
    State(control): State<Arc<GatewayControl>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    let events = control
        .search_events(&query.filter(), limit, offset)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "events": events })))
}

async fn count_events(
    State(control): State<Arc<GatewayControl>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = control
        .count_events(&query.filter())
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "count": count })))
}

async fn resend_events(
    State(control): State<Arc<GatewayControl>>,
    Json(request): Json<ResendRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = control
        .resend_events(&request.ids, request.force_message_id)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

async fn resend_all(
    State(control): State<Arc<GatewayControl>>,
    Json(request): Json<ResendAllRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = control
        .resend_all_by_filter(&request.filter, request.force_message_id)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}
