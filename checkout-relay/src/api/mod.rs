//! REST relay between the checkout client and the identification service

mod error;

pub use error::ApiError;

use crate::context::{ClientRequestContext, IDENTIFICATION_COOKIE};
use crate::provider::{IdentificationProvider, SendRequest};
use crate::session::cookies::IDENTIFICATION_COOKIES;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header::SET_COOKIE, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

pub const STORE_PATH: &str = "/api/store-fingerprint";
pub const IDENTIFY_PATH: &str = "/api/send-fingerprint";
pub const COMBINED_PATH: &str = "/api/fingerprint";
pub const CLEAR_PATH: &str = "/api/clear-fingerprint";

/// API state
pub struct ApiState {
    /// `None` when no vendor secret key was configured
    pub provider: Option<Arc<dyn IdentificationProvider>>,
}

impl ApiState {
    pub fn new(provider: Option<Arc<dyn IdentificationProvider>>) -> Self {
        Self { provider }
    }
}

/// True for payloads that carry no signals at all
pub fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Request body for the store and combined endpoints
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint_data: Option<Value>,
}

/// Signals plus the request context they arrived with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectedData {
    #[serde(default)]
    pub fingerprint_data: Value,
    #[serde(flatten)]
    pub context: ClientRequestContext,
    /// RFC 3339 time the record was assembled
    #[serde(default)]
    pub timestamp: String,
}

impl CollectedData {
    fn new(fingerprint_data: Value, headers: &HeaderMap) -> Self {
        Self {
            fingerprint_data,
            context: ClientRequestContext::from_headers(headers),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreResponse {
    pub success: bool,
    pub collected_data: CollectedData,
    /// Time spent in the handler, in milliseconds
    pub backend_latency: f64,
}

/// A previously stored record, echoed back by the client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendData {
    #[serde(default)]
    pub collected_data: Option<CollectedData>,
    #[serde(default)]
    pub backend_latency: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_data: Option<BackendData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_data: Option<Value>,
    /// This call's latency plus any latency carried over from the store step
    pub backend_latency: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub botd: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub vendor_configured: bool,
}

/// Create the API router
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(STORE_PATH, post(store_fingerprint))
        .route(IDENTIFY_PATH, post(send_fingerprint))
        .route(COMBINED_PATH, post(identify_fingerprint))
        .route(CLEAR_PATH, post(clear_fingerprint))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        vendor_configured: state.provider.is_some(),
    })
}

fn required_payload(payload: Option<Value>) -> Result<Value, ApiError> {
    payload
        .filter(|p| !is_empty_payload(p))
        .ok_or(ApiError::MissingPayload)
}

/// Store collected signals alongside the request context, without identifying yet
async fn store_fingerprint(
    headers: HeaderMap,
    body: Result<Json<StoreRequest>, JsonRejection>,
) -> Result<Json<StoreResponse>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::MalformedBody(e.body_text()))?;
    let payload = required_payload(request.fingerprint_data)?;

    let start = Instant::now();
    let collected_data = CollectedData::new(payload, &headers);
    info!(client_ip = %collected_data.context.client_ip, "Stored fingerprint data");

    Ok(Json(StoreResponse {
        success: true,
        collected_data,
        backend_latency: elapsed_ms(start),
    }))
}

/// Forward either fresh signals or a stored record to the identification service
async fn send_fingerprint(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::MalformedBody(e.body_text()))?;

    let (collected, prior_latency) = match (request.backend_data, request.fingerprint_data) {
        (Some(BackendData { collected_data: Some(collected), backend_latency }), _)
            if !is_empty_payload(&collected.fingerprint_data) =>
        {
            (collected, backend_latency.unwrap_or(0.0))
        }
        (_, Some(payload)) if !is_empty_payload(&payload) => {
            (CollectedData::new(payload, &headers), 0.0)
        }
        _ => return Err(ApiError::MissingBackendData),
    };

    identify(&state, collected, prior_latency).await
}

/// Single-call variant: capture context and identify in one request
async fn identify_fingerprint(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Result<Json<StoreRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::MalformedBody(e.body_text()))?;
    let payload = required_payload(request.fingerprint_data)?;

    identify(&state, CollectedData::new(payload, &headers), 0.0).await
}

async fn identify(
    state: &ApiState,
    collected: CollectedData,
    prior_latency: f64,
) -> Result<Response, ApiError> {
    let provider = state.provider.as_ref().ok_or(ApiError::MissingApiKey)?;

    let start = Instant::now();
    let request = SendRequest::new(collected.fingerprint_data, collected.context);
    let sent = provider.send(&request).await?;
    let backend_latency = prior_latency + elapsed_ms(start);

    info!(
        provider = provider.name(),
        visitor_id = ?sent.visitor_id,
        request_id = ?sent.request_id,
        backend_latency,
        "Identification complete"
    );

    let mut response = Json(IdentifyResponse {
        success: true,
        visitor_id: sent.visitor_id,
        agent_data: sent.agent_data,
        backend_latency,
        botd: sent.botd,
        request_id: sent.request_id,
    })
    .into_response();

    append_cookies(&mut response, &sent.set_cookies);
    Ok(response)
}

/// Expire the identification cookies on the caller's side
async fn clear_fingerprint() -> Response {
    let expired: Vec<String> = IDENTIFICATION_COOKIES
        .iter()
        .map(|name| {
            format!("{name}=; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT; SameSite=Lax")
        })
        .collect();

    debug!(cookie = IDENTIFICATION_COOKIE, "Clearing identification cookies");

    let mut response = Json(serde_json::json!({ "success": true })).into_response();
    append_cookies(&mut response, &expired);
    response
}

fn append_cookies(response: &mut Response, cookies: &[String]) {
    for cookie in cookies {
        match HeaderValue::from_str(cookie) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => debug!(error = %e, "Dropping unrepresentable Set-Cookie value"),
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
