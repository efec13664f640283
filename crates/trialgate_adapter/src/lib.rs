#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{
    HeaderName, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, ORIGIN,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use trialgate_engines::identity_hash::DEFAULT_FINGERPRINT_SALT;
use trialgate_engines::trial_quota::normalize_cost;
use trialgate_kernel_contracts::trial::{
    MovementCost, TrialAction, DEFAULT_HARDWARE_FINGERPRINT, MAX_MOVEMENTS, UNKNOWN_CLIENT_ADDRESS,
};
use trialgate_kernel_contracts::{ContractViolation, Validate};
use trialgate_os::rate_limit::RateLimitConfig;
use trialgate_os::trial_gate::{
    TrialGateConfig, TrialGateOutcome, TrialGateRequest, TrialGateRuntime,
};
use trialgate_os::TrialGateError;
use trialgate_storage::{InMemoryKvStore, SystemTrialClock};

pub const TRIAL_ROUTE: &str = "/api/trial";
pub const HEALTH_ROUTE: &str = "/healthz";

const CF_CONNECTING_IP: HeaderName = HeaderName::from_static("cf-connecting-ip");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

pub mod error_codes {
    pub const TRIAL_EXHAUSTED: &str = "Trial exhausted";
    pub const RATE_LIMITED: &str = "Rate limited";
    pub const KV_NOT_CONFIGURED: &str = "KV_NOT_CONFIGURED";
    pub const KV_NOT_CONFIGURED_MESSAGE: &str = "Server storage not configured";
    pub const UNIDENTIFIED_CLIENT: &str = "Could not identify client";
    pub const INVALID_ACTION: &str = "Invalid action";
    pub const METHOD_NOT_ALLOWED: &str = "Method not allowed";
    pub const SERVER_ERROR: &str = "Server error";
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialCheckResponse {
    pub remaining: u32,
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialUseResponse {
    pub remaining: u32,
    pub used: u32,
    pub exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialExhaustedResponse {
    pub error: String,
    pub remaining: u32,
    pub exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitedResponse {
    pub error: String,
    pub retry_after: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreNotConfiguredResponse {
    pub error: String,
    pub message: String,
    pub remaining: u32,
    pub fallback: bool,
    pub server_configured: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackResponse {
    pub error: String,
    pub remaining: u32,
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub store_configured: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(untagged)]
pub enum TrialResponseBody {
    Checked(TrialCheckResponse),
    Used(TrialUseResponse),
    Exhausted(TrialExhaustedResponse),
    RateLimited(RateLimitedResponse),
    StoreNotConfigured(StoreNotConfiguredResponse),
    Fallback(FallbackResponse),
    Error(ErrorResponse),
}

/// Status, body and CORS origin for one trial-route answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialHttpResponse {
    pub status: StatusCode,
    pub origin: String,
    pub body: Option<TrialResponseBody>,
}

impl TrialHttpResponse {
    fn json(status: StatusCode, origin: &str, body: TrialResponseBody) -> Self {
        Self {
            status,
            origin: origin.to_string(),
            body: Some(body),
        }
    }

    fn preflight(origin: &str) -> Self {
        Self {
            status: StatusCode::OK,
            origin: origin.to_string(),
            body: None,
        }
    }

    fn error(status: StatusCode, origin: &str, error: &str) -> Self {
        Self::json(
            status,
            origin,
            TrialResponseBody::Error(ErrorResponse {
                error: error.to_string(),
            }),
        )
    }

    fn fallback(origin: &str, max_movements: u32) -> Self {
        Self::json(
            StatusCode::OK,
            origin,
            TrialResponseBody::Fallback(FallbackResponse {
                error: error_codes::SERVER_ERROR.to_string(),
                remaining: max_movements,
                fallback: true,
            }),
        )
    }

    fn from_outcome(origin: &str, outcome: TrialGateOutcome) -> Self {
        match outcome {
            TrialGateOutcome::Checked { remaining, is_new } => Self::json(
                StatusCode::OK,
                origin,
                TrialResponseBody::Checked(TrialCheckResponse { remaining, is_new }),
            ),
            TrialGateOutcome::Used {
                remaining,
                used,
                exhausted,
            } => Self::json(
                StatusCode::OK,
                origin,
                TrialResponseBody::Used(TrialUseResponse {
                    remaining,
                    used: used.units(),
                    exhausted,
                }),
            ),
            TrialGateOutcome::Exhausted { remaining } => Self::json(
                StatusCode::OK,
                origin,
                TrialResponseBody::Exhausted(TrialExhaustedResponse {
                    error: error_codes::TRIAL_EXHAUSTED.to_string(),
                    remaining,
                    exhausted: true,
                }),
            ),
            TrialGateOutcome::RateLimited { retry_after_ms } => Self::json(
                StatusCode::TOO_MANY_REQUESTS,
                origin,
                TrialResponseBody::RateLimited(RateLimitedResponse {
                    error: error_codes::RATE_LIMITED.to_string(),
                    retry_after: retry_after_ms,
                }),
            ),
        }
    }
}

impl IntoResponse for TrialHttpResponse {
    fn into_response(self) -> Response {
        let headers = cors_headers(&self.origin);
        match self.body {
            Some(body) => (self.status, headers, Json(body)).into_response(),
            None => (self.status, headers).into_response(),
        }
    }
}

pub fn cors_headers(origin: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let origin = HeaderValue::from_str(origin).unwrap_or_else(|_| HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

fn header_text<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

pub fn request_origin(headers: &HeaderMap) -> String {
    header_text(headers, &ORIGIN).unwrap_or("*").to_string()
}

/// `CF-Connecting-IP` when present, else the first hop of `X-Forwarded-For`, else `"unknown"`.
pub fn resolve_client_address(headers: &HeaderMap) -> String {
    if let Some(address) = header_text(headers, &CF_CONNECTING_IP) {
        return address.to_string();
    }
    header_text(headers, &X_FORWARDED_FOR)
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .unwrap_or(UNKNOWN_CLIENT_ADDRESS)
        .to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("request body is not valid json: {0}")]
    Body(#[from] serde_json::Error),
    #[error("request body is null")]
    NullBody,
    #[error(transparent)]
    Gate(#[from] TrialGateError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialRequestBody {
    pub action: Option<String>,
    pub hardware_fingerprint: String,
    pub cost: MovementCost,
}

impl TrialRequestBody {
    /// Reads the POST body. Non-object JSON values carry no fields; `null` is unreadable.
    pub fn parse(body: &[u8]) -> Result<Self, AdapterError> {
        let value: Value = serde_json::from_slice(body)?;
        if value.is_null() {
            return Err(AdapterError::NullBody);
        }
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_string);
        let hardware_fingerprint = ["hardwareFingerprint", "fingerprint"]
            .iter()
            .filter_map(|field| value.get(*field).and_then(Value::as_str))
            .find(|fp| !fp.is_empty())
            .unwrap_or(DEFAULT_HARDWARE_FINGERPRINT)
            .to_string();
        Ok(Self {
            action,
            hardware_fingerprint,
            cost: normalize_cost(value.get("cost")),
        })
    }
}

#[derive(Clone)]
pub struct AdapterState {
    runtime: Option<Arc<TrialGateRuntime>>,
}

impl AdapterState {
    pub fn configured(runtime: Arc<TrialGateRuntime>) -> Self {
        Self {
            runtime: Some(runtime),
        }
    }

    /// State for a deployment without a key/value backend; the trial route answers 503.
    pub fn unconfigured() -> Self {
        Self { runtime: None }
    }

    pub fn store_configured(&self) -> bool {
        self.runtime.is_some()
    }
}

/// Gate runtime over the process-local store. The store handle is returned so the caller can
/// schedule expiry sweeps.
pub fn in_memory_runtime(
    config: &AdapterConfig,
) -> Result<(Arc<TrialGateRuntime>, Arc<InMemoryKvStore>), ContractViolation> {
    let clock = Arc::new(SystemTrialClock);
    let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
    let runtime = TrialGateRuntime::new(config.gate.clone(), store.clone(), clock)?;
    Ok((Arc::new(runtime), store))
}

/// Startup configuration for the HTTP adapter, resolved once from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub bind: SocketAddr,
    pub kv_enabled: bool,
    pub purge_interval_ms: u64,
    pub gate: TrialGateConfig,
}

impl AdapterConfig {
    pub fn from_env() -> Result<Self, AdapterConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AdapterConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_raw =
            lookup("TRIALGATE_HTTP_BIND").unwrap_or_else(|| "127.0.0.1:8080".to_string());
        let bind = bind_raw
            .parse()
            .map_err(|_| AdapterConfigError::InvalidBind(bind_raw))?;
        let kv_enabled = parse_enabled_flag(lookup("TRIALGATE_KV_ENABLED"));
        let purge_interval_ms = parse_purge_interval_ms(lookup("TRIALGATE_PURGE_INTERVAL_MS"));

        let mut gate = TrialGateConfig::mvp_v1();
        gate.fingerprint_salt = lookup("TRIALGATE_FINGERPRINT_SALT")
            .unwrap_or_else(|| DEFAULT_FINGERPRINT_SALT.to_string());
        gate.rate_limit = RateLimitConfig {
            interval_ms: parse_rate_limit_ms(lookup("TRIALGATE_RATE_LIMIT_MS")),
            ..RateLimitConfig::mvp_v1()
        };
        gate.validate()?;

        Ok(Self {
            bind,
            kv_enabled,
            purge_interval_ms,
            gate,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterConfigError {
    #[error("TRIALGATE_HTTP_BIND is not a socket address: {0}")]
    InvalidBind(String),
    #[error("invalid trial gate config: {0}")]
    Gate(#[from] ContractViolation),
}

fn parse_enabled_flag(raw: Option<String>) -> bool {
    match raw {
        Some(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "off" | "no"
        ),
        None => true,
    }
}

fn parse_rate_limit_ms(raw: Option<String>) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| (100..=60_000).contains(v))
        .unwrap_or(RateLimitConfig::mvp_v1().interval_ms)
}

fn parse_purge_interval_ms(raw: Option<String>) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| (1_000..=3_600_000).contains(v))
        .unwrap_or(60_000)
}

pub fn router(state: AdapterState) -> Router {
    Router::new()
        .route(TRIAL_ROUTE, any(trial_endpoint))
        .route(HEALTH_ROUTE, get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AdapterState>) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            store_configured: state.store_configured(),
        }),
    )
}

async fn trial_endpoint(
    State(state): State<AdapterState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> TrialHttpResponse {
    handle_trial_request(&state, &method, &headers, &body).await
}

pub async fn handle_trial_request(
    state: &AdapterState,
    method: &Method,
    headers: &HeaderMap,
    body: &[u8],
) -> TrialHttpResponse {
    let origin = request_origin(headers);

    if method == Method::OPTIONS {
        return TrialHttpResponse::preflight(&origin);
    }

    let Some(runtime) = state.runtime.as_deref() else {
        error!("trial kv store not configured, answering with fallback quota");
        return TrialHttpResponse::json(
            StatusCode::SERVICE_UNAVAILABLE,
            &origin,
            TrialResponseBody::StoreNotConfigured(StoreNotConfiguredResponse {
                error: error_codes::KV_NOT_CONFIGURED.to_string(),
                message: error_codes::KV_NOT_CONFIGURED_MESSAGE.to_string(),
                remaining: MAX_MOVEMENTS,
                fallback: true,
                server_configured: false,
            }),
        );
    };

    let client_address = resolve_client_address(headers);
    if client_address == UNKNOWN_CLIENT_ADDRESS {
        warn!("trial request without a resolvable client address");
        return TrialHttpResponse::error(
            StatusCode::BAD_REQUEST,
            &origin,
            error_codes::UNIDENTIFIED_CLIENT,
        );
    }

    if method != Method::POST {
        return TrialHttpResponse::error(
            StatusCode::METHOD_NOT_ALLOWED,
            &origin,
            error_codes::METHOD_NOT_ALLOWED,
        );
    }

    match run_post(runtime, &origin, client_address, body).await {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "trial api error, failing open");
            TrialHttpResponse::fallback(&origin, runtime.max_movements())
        }
    }
}

async fn run_post(
    runtime: &TrialGateRuntime,
    origin: &str,
    client_address: String,
    body: &[u8],
) -> Result<TrialHttpResponse, AdapterError> {
    let parsed = TrialRequestBody::parse(body)?;
    let Some(action) = parsed.action.as_deref().and_then(TrialAction::parse) else {
        return Ok(TrialHttpResponse::error(
            StatusCode::BAD_REQUEST,
            origin,
            error_codes::INVALID_ACTION,
        ));
    };
    let outcome = runtime
        .run(&TrialGateRequest {
            action,
            client_address,
            hardware_fingerprint: parsed.hardware_fingerprint,
            cost: parsed.cost,
        })
        .await?;
    Ok(TrialHttpResponse::from_outcome(origin, outcome))
}
