//! HTTP API for guests, watchmen and administrators
//!
//! JSON bodies with a `{"success": bool, ...}` envelope. Guest endpoints are
//! open; watchman and admin endpoints require a bearer token that maps to a
//! capability. Also serves `/metrics` (Prometheus) and `/health`.

use crate::domain::error::GateError;
use crate::domain::pass::{decode_image, encode_image, EntryCode, Plate};
use crate::infra::config::Config;
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::checkpoint::Checkpoint;
use crate::services::history::{self, HistoryQuery, PassSummary};
use crate::services::lifecycle::EntryCapture;
use crate::services::recognition::{scan_cancel_pair, ScanCancel, ScanHandle};
use anyhow::Context;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_CHECKPOINT_ID: &str = "default";

/// What a bearer token may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Capability {
    Checkpoint,
    /// Admin tokens also hold `Checkpoint`
    Admin,
}

/// Bearer token to capability mapping
#[derive(Debug, Default)]
pub struct TokenAuth {
    tokens: FxHashMap<String, Capability>,
}

impl TokenAuth {
    pub fn new(checkpoint_tokens: &[String], admin_tokens: &[String]) -> Self {
        let mut tokens = FxHashMap::default();
        for token in checkpoint_tokens.iter().filter(|t| !t.is_empty()) {
            tokens.insert(token.clone(), Capability::Checkpoint);
        }
        for token in admin_tokens.iter().filter(|t| !t.is_empty()) {
            tokens.insert(token.clone(), Capability::Admin);
        }
        Self { tokens }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.checkpoint_tokens(), config.admin_tokens())
    }

    /// Check the request's bearer token holds `required`
    pub fn authorize(&self, headers: &HeaderMap, required: Capability) -> Result<Capability, ApiError> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or(ApiError::Unauthorized)?;
        let granted = *self.tokens.get(token).ok_or(ApiError::Unauthorized)?;
        if granted < required {
            return Err(ApiError::Forbidden);
        }
        Ok(granted)
    }
}

/// Scans currently running, one per checkpoint id
#[derive(Clone, Default)]
pub struct ActiveScans {
    inner: Arc<Mutex<FxHashMap<String, (u64, ScanHandle)>>>,
    next_id: Arc<AtomicU64>,
}

/// Registration of a running scan. Dropping it frees the checkpoint.
pub struct ScanGuard {
    scans: ActiveScans,
    checkpoint_id: String,
    scan_id: u64,
    cancel: ScanCancel,
}

impl ScanGuard {
    pub fn cancel_flag(&mut self) -> &mut ScanCancel {
        &mut self.cancel
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let mut scans = self.scans.inner.lock();
        if scans.get(&self.checkpoint_id).is_some_and(|(id, _)| *id == self.scan_id) {
            scans.remove(&self.checkpoint_id);
        }
    }
}

impl ActiveScans {
    /// Claim `checkpoint_id` for a new scan
    pub fn begin(&self, checkpoint_id: &str) -> Result<ScanGuard, GateError> {
        let mut scans = self.inner.lock();
        if scans.contains_key(checkpoint_id) {
            return Err(GateError::ScanInProgress(checkpoint_id.to_string()));
        }
        let scan_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (handle, cancel) = scan_cancel_pair();
        scans.insert(checkpoint_id.to_string(), (scan_id, handle));
        Ok(ScanGuard { scans: self.clone(), checkpoint_id: checkpoint_id.to_string(), scan_id, cancel })
    }

    /// Request cancellation of the scan at `checkpoint_id`
    pub fn cancel(&self, checkpoint_id: &str) -> bool {
        match self.inner.lock().get(checkpoint_id) {
            Some((_, handle)) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, checkpoint_id: &str) -> bool {
        self.inner.lock().contains_key(checkpoint_id)
    }
}

/// Shared state of the API server
pub struct ApiState {
    checkpoint: Arc<Checkpoint>,
    auth: TokenAuth,
    scans: ActiveScans,
    site_id: String,
    max_body_bytes: usize,
    max_wait: Duration,
}

impl ApiState {
    pub fn new(checkpoint: Arc<Checkpoint>, config: &Config) -> Self {
        Self {
            checkpoint,
            auth: TokenAuth::from_config(config),
            scans: ActiveScans::default(),
            site_id: config.site_id().to_string(),
            max_body_bytes: config.max_body_bytes(),
            max_wait: config.status_max_wait(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("missing or unknown bearer token")]
    Unauthorized,
    #[error("token lacks the required capability")]
    Forbidden,
    #[error("{0}")]
    BadRequest(String),
    #[error("request body too large")]
    PayloadTooLarge,
    #[error("no such endpoint")]
    NotFound,
}

/// HTTP status for a domain error
pub fn status_for(err: &GateError) -> StatusCode {
    match err {
        GateError::NotFound(_) | GateError::UnknownPlate(_) => StatusCode::NOT_FOUND,
        GateError::AlreadyProcessed { .. }
        | GateError::InvalidTransition { .. }
        | GateError::PlateAlreadyActive { .. }
        | GateError::Conflict(_)
        | GateError::ScanInProgress(_)
        | GateError::ScanCancelled { .. } => StatusCode::CONFLICT,
        GateError::RecognitionExhausted { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        GateError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        GateError::Ambiguous { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        GateError::StoreUnavailable(_)
        | GateError::EntryCodeExhausted(_)
        | GateError::RecognizerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Gate(e) => (status_for(e), e.kind()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            ApiError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "no_route"),
        }
    }

    fn into_response(self) -> Response<Full<Bytes>> {
        let (status, kind) = self.status_and_kind();
        json_response(status, &json!({ "success": false, "error": kind, "message": self.to_string() }))
    }
}

type ApiResult = Result<Response<Full<Bytes>>, ApiError>;

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response should not fail")
}

/// 200 with `success: true` merged into `body`
fn success(mut body: Value) -> ApiResult {
    if let Value::Object(map) = &mut body {
        map.insert("success".to_string(), Value::Bool(true));
    }
    Ok(json_response(StatusCode::OK, &body))
}

async fn read_json<T: DeserializeOwned>(req: Request<hyper::body::Incoming>, limit: usize) -> Result<T, ApiError> {
    let body = Limited::new(req.into_body(), limit).collect().await.map_err(|e| {
        if e.downcast_ref::<LengthLimitError>().is_some() {
            ApiError::PayloadTooLarge
        } else {
            ApiError::BadRequest(format!("failed to read body: {e}"))
        }
    })?;
    serde_json::from_slice(&body.to_bytes()).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

fn parse_plate(raw: &str) -> Result<Plate, ApiError> {
    Plate::parse(raw).ok_or_else(|| GateError::InvalidInput("plate must not be empty".to_string()).into())
}

fn parse_image(field: &str, raw: Option<String>) -> Result<Option<Bytes>, ApiError> {
    match raw {
        Some(s) if !s.trim().is_empty() => decode_image(&s)
            .map(Some)
            .map_err(|e| GateError::InvalidInput(format!("{field} is not valid base64: {e}")).into()),
        _ => Ok(None),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    guest_name: String,
    host_name: String,
    #[serde(alias = "flatNumber")]
    unit: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest {
    #[serde(alias = "code")]
    entry_code: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryRequest {
    #[serde(alias = "visitorId")]
    pass_id: Uuid,
    #[serde(alias = "plateNumber")]
    plate: String,
    #[serde(default)]
    plate_image: Option<String>,
    #[serde(default)]
    original_image: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Deserialize)]
struct PlateRequest {
    #[serde(alias = "plateNumber")]
    plate: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ScanMode {
    #[default]
    Detect,
    Entry,
    Exit,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanRequest {
    #[serde(default)]
    checkpoint_id: Option<String>,
    #[serde(default)]
    mode: ScanMode,
    #[serde(default)]
    pass_id: Option<Uuid>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    #[serde(default)]
    checkpoint_id: Option<String>,
}

fn wait_from_query(query: &str, max_wait: Duration) -> Result<Duration, ApiError> {
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == "wait_ms" {
            let ms: u64 = value
                .parse()
                .map_err(|_| ApiError::BadRequest("wait_ms must be a non-negative integer".to_string()))?;
            return Ok(Duration::from_millis(ms).min(max_wait));
        }
    }
    Ok(Duration::ZERO)
}

async fn route(req: Request<hyper::body::Incoming>, state: &ApiState) -> ApiResult {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let checkpoint = &state.checkpoint;
    let limit = state.max_body_bytes;

    match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),

        (&Method::GET, ["metrics"]) => {
            let registry = checkpoint.registry();
            let stats = history::stats(&registry.snapshot());
            let body = format_prometheus_metrics(
                checkpoint.metrics(),
                &stats,
                registry.quarantined_plates().len(),
                &state.site_id,
            );
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }

        // CORS preflight
        (&Method::OPTIONS, _) => Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
            .body(Full::new(Bytes::new()))
            .expect("static response should not fail")),

        // Guest
        (&Method::POST, ["api", "guest", "register"]) => {
            let body: RegisterRequest = read_json(req, limit).await?;
            let pass = checkpoint.register_pass(&body.guest_name, &body.host_name, &body.unit)?;
            success(json!({ "entryCode": pass.entry_code(), "passId": pass.id() }))
        }
        (&Method::GET, ["api", "guest", "status", code]) => {
            let code = EntryCode::new(code);
            let wait = wait_from_query(&query, state.max_wait)?;
            let status = checkpoint.wait_status(&code, wait).await?;
            success(json!({ "entryCode": code, "status": status }))
        }

        // Watchman
        (&Method::POST, ["api", "watchman", "verify"]) => {
            state.auth.authorize(req.headers(), Capability::Checkpoint)?;
            let body: VerifyRequest = read_json(req, limit).await?;
            let pass = checkpoint.verify_code(&EntryCode::new(&body.entry_code))?;
            success(json!({ "pass": PassSummary::from(&pass) }))
        }
        (&Method::POST, ["api", "watchman", "entry"]) => {
            state.auth.authorize(req.headers(), Capability::Checkpoint)?;
            let body: EntryRequest = read_json(req, limit).await?;
            let capture = EntryCapture {
                plate: parse_plate(&body.plate)?,
                plate_image: parse_image("plateImage", body.plate_image)?,
                original_image: parse_image("originalImage", body.original_image)?,
                confidence: body.confidence,
            };
            let pass = checkpoint.confirm_entry(body.pass_id, capture)?;
            success(json!({ "pass": PassSummary::from(&pass) }))
        }
        (&Method::POST, ["api", "watchman", "exit"]) => {
            state.auth.authorize(req.headers(), Capability::Checkpoint)?;
            let body: PlateRequest = read_json(req, limit).await?;
            let pass = checkpoint.confirm_exit(&parse_plate(&body.plate)?)?;
            success(json!({ "pass": PassSummary::from(&pass) }))
        }
        (&Method::POST, ["api", "watchman", "scan"]) => {
            state.auth.authorize(req.headers(), Capability::Checkpoint)?;
            let body: ScanRequest = read_json(req, limit).await?;
            handle_scan(state, body).await
        }
        (&Method::POST, ["api", "watchman", "scan", "cancel"]) => {
            state.auth.authorize(req.headers(), Capability::Checkpoint)?;
            let body: CancelRequest = read_json(req, limit).await?;
            let checkpoint_id = body.checkpoint_id.as_deref().unwrap_or(DEFAULT_CHECKPOINT_ID);
            let cancelled = state.scans.cancel(checkpoint_id);
            info!(checkpoint_id = %checkpoint_id, cancelled = %cancelled, "scan_cancel_requested");
            success(json!({ "cancelled": cancelled }))
        }

        // Admin
        (&Method::GET, ["api", "admin", "stats"]) => {
            state.auth.authorize(req.headers(), Capability::Admin)?;
            let stats = history::stats(&checkpoint.registry().snapshot());
            success(json!({ "stats": stats }))
        }
        (&Method::GET, ["api", "admin", "history"]) => {
            state.auth.authorize(req.headers(), Capability::Admin)?;
            let query = HistoryQuery::from_query_string(&query)?;
            let page = history::history(&checkpoint.registry().snapshot(), &query);
            success(json!(page))
        }
        (&Method::GET, ["api", "admin", "pass", code]) => {
            state.auth.authorize(req.headers(), Capability::Admin)?;
            let pass = checkpoint.registry().find_by_code(&EntryCode::new(code))?;
            success(json!({ "pass": pass }))
        }
        (&Method::GET, ["api", "admin", "quarantine"]) => {
            state.auth.authorize(req.headers(), Capability::Admin)?;
            success(json!({ "plates": checkpoint.registry().quarantined_plates() }))
        }
        (&Method::POST, ["api", "admin", "quarantine", "release"]) => {
            state.auth.authorize(req.headers(), Capability::Admin)?;
            let body: PlateRequest = read_json(req, limit).await?;
            let released = checkpoint.registry().release_plate(&parse_plate(&body.plate)?);
            success(json!({ "released": released }))
        }

        _ => Err(ApiError::NotFound),
    }
}

async fn handle_scan(state: &ApiState, body: ScanRequest) -> ApiResult {
    let checkpoint = &state.checkpoint;
    let checkpoint_id = body.checkpoint_id.as_deref().unwrap_or(DEFAULT_CHECKPOINT_ID);
    if body.mode == ScanMode::Entry && body.pass_id.is_none() {
        return Err(GateError::InvalidInput("passId is required for an entry scan".to_string()).into());
    }

    // Held until the scan finishes or the client goes away
    let mut guard = state.scans.begin(checkpoint_id)?;
    info!(checkpoint_id = %checkpoint_id, mode = ?body.mode, "scan_requested");

    match (body.mode, body.pass_id) {
        (ScanMode::Entry, Some(pass_id)) => {
            let pass = checkpoint.scan_and_enter(pass_id, guard.cancel_flag()).await?;
            success(json!({ "pass": PassSummary::from(&pass) }))
        }
        (ScanMode::Exit, _) => {
            let pass = checkpoint.scan_and_exit(guard.cancel_flag()).await?;
            success(json!({ "pass": PassSummary::from(&pass) }))
        }
        _ => {
            let recognition = checkpoint.scan_plate(guard.cancel_flag()).await?;
            success(json!({
                "found": true,
                "text": recognition.plate,
                "confidence": recognition.confidence,
                "attempt": recognition.attempt,
                "croppedImage": recognition.cropped_image.as_deref().map(encode_image),
                "originalImage": encode_image(&recognition.original_capture),
            }))
        }
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match route(req, &state).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                ApiError::Gate(gate) if gate.is_fatal() => {
                    error!(method = %method, path = %path, error = %e, "http_request_integrity_fault")
                }
                ApiError::Unauthorized | ApiError::Forbidden => {
                    warn!(method = %method, path = %path, error = %e, "http_request_denied")
                }
                _ => debug!(method = %method, path = %path, error = %e, "http_request_failed"),
            }
            e.into_response()
        }
    };

    debug!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        latency_ms = %started.elapsed().as_millis(),
        "http_request"
    );
    Ok(response)
}

/// Bind the API listener from `[server]`
pub async fn bind_api(config: &Config) -> anyhow::Result<TcpListener> {
    let addr = (config.bind_address(), config.server_port());
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API listener on {}:{}", addr.0, addr.1))
}

/// Serve the API until shutdown
pub async fn serve_api(
    listener: TcpListener,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, site = %state.site_id, "api_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(error = %e, "api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("api_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
