//! End-to-end tests against a live API server on an ephemeral port

use async_trait::async_trait;
use bytes::Bytes;
use gatepass::infra::{Config, Metrics};
use gatepass::io::{serve_api, ApiState};
use gatepass::services::recognition::{Detection, FrameSource, PlateRecognizer};
use gatepass::services::{Checkpoint, PassRegistry, RecognitionOrchestrator, RecognitionPolicy, StatusNotifier};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

const GUARD: &str = "guard-token";
const ADMIN: &str = "admin-token";

struct StaticFrame;

#[async_trait]
impl FrameSource for StaticFrame {
    async fn capture(&self) -> anyhow::Result<Option<Bytes>> {
        Ok(Some(Bytes::from_static(b"\xff\xd8jpeg")))
    }
}

/// Misses `misses` times, then reads `plate`
struct ScriptedRecognizer {
    plate: &'static str,
    misses: u32,
    calls: AtomicU32,
    latency: Duration,
}

#[async_trait]
impl PlateRecognizer for ScriptedRecognizer {
    async fn recognize(&self, _image: Bytes) -> anyhow::Result<Detection> {
        tokio::time::sleep(self.latency).await;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.misses {
            return Ok(Detection::default());
        }
        Ok(Detection { found: true, text: self.plate.to_string(), confidence: 0.88, cropped_image: None })
    }
}

struct TestServer {
    base: String,
    client: reqwest::Client,
    _shutdown: watch::Sender<bool>,
}

impl TestServer {
    async fn start(recognizer: Option<ScriptedRecognizer>) -> Self {
        let config = Config::default().with_tokens(&[GUARD], &[ADMIN]);
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(PassRegistry::in_memory(6, 64));
        let notifier = Arc::new(StatusNotifier::new(registry.clone(), 16));
        let mut checkpoint = Checkpoint::new(registry, notifier, metrics.clone());
        if let Some(recognizer) = recognizer {
            let policy = RecognitionPolicy {
                max_attempts: 5,
                inter_attempt_delay: Duration::from_millis(20),
                per_attempt_timeout: Duration::from_secs(2),
                min_confidence: None,
            };
            let orchestrator = RecognitionOrchestrator::new(Arc::new(StaticFrame), Arc::new(recognizer), policy, metrics);
            checkpoint = checkpoint.with_orchestrator(Arc::new(orchestrator));
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(ApiState::new(Arc::new(checkpoint), &config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve_api(listener, state, shutdown_rx));

        Self { base, client: reqwest::Client::new(), _shutdown: shutdown_tx }
    }

    async fn get(&self, path: &str, token: Option<&str>) -> (u16, Value) {
        let mut req = self.client.get(format!("{}{}", self.base, path));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, token: Option<&str>, body: Value) -> (u16, Value) {
        let mut req = self.client.post(format!("{}{}", self.base, path)).json(&body);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn register(&self, guest: &str) -> (String, String) {
        let (status, body) = self
            .post("/api/guest/register", None, json!({ "guestName": guest, "hostName": "R. Iyer", "flatNumber": "B-204" }))
            .await;
        assert_eq!(status, 200, "{body}");
        (body["entryCode"].as_str().unwrap().to_string(), body["passId"].as_str().unwrap().to_string())
    }
}

#[tokio::test]
async fn test_manual_visit_flow() {
    let server = TestServer::start(None).await;
    let (code, pass_id) = server.register("Asha").await;
    assert_eq!(code.len(), 6);

    let (status, body) = server.get(&format!("/api/guest/status/{code}"), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "PENDING");

    let (status, body) = server.post("/api/watchman/verify", Some(GUARD), json!({ "entryCode": code })).await;
    assert_eq!(status, 200);
    assert_eq!(body["pass"]["guestName"], "Asha");
    assert_eq!(body["pass"]["unit"], "B-204");

    let (status, body) = server
        .post("/api/watchman/entry", Some(GUARD), json!({ "passId": pass_id, "plate": "ka 01 ab 1234" }))
        .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["pass"]["status"], "INSIDE");
    assert_eq!(body["pass"]["plate"], "KA01AB1234");

    // Entry code is single-use
    let (status, body) = server.post("/api/watchman/verify", Some(GUARD), json!({ "entryCode": code })).await;
    assert_eq!(status, 409);
    assert_eq!(body["error"], "already_processed");

    let (status, body) = server.post("/api/watchman/exit", Some(GUARD), json!({ "plate": "KA01AB1234" })).await;
    assert_eq!(status, 200);
    assert_eq!(body["pass"]["status"], "EXITED");

    let (status, body) = server.post("/api/watchman/exit", Some(GUARD), json!({ "plate": "KA01AB1234" })).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "unknown_plate");

    let (status, body) = server.get("/api/admin/history?status=EXITED", Some(ADMIN)).await;
    assert_eq!(status, 200);
    assert_eq!(body["total"], 1);
    assert_eq!(body["totalPages"], 1);
    assert_eq!(body["logs"][0]["entryCode"], code.as_str());
}

#[tokio::test]
async fn test_auth_capabilities() {
    let server = TestServer::start(None).await;

    let (status, body) = server.post("/api/watchman/verify", None, json!({ "entryCode": "000000" })).await;
    assert_eq!(status, 401);
    assert_eq!(body["success"], false);

    let (status, _) = server.post("/api/watchman/verify", Some("nope"), json!({ "entryCode": "000000" })).await;
    assert_eq!(status, 401);

    let (status, _) = server.get("/api/admin/stats", Some(GUARD)).await;
    assert_eq!(status, 403);

    // Admin covers checkpoint operations
    let (status, body) = server.post("/api/watchman/verify", Some(ADMIN), json!({ "entryCode": "000000" })).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "not_found");

    let (status, body) = server.get("/api/admin/stats", Some(ADMIN)).await;
    assert_eq!(status, 200);
    assert_eq!(body["stats"]["total"], 0);
}

#[tokio::test]
async fn test_bad_requests() {
    let server = TestServer::start(None).await;

    let (status, body) = server.post("/api/guest/register", None, json!({ "guestName": "", "hostName": "x", "unit": "1" })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_input");

    let (status, _) = server.post("/api/guest/register", None, json!({ "guestName": "A" })).await;
    assert_eq!(status, 400);

    let (status, _) = server.get("/api/guest/status/123456?wait_ms=soon", None).await;
    assert_eq!(status, 400);

    let (status, body) = server.get("/api/nothing/here", None).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "no_route");

    // No camera configured
    let (status, body) = server.post("/api/watchman/scan", Some(GUARD), json!({ "mode": "exit" })).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"], "recognizer_unavailable");
}

#[tokio::test]
async fn test_status_long_poll_sees_entry() {
    let server = Arc::new(TestServer::start(None).await);
    let (code, pass_id) = server.register("Ravi").await;

    let poller = {
        let server = server.clone();
        let code = code.clone();
        tokio::spawn(async move { server.get(&format!("/api/guest/status/{code}?wait_ms=5000"), None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (status, _) = server
        .post("/api/watchman/entry", Some(GUARD), json!({ "passId": pass_id, "plate": "MH12XY0001" }))
        .await;
    assert_eq!(status, 200);

    let (status, body) = tokio::time::timeout(Duration::from_secs(3), poller).await.unwrap().unwrap();
    assert_eq!(status, 200);
    assert_eq!(body["status"], "INSIDE");
}

#[tokio::test]
async fn test_scan_entry_and_exit() {
    let recognizer =
        ScriptedRecognizer { plate: "DL3CAB0042", misses: 2, calls: AtomicU32::new(0), latency: Duration::ZERO };
    let server = TestServer::start(Some(recognizer)).await;
    let (code, pass_id) = server.register("Meera").await;

    let (status, body) = server.post("/api/watchman/scan", Some(GUARD), json!({ "mode": "entry", "passId": pass_id })).await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["pass"]["plate"], "DL3CAB0042");
    assert_eq!(body["pass"]["hasImages"], true);

    let (status, body) = server.get(&format!("/api/admin/pass/{code}"), Some(ADMIN)).await;
    assert_eq!(status, 200);
    assert!(body["pass"]["originalImage"].is_string());

    let (status, body) = server.post("/api/watchman/scan", Some(GUARD), json!({ "mode": "exit" })).await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["pass"]["status"], "EXITED");

    let (status, body) = server.post("/api/watchman/scan", Some(GUARD), json!({ "mode": "entry" })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_input");
}

#[tokio::test]
async fn test_scan_exclusive_and_cancellable() {
    let recognizer = ScriptedRecognizer {
        plate: "DL3CAB0042",
        misses: u32::MAX,
        calls: AtomicU32::new(0),
        latency: Duration::from_millis(150),
    };
    let server = Arc::new(TestServer::start(Some(recognizer)).await);

    let first = {
        let server = server.clone();
        tokio::spawn(async move {
            server.post("/api/watchman/scan", Some(GUARD), json!({ "checkpointId": "gate-1", "mode": "detect" })).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, body) = server.post("/api/watchman/scan", Some(GUARD), json!({ "checkpointId": "gate-1" })).await;
    assert_eq!(status, 409);
    assert_eq!(body["error"], "scan_in_progress");

    let (status, body) = server.post("/api/watchman/scan/cancel", Some(GUARD), json!({ "checkpointId": "gate-1" })).await;
    assert_eq!(status, 200);
    assert_eq!(body["cancelled"], true);

    let (status, body) = tokio::time::timeout(Duration::from_secs(3), first).await.unwrap().unwrap();
    assert_eq!(status, 409);
    assert_eq!(body["error"], "scan_cancelled");

    // Checkpoint is free again once the scan has ended
    let (_, body) = server.post("/api/watchman/scan/cancel", Some(GUARD), json!({ "checkpointId": "gate-1" })).await;
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let server = TestServer::start(None).await;
    server.register("Ira").await;

    let resp = reqwest::get(format!("{}/metrics", server.base)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("gatepass_passes{site=\"gatepass\",status=\"PENDING\"} 1"), "{text}");
}

#[tokio::test]
async fn test_legacy_field_names_accepted() {
    let server = TestServer::start(None).await;
    let (code, pass_id) = server.register("Kabir").await;

    let (status, body) = server.post("/api/watchman/verify", Some(GUARD), json!({ "code": code })).await;
    assert_eq!(status, 200, "{body}");

    let (status, body) = server
        .post("/api/watchman/entry", Some(GUARD), json!({ "visitorId": pass_id, "plateNumber": "TN09BZ7777" }))
        .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["pass"]["plate"], "TN09BZ7777");

    let (status, body) = server.post("/api/watchman/exit", Some(GUARD), json!({ "plateNumber": "TN09BZ7777" })).await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["pass"]["status"], "EXITED");
}
