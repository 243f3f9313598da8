//! Mock Plate Recognition Service
//!
//! Simulates the `/detect` endpoint for local testing.
//!
//! Behavior:
//! 1. Listens on configurable port (default 5000)
//! 2. Accepts `POST /detect` with any body (the multipart frame is not decoded)
//! 3. Answers `found: false` for the first `--fail-first` calls, then returns
//!    the configured plate with the configured confidence
//! 4. `--reset-after` restarts the miss countdown every N calls, so repeated
//!    scans each go through the retry loop
//!
//! Usage:
//!   cargo run --bin mock-recognizer -- --port 5000 --plate "KA01AB1234" --fail-first 2

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "mock-recognizer")]
#[command(about = "Mock plate recognition service for local simulation")]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "5000")]
    port: u16,

    /// Plate text returned on a hit
    #[arg(long, default_value = "KA01AB1234")]
    plate: String,

    /// Number of calls answered with `found: false` before the first hit
    #[arg(long, default_value = "0")]
    fail_first: u64,

    /// Restart the miss countdown every N calls (0 = never)
    #[arg(long, default_value = "0")]
    reset_after: u64,

    /// Confidence reported on a hit
    #[arg(long, default_value = "0.91")]
    confidence: f32,

    /// Artificial processing delay per call (ms)
    #[arg(long, default_value = "50")]
    delay_ms: u64,

    /// Answer every call with HTTP 500
    #[arg(long)]
    broken: bool,
}

struct MockState {
    args: Args,
    calls: AtomicU64,
}

impl MockState {
    /// Position of the next call within the current miss countdown
    fn next_call(&self) -> u64 {
        let n = self.calls.fetch_add(1, Ordering::Relaxed);
        match self.args.reset_after {
            0 => n,
            period => n % period,
        }
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response should not fail")
}

async fn handle(req: Request<hyper::body::Incoming>, state: Arc<MockState>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::POST || req.uri().path() != "/detect" {
        return Ok(json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" })));
    }

    let size = match req.into_body().collect().await {
        Ok(body) => body.to_bytes().len(),
        Err(e) => {
            eprintln!("[MOCK] Failed to read body: {}", e);
            return Ok(json_response(StatusCode::BAD_REQUEST, json!({ "error": "unreadable body" })));
        }
    };

    tokio::time::sleep(Duration::from_millis(state.args.delay_ms)).await;
    let call = state.next_call();

    if state.args.broken {
        println!("[MOCK] call #{} ({} bytes) -> 500", call + 1, size);
        return Ok(json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "recognizer broken" })));
    }

    if call < state.args.fail_first {
        println!("[MOCK] call #{} ({} bytes) -> miss", call + 1, size);
        return Ok(json_response(StatusCode::OK, json!({ "found": false })));
    }

    println!("[MOCK] call #{} ({} bytes) -> {} ({:.2})", call + 1, size, state.args.plate, state.args.confidence);
    // Crops come back as data URLs, like the real service
    let crop = format!("data:image/jpeg;base64,{}", BASE64.encode(state.args.plate.as_bytes()));
    Ok(json_response(
        StatusCode::OK,
        json!({
            "found": true,
            "text": state.args.plate,
            "confidence": state.args.confidence,
            "cropped_image": crop,
        }),
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║           Mock Plate Recognition Service                 ║");
    println!("╠══════════════════════════════════════════════════════════╣");
    println!("║ Port:            {:>5}                                   ║", args.port);
    println!("║ Plate:           {:<38} ║", args.plate);
    println!("║ Fail first:      {:>5} calls                             ║", args.fail_first);
    println!("║ Reset after:     {:>5} calls                             ║", args.reset_after);
    println!("║ Confidence:      {:>5.2}                                   ║", args.confidence);
    println!("║ Delay:           {:>5} ms                                ║", args.delay_ms);
    println!("╚══════════════════════════════════════════════════════════╝");

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    let state = Arc::new(MockState { args, calls: AtomicU64::new(0) });

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle(req, state).await }
            });
            if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
                eprintln!("[MOCK] Connection from {} failed: {}", peer, e);
            }
        });
    }
}
