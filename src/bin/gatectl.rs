//! Gatepass command-line client
//!
//! Drives a running gatepass server over its HTTP API.
//!
//! Usage:
//!   cargo run --bin gatectl -- register --guest "Asha" --host "R. Iyer" --unit B-204
//!   cargo run --bin gatectl -- status 482913 --wait-ms 20000
//!   cargo run --bin gatectl -- --token guard-dev verify 482913
//!   cargo run --bin gatectl -- --token guard-dev entry <pass-id> KA01AB1234
//!   cargo run --bin gatectl -- --token guard-dev scan --mode exit
//!   cargo run --bin gatectl -- --token admin-dev history --status INSIDE --page 2

use clap::{Parser, Subcommand};
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "gatectl")]
#[command(about = "Command-line client for the gatepass API")]
struct Args {
    /// Base URL of the gatepass server
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Bearer token (checkpoint or admin)
    #[arg(long)]
    token: Option<String>,

    /// Request timeout (seconds); scans and long-polls need headroom
    #[arg(long, default_value = "90")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a visitor pass
    Register {
        #[arg(long)]
        guest: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        unit: String,
    },
    /// Read a pass status, optionally waiting for entry
    Status {
        code: String,
        #[arg(long, default_value = "0")]
        wait_ms: u64,
    },
    /// Check an entry code at the checkpoint
    Verify { code: String },
    /// Confirm entry with a manually read plate
    Entry {
        pass_id: String,
        plate: String,
        #[arg(long)]
        confidence: Option<f32>,
    },
    /// Confirm exit for a plate
    Exit { plate: String },
    /// Run a camera scan at the checkpoint
    Scan {
        /// detect | entry | exit
        #[arg(long, default_value = "detect")]
        mode: String,
        #[arg(long)]
        pass_id: Option<String>,
        #[arg(long)]
        checkpoint: Option<String>,
    },
    /// Cancel the running scan at a checkpoint
    Cancel {
        #[arg(long)]
        checkpoint: Option<String>,
    },
    /// Pass counts by status
    Stats,
    /// Paginated pass history
    History {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "10")]
        limit: u32,
    },
    /// Full pass record by entry code
    Show { code: String },
    /// List quarantined plates
    Quarantine,
    /// Release a quarantined plate
    Release { plate: String },
}

struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> anyhow::Result<(bool, Value)> {
        let response = builder.send().await?;
        let ok = response.status().is_success();
        let status = response.status();
        let text = response.text().await?;
        let body = serde_json::from_str(&text).unwrap_or_else(|_| json!({ "status": status.as_u16(), "body": text }));
        Ok((ok, body))
    }

    async fn get(&self, path: &str) -> anyhow::Result<(bool, Value)> {
        self.send(self.request(Method::GET, path)).await
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<(bool, Value)> {
        self.send(self.request(Method::POST, path).json(&body)).await
    }
}

fn history_query(
    search: Option<String>,
    status: Option<String>,
    from: Option<String>,
    to: Option<String>,
    page: u32,
    limit: u32,
) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in [("search", search), ("status", status), ("from", from), ("to", to)] {
        if let Some(value) = value {
            query.append_pair(key, &value);
        }
    }
    query.append_pair("page", &page.to_string());
    query.append_pair("limit", &limit.to_string());
    query.finish()
}

async fn run(client: &Client, command: Command) -> anyhow::Result<(bool, Value)> {
    match command {
        Command::Register { guest, host, unit } => {
            client
                .post("/api/guest/register", json!({ "guestName": guest, "hostName": host, "unit": unit }))
                .await
        }
        Command::Status { code, wait_ms } => {
            let path = format!("/api/guest/status/{}", code);
            if wait_ms > 0 {
                client.get(&format!("{}?wait_ms={}", path, wait_ms)).await
            } else {
                client.get(&path).await
            }
        }
        Command::Verify { code } => client.post("/api/watchman/verify", json!({ "entryCode": code })).await,
        Command::Entry { pass_id, plate, confidence } => {
            client
                .post("/api/watchman/entry", json!({ "passId": pass_id, "plate": plate, "confidence": confidence }))
                .await
        }
        Command::Exit { plate } => client.post("/api/watchman/exit", json!({ "plate": plate })).await,
        Command::Scan { mode, pass_id, checkpoint } => {
            client
                .post("/api/watchman/scan", json!({ "mode": mode, "passId": pass_id, "checkpointId": checkpoint }))
                .await
        }
        Command::Cancel { checkpoint } => {
            client.post("/api/watchman/scan/cancel", json!({ "checkpointId": checkpoint })).await
        }
        Command::Stats => client.get("/api/admin/stats").await,
        Command::History { search, status, from, to, page, limit } => {
            let query = history_query(search, status, from, to, page, limit);
            client.get(&format!("/api/admin/history?{}", query)).await
        }
        Command::Show { code } => client.get(&format!("/api/admin/pass/{}", code)).await,
        Command::Quarantine => client.get("/api/admin/quarantine").await,
        Command::Release { plate } => client.post("/api/admin/quarantine/release", json!({ "plate": plate })).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let http = match reqwest::Client::builder().timeout(Duration::from_secs(args.timeout_secs)).http1_only().build() {
        Ok(http) => http,
        Err(e) => {
            eprintln!("Failed to build HTTP client: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let client = Client { base_url: args.url, token: args.token, http };

    match run(&client, args.command).await {
        Ok((ok, body)) => {
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string()));
            if ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Request failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
