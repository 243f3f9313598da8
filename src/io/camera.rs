//! Camera frame sources
//!
//! `HttpSnapshotCamera` pulls a still image from an IP camera snapshot URL.
//! An empty body means the camera had no frame ready.

use crate::infra::config::Config;
use crate::services::recognition::FrameSource;
use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info};

pub struct HttpSnapshotCamera {
    url: String,
    client: reqwest::Client,
}

impl HttpSnapshotCamera {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .http1_only()
            .build()
            .context("Failed to build camera HTTP client")?;
        info!(url = %url, "snapshot_camera_configured");
        Ok(Self { url: url.to_string(), client })
    }

    /// Camera from `[camera]`, or `None` when no snapshot URL is configured
    pub fn from_config(config: &Config) -> anyhow::Result<Option<Self>> {
        config.camera_snapshot_url().map(|url| Self::new(url, config.camera_timeout())).transpose()
    }
}

#[async_trait]
impl FrameSource for HttpSnapshotCamera {
    async fn capture(&self) -> anyhow::Result<Option<Bytes>> {
        let response = self.client.get(&self.url).send().await.context("snapshot request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("camera returned HTTP {status}");
        }
        let frame = response.bytes().await.context("snapshot body read failed")?;
        debug!(bytes = %frame.len(), "snapshot_captured");
        Ok((!frame.is_empty()).then_some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::Response;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    async fn serve_snapshot(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(move |_req| async move {
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(body))))
            });
            let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
        });
        format!("http://{addr}/snapshot.jpg")
    }

    #[tokio::test]
    async fn test_capture_returns_frame() {
        let url = serve_snapshot(b"\xff\xd8jpeg").await;
        let camera = HttpSnapshotCamera::new(&url, Duration::from_secs(5)).unwrap();
        assert_eq!(camera.capture().await.unwrap(), Some(Bytes::from_static(b"\xff\xd8jpeg")));
    }

    #[tokio::test]
    async fn test_empty_body_is_no_frame() {
        let url = serve_snapshot(b"").await;
        let camera = HttpSnapshotCamera::new(&url, Duration::from_secs(5)).unwrap();
        assert_eq!(camera.capture().await.unwrap(), None);
    }

    #[test]
    fn test_no_camera_without_url() {
        assert!(HttpSnapshotCamera::from_config(&Config::default()).unwrap().is_none());
    }
}
