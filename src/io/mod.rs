//! IO modules - external system interfaces
//!
//! - `journal` - Pass journal on disk (JSONL format)
//! - `recognizer_client` - HTTP client for the plate recognition service
//! - `camera` - Snapshot camera frame source
//! - `http_api` - Guest, watchman and admin HTTP API
//! - `prometheus` - Prometheus text exposition
//! - `mqtt_status` - MQTT publisher for pass status changes

pub mod camera;
pub mod http_api;
pub mod journal;
pub mod mqtt_status;
pub mod prometheus;
pub mod recognizer_client;

// Re-export commonly used types
pub use camera::HttpSnapshotCamera;
pub use http_api::{bind_api, serve_api, ApiState};
pub use journal::PassJournal;
pub use mqtt_status::MqttStatusPublisher;
pub use recognizer_client::HttpPlateRecognizer;
