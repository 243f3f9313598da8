//! Services - pass lifecycle and checkpoint logic
//!
//! - `registry` - Durable keyed pass store with compare-and-update
//! - `lifecycle` - Pure PENDING/INSIDE/EXITED transitions
//! - `plate_match` - Active-plate guard and exit resolution
//! - `notifier` - Status poll and push channel
//! - `recognition` - Bounded-retry plate recognition loop
//! - `checkpoint` - Unit-of-work facade used by the API
//! - `history` - Admin history and statistics

pub mod checkpoint;
pub mod history;
pub mod lifecycle;
pub mod notifier;
pub mod plate_match;
pub mod recognition;
pub mod registry;

// Re-export commonly used types
pub use checkpoint::Checkpoint;
pub use lifecycle::EntryCapture;
pub use notifier::{StatusChange, StatusNotifier};
pub use recognition::{RecognitionOrchestrator, RecognitionPolicy, ScanCancel, ScanHandle};
pub use registry::PassRegistry;
