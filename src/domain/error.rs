//! Error taxonomy for checkpoint operations

use crate::domain::pass::{EntryCode, PassStatus, Plate};
use thiserror::Error;

pub type GateResult<T> = Result<T, GateError>;

/// Every failure a checkpoint operation can report.
///
/// All variants except `Ambiguous` are recoverable by the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GateError {
    #[error("no pass found for {0}")]
    NotFound(String),

    #[error("entry code {code} was already used (status {status})")]
    AlreadyProcessed { code: EntryCode, status: PassStatus },

    #[error("cannot apply {event} to a pass in status {from}")]
    InvalidTransition { from: PassStatus, event: &'static str },

    #[error("plate {plate} is already held by active pass {holder}")]
    PlateAlreadyActive { plate: Plate, holder: EntryCode },

    #[error("plate recognition failed after {attempts} attempts")]
    RecognitionExhausted { attempts: u32 },

    #[error("plate scan cancelled after {attempts} attempts")]
    ScanCancelled { attempts: u32 },

    #[error("a scan is already running at checkpoint {0}")]
    ScanInProgress(String),

    #[error("plate {0} does not match any vehicle inside")]
    UnknownPlate(Plate),

    #[error("pass {0} was modified concurrently")]
    Conflict(EntryCode),

    #[error("plate {plate} is held by {count} active passes")]
    Ambiguous { plate: Plate, count: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("pass store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("no free entry code after {0} attempts")]
    EntryCodeExhausted(u32),

    #[error("plate recognition unavailable: {0}")]
    RecognizerUnavailable(String),
}

impl GateError {
    /// Stable machine-readable kind, used in API responses and logs
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::NotFound(_) => "not_found",
            GateError::AlreadyProcessed { .. } => "already_processed",
            GateError::InvalidTransition { .. } => "invalid_transition",
            GateError::PlateAlreadyActive { .. } => "plate_already_active",
            GateError::RecognitionExhausted { .. } => "recognition_exhausted",
            GateError::ScanCancelled { .. } => "scan_cancelled",
            GateError::ScanInProgress(_) => "scan_in_progress",
            GateError::UnknownPlate(_) => "unknown_plate",
            GateError::Conflict(_) => "conflict",
            GateError::Ambiguous { .. } => "ambiguous",
            GateError::InvalidInput(_) => "invalid_input",
            GateError::StoreUnavailable(_) => "store_unavailable",
            GateError::EntryCodeExhausted(_) => "entry_code_exhausted",
            GateError::RecognizerUnavailable(_) => "recognizer_unavailable",
        }
    }

    /// Data-integrity faults halt automatic processing and are never retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, GateError::Ambiguous { .. })
    }
}
