//! Pass lifecycle state machine
//!
//! ```text
//! PENDING --CONFIRM_ENTRY--> INSIDE --CONFIRM_EXIT--> EXITED
//! ```
//!
//! Transitions are pure: they take the current pass by reference and return
//! the next snapshot. Committing it is the registry's job.

use crate::domain::error::{GateError, GateResult};
use crate::domain::pass::{Pass, PassStatus, Plate};
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// What the checkpoint captured when the vehicle entered
#[derive(Debug, Clone, PartialEq)]
pub struct EntryCapture {
    pub plate: Plate,
    pub plate_image: Option<Bytes>,
    pub original_image: Option<Bytes>,
    pub confidence: Option<f32>,
}

impl EntryCapture {
    pub fn new(plate: Plate) -> Self {
        Self { plate, plate_image: None, original_image: None, confidence: None }
    }

    pub fn with_images(mut self, plate_image: Option<Bytes>, original_image: Option<Bytes>) -> Self {
        self.plate_image = plate_image;
        self.original_image = original_image;
        self
    }
}

/// Transition events
#[derive(Debug, Clone, PartialEq)]
pub enum PassEvent {
    ConfirmEntry(EntryCapture),
    ConfirmExit,
}

impl PassEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PassEvent::ConfirmEntry(_) => "CONFIRM_ENTRY",
            PassEvent::ConfirmExit => "CONFIRM_EXIT",
        }
    }

    /// Status the pass must be in for this event to apply
    pub fn expected_status(&self) -> PassStatus {
        match self {
            PassEvent::ConfirmEntry(_) => PassStatus::Pending,
            PassEvent::ConfirmExit => PassStatus::Inside,
        }
    }
}

/// VERIFY: an entry code is only valid while its pass is pending
pub fn verify(pass: &Pass) -> GateResult<()> {
    match pass.status() {
        PassStatus::Pending => Ok(()),
        status => Err(GateError::AlreadyProcessed { code: pass.entry_code().clone(), status }),
    }
}

/// Apply `event` to `pass`, returning the next snapshot
pub fn apply(pass: &Pass, event: PassEvent, now: DateTime<Utc>) -> GateResult<Pass> {
    let from = pass.status();
    if from != event.expected_status() {
        return Err(GateError::InvalidTransition { from, event: event.name() });
    }

    let mut next = pass.clone();
    match event {
        PassEvent::ConfirmEntry(capture) => {
            next.status = PassStatus::Inside;
            next.plate = Some(capture.plate);
            next.plate_image = capture.plate_image;
            next.original_image = capture.original_image;
            next.recognition_confidence = capture.confidence;
            next.entry_time = Some(now);
        }
        PassEvent::ConfirmExit => {
            // Wall clock may step backwards between entry and exit
            let exit_time = match pass.entry_time() {
                Some(entry) if now < entry => entry,
                _ => now,
            };
            next.status = PassStatus::Exited;
            next.exit_time = Some(exit_time);
        }
    }
    Ok(next)
}
