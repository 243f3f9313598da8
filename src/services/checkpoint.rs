//! Checkpoint service - one unit of work per guest or watchman action
//!
//! Ties the registry, lifecycle transitions, plate resolver, recognition
//! orchestrator and notifier together. Every transition follows the same
//! shape: read, guard, apply the pure transition, commit with
//! compare-and-update, then publish. Commit and publish share one lock so
//! subscribers see changes for a pass in commit order.

use crate::domain::error::{GateError, GateResult};
use crate::domain::pass::{EntryCode, Pass, PassStatus, Plate};
use crate::infra::metrics::Metrics;
use crate::services::lifecycle::{self, EntryCapture, PassEvent};
use crate::services::notifier::{StatusChange, StatusNotifier};
use crate::services::plate_match::PlateMatchResolver;
use crate::services::recognition::{Recognition, RecognitionOrchestrator, ScanCancel};
use crate::services::registry::PassRegistry;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct Checkpoint {
    registry: Arc<PassRegistry>,
    resolver: PlateMatchResolver,
    notifier: Arc<StatusNotifier>,
    orchestrator: Option<Arc<RecognitionOrchestrator>>,
    metrics: Arc<Metrics>,
    commit_order: Mutex<()>,
}

impl Checkpoint {
    pub fn new(registry: Arc<PassRegistry>, notifier: Arc<StatusNotifier>, metrics: Arc<Metrics>) -> Self {
        Self {
            resolver: PlateMatchResolver::new(registry.clone()),
            registry,
            notifier,
            orchestrator: None,
            metrics,
            commit_order: Mutex::new(()),
        }
    }

    /// Enable camera scans
    pub fn with_orchestrator(mut self, orchestrator: Arc<RecognitionOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn registry(&self) -> &Arc<PassRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn note_failure(&self, err: &GateError) {
        match err {
            GateError::Conflict(_) => self.metrics.record_transition_conflict(),
            GateError::PlateAlreadyActive { .. } => self.metrics.record_plate_conflict(),
            GateError::UnknownPlate(_) => self.metrics.record_unknown_plate(),
            GateError::Ambiguous { .. } => self.metrics.record_integrity_fault(),
            GateError::StoreUnavailable(_) => self.metrics.record_store_failure(),
            _ => {}
        }
    }

    /// Issue a new pass and its entry code
    pub fn register_pass(&self, guest_name: &str, host_name: &str, unit: &str) -> GateResult<Pass> {
        let pass = self.registry.create(guest_name, host_name, unit).inspect_err(|e| self.note_failure(e))?;
        self.metrics.record_pass_registered();
        info!(
            pass_id = %pass.id(),
            entry_code = %pass.entry_code(),
            unit = %pass.unit(),
            "pass_registered"
        );
        Ok(pass)
    }

    pub fn get_status(&self, code: &EntryCode) -> GateResult<PassStatus> {
        self.notifier.observe(code)
    }

    /// Long-poll until the pass is at least INSIDE or `wait` elapses
    pub async fn wait_status(&self, code: &EntryCode, wait: Duration) -> GateResult<PassStatus> {
        if wait.is_zero() {
            return self.get_status(code);
        }
        self.notifier.wait_for(code, PassStatus::Inside, wait).await.map(|obs| obs.status())
    }

    /// Check an entry code presented at the gate. No state change.
    pub fn verify_code(&self, code: &EntryCode) -> GateResult<Pass> {
        let result = self.registry.find_by_code(code).and_then(|pass| {
            lifecycle::verify(&pass)?;
            Ok(pass)
        });
        self.metrics.record_code_verified(result.is_ok());
        match &result {
            Ok(pass) => info!(entry_code = %code, pass_id = %pass.id(), "code_verified"),
            Err(e) => warn!(entry_code = %code, error = %e, "code_rejected"),
        }
        result
    }

    /// PENDING -> INSIDE with the captured plate
    pub fn confirm_entry(&self, pass_id: Uuid, capture: EntryCapture) -> GateResult<Pass> {
        self.enter(pass_id, capture).inspect_err(|e| {
            self.note_failure(e);
            warn!(pass_id = %pass_id, error = %e, "entry_rejected");
        })
    }

    fn enter(&self, pass_id: Uuid, capture: EntryCapture) -> GateResult<Pass> {
        let pass = self.registry.find_by_id(pass_id)?;
        if pass.status() == PassStatus::Pending {
            self.resolver.ensure_plate_free(&capture.plate, pass.entry_code())?;
        }

        let next = lifecycle::apply(&pass, PassEvent::ConfirmEntry(capture), Utc::now())?;
        self.commit_and_publish(&next, PassStatus::Pending)?;

        self.metrics.record_entry_confirmed();
        info!(
            pass_id = %next.id(),
            entry_code = %next.entry_code(),
            plate = %next.plate().map(Plate::as_str).unwrap_or_default(),
            "entry_confirmed"
        );
        Ok(next)
    }

    /// INSIDE -> EXITED for the pass holding `plate`
    pub fn confirm_exit(&self, plate: &Plate) -> GateResult<Pass> {
        self.exit(plate).inspect_err(|e| {
            self.note_failure(e);
            if e.is_fatal() {
                error!(plate = %plate, error = %e, "exit_integrity_fault");
            } else {
                warn!(plate = %plate, error = %e, "exit_rejected");
            }
        })
    }

    fn exit(&self, plate: &Plate) -> GateResult<Pass> {
        let pass = self.resolver.resolve_active(plate)?;
        let next = lifecycle::apply(&pass, PassEvent::ConfirmExit, Utc::now())?;
        self.commit_and_publish(&next, PassStatus::Inside)?;

        self.metrics.record_exit_confirmed();
        info!(
            pass_id = %next.id(),
            entry_code = %next.entry_code(),
            plate = %plate,
            "exit_confirmed"
        );
        Ok(next)
    }

    fn commit_and_publish(&self, next: &Pass, expected: PassStatus) -> GateResult<()> {
        let _order = self.commit_order.lock();
        self.registry.compare_and_update(next, expected)?;
        self.publish(next);
        Ok(())
    }

    fn publish(&self, pass: &Pass) {
        let at = match pass.status() {
            PassStatus::Exited => pass.exit_time(),
            PassStatus::Inside => pass.entry_time(),
            PassStatus::Pending => None,
        };
        self.notifier.publish(StatusChange {
            entry_code: pass.entry_code().clone(),
            status: pass.status(),
            at: at.unwrap_or_else(Utc::now),
        });
    }

    /// Run one recognition scan without touching any pass
    pub async fn scan_plate(&self, cancel: &mut ScanCancel) -> GateResult<Recognition> {
        let orchestrator = self
            .orchestrator
            .as_ref()
            .ok_or_else(|| GateError::RecognizerUnavailable("no camera configured".to_string()))?;
        orchestrator.run(cancel).await
    }

    /// Scan the vehicle at the gate and admit it under `pass_id`
    pub async fn scan_and_enter(&self, pass_id: Uuid, cancel: &mut ScanCancel) -> GateResult<Pass> {
        // Fail before spending camera time on a pass that cannot enter
        let pass = self.registry.find_by_id(pass_id)?;
        lifecycle::verify(&pass)?;

        let recognition = self.scan_plate(cancel).await?;
        let capture = EntryCapture {
            plate: recognition.plate,
            plate_image: recognition.cropped_image,
            original_image: Some(recognition.original_capture),
            confidence: Some(recognition.confidence),
        };
        self.confirm_entry(pass_id, capture)
    }

    /// Scan the vehicle at the gate and check it out
    pub async fn scan_and_exit(&self, cancel: &mut ScanCancel) -> GateResult<Pass> {
        let recognition = self.scan_plate(cancel).await?;
        self.confirm_exit(&recognition.plate)
    }
}
