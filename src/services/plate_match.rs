//! Plate match resolver
//!
//! Guards entry (no second INSIDE pass per plate) and finds the pass a
//! recognized plate belongs to on exit. More than one INSIDE holder is an
//! integrity fault: the plate is quarantined and stays blocked until an
//! administrator releases it.

use crate::domain::error::{GateError, GateResult};
use crate::domain::pass::{EntryCode, Pass, Plate};
use crate::services::registry::{ActiveMatch, PassRegistry};
use std::sync::Arc;
use tracing::{error, warn};

pub struct PlateMatchResolver {
    registry: Arc<PassRegistry>,
}

impl PlateMatchResolver {
    pub fn new(registry: Arc<PassRegistry>) -> Self {
        Self { registry }
    }

    /// Fails if any INSIDE pass other than `candidate` holds `plate`
    pub fn ensure_plate_free(&self, plate: &Plate, candidate: &EntryCode) -> GateResult<()> {
        let holder = match self.registry.find_active_by_plate(plate) {
            ActiveMatch::None => return Ok(()),
            ActiveMatch::One(pass) if pass.entry_code() == candidate => return Ok(()),
            ActiveMatch::One(pass) => pass.entry_code().clone(),
            ActiveMatch::Ambiguous(passes) => {
                match passes.into_iter().find(|p| p.entry_code() != candidate) {
                    Some(pass) => pass.entry_code().clone(),
                    None => return Ok(()),
                }
            }
        };
        warn!(plate = %plate, holder = %holder, candidate = %candidate, "plate_already_active");
        Err(GateError::PlateAlreadyActive { plate: plate.clone(), holder })
    }

    /// The single INSIDE pass holding `plate`
    pub fn resolve_active(&self, plate: &Plate) -> GateResult<Pass> {
        let active = self.registry.find_active_by_plate(plate);

        if self.registry.is_quarantined(plate) {
            let count = match &active {
                ActiveMatch::None => 0,
                ActiveMatch::One(_) => 1,
                ActiveMatch::Ambiguous(passes) => passes.len(),
            };
            error!(plate = %plate, count = %count, "plate_quarantined_exit_blocked");
            return Err(GateError::Ambiguous { plate: plate.clone(), count });
        }

        match active {
            ActiveMatch::One(pass) => Ok(pass),
            ActiveMatch::None => Err(GateError::UnknownPlate(plate.clone())),
            ActiveMatch::Ambiguous(passes) => {
                let holders: Vec<&str> = passes.iter().map(|p| p.entry_code().as_str()).collect();
                error!(
                    plate = %plate,
                    count = %passes.len(),
                    holders = %holders.join(","),
                    "plate_match_ambiguous"
                );
                self.registry.quarantine(plate);
                Err(GateError::Ambiguous { plate: plate.clone(), count: passes.len() })
            }
        }
    }
}
