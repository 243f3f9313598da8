//! Pass registry - the single owner of stored passes
//!
//! All state lives behind one `RwLock`. Every write (including the journal
//! append) happens while holding the write lock, which makes entry-code
//! generation and the active-plate check atomic with the write that depends
//! on them. The journal is appended before memory changes, so a failed
//! append leaves the registry untouched.

use crate::domain::error::{GateError, GateResult};
use crate::domain::pass::{EntryCode, Pass, PassStatus, Plate};
use crate::infra::config::Config;
use crate::io::journal::PassJournal;
use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Source of candidate entry codes
pub trait CodeGenerator: Send + Sync {
    fn next_code(&self, length: usize) -> EntryCode;
}

/// Uniformly random numeric codes
#[derive(Debug, Default)]
pub struct RandomCodes;

impl CodeGenerator for RandomCodes {
    fn next_code(&self, length: usize) -> EntryCode {
        let mut rng = rand::thread_rng();
        let code: String = (0..length).map(|_| char::from(b'0' + rng.gen_range(0..10u8))).collect();
        EntryCode::new(code)
    }
}

/// Result of looking up the INSIDE pass for a plate
#[derive(Debug, Clone, PartialEq)]
pub enum ActiveMatch {
    None,
    One(Pass),
    /// More than one INSIDE pass holds the plate (integrity fault)
    Ambiguous(Vec<Pass>),
}

#[derive(Default)]
struct RegistryState {
    by_code: FxHashMap<EntryCode, Pass>,
    code_by_id: FxHashMap<Uuid, EntryCode>,
    /// INSIDE passes by plate. More than one entry is an integrity fault.
    active_by_plate: FxHashMap<Plate, SmallVec<[EntryCode; 1]>>,
    quarantined: FxHashSet<Plate>,
}

impl RegistryState {
    fn index_active(&mut self, pass: &Pass) {
        if let (PassStatus::Inside, Some(plate)) = (pass.status(), pass.plate()) {
            let holders = self.active_by_plate.entry(plate.clone()).or_default();
            if !holders.contains(pass.entry_code()) {
                holders.push(pass.entry_code().clone());
            }
        }
    }

    fn unindex_active(&mut self, plate: &Plate, code: &EntryCode) {
        if let Some(holders) = self.active_by_plate.get_mut(plate) {
            holders.retain(|c| c != code);
            if holders.is_empty() {
                self.active_by_plate.remove(plate);
            }
        }
    }
}

/// First write-once field that `next` changes relative to `stored`
fn rewritten_field(stored: &Pass, next: &Pass) -> Option<&'static str> {
    fn changed<T: PartialEq>(stored: &Option<T>, next: &Option<T>) -> bool {
        stored.is_some() && stored != next
    }

    if stored.guest_name != next.guest_name || stored.host_name != next.host_name || stored.unit != next.unit {
        Some("identity")
    } else if stored.created_at != next.created_at {
        Some("createdAt")
    } else if changed(&stored.plate, &next.plate) {
        Some("plate")
    } else if changed(&stored.entry_time, &next.entry_time) {
        Some("entryTime")
    } else if changed(&stored.plate_image, &next.plate_image) {
        Some("plateImage")
    } else if changed(&stored.original_image, &next.original_image) {
        Some("originalImage")
    } else if changed(&stored.recognition_confidence, &next.recognition_confidence) {
        Some("recognitionConfidence")
    } else {
        None
    }
}

/// Durable keyed store of passes
pub struct PassRegistry {
    state: RwLock<RegistryState>,
    journal: Option<PassJournal>,
    codes: Box<dyn CodeGenerator>,
    code_length: usize,
    max_code_attempts: u32,
}

impl PassRegistry {
    /// Memory-only registry (nothing survives a restart)
    pub fn in_memory(code_length: usize, max_code_attempts: u32) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            journal: None,
            codes: Box::new(RandomCodes),
            code_length,
            max_code_attempts,
        }
    }

    /// Registry backed by a journal; replays existing snapshots first
    pub fn open(journal: PassJournal, code_length: usize, max_code_attempts: u32) -> GateResult<Self> {
        let passes = journal
            .replay()
            .map_err(|e| GateError::StoreUnavailable(format!("{}: {e}", journal.path().display())))?;

        let mut state = RegistryState::default();
        for pass in passes {
            if let Err(violation) = pass.check_invariants() {
                warn!(
                    entry_code = %pass.entry_code(),
                    violation = %violation,
                    "pass_journal_invariant_violation"
                );
            }
            state.code_by_id.insert(pass.id(), pass.entry_code().clone());
            state.index_active(&pass);
            state.by_code.insert(pass.entry_code().clone(), pass);
        }

        for (plate, holders) in &state.active_by_plate {
            if holders.len() > 1 {
                warn!(plate = %plate, holders = %holders.len(), "pass_journal_plate_conflict");
            }
        }

        info!(
            passes = %state.by_code.len(),
            inside = %state.active_by_plate.len(),
            "pass_registry_loaded"
        );

        Ok(Self {
            state: RwLock::new(state),
            journal: Some(journal),
            codes: Box::new(RandomCodes),
            code_length,
            max_code_attempts,
        })
    }

    /// Build the registry described by the configuration
    pub fn from_config(config: &Config) -> GateResult<Self> {
        match config.journal_file() {
            Some(path) => Self::open(
                PassJournal::new(path),
                config.code_length(),
                config.code_max_attempts(),
            ),
            None => Ok(Self::in_memory(config.code_length(), config.code_max_attempts())),
        }
    }

    /// Replace the entry-code source
    pub fn with_code_generator(mut self, codes: impl CodeGenerator + 'static) -> Self {
        self.codes = Box::new(codes);
        self
    }

    fn persist(&self, pass: &Pass) -> GateResult<()> {
        if let Some(journal) = &self.journal {
            journal.append(pass).map_err(|e| {
                error!(entry_code = %pass.entry_code(), error = %e, "pass_journal_append_failed");
                GateError::StoreUnavailable(e.to_string())
            })?;
        }
        Ok(())
    }

    /// Create a pending pass with a fresh, never-used entry code
    pub fn create(&self, guest_name: &str, host_name: &str, unit: &str) -> GateResult<Pass> {
        for (field, value) in [("guestName", guest_name), ("hostName", host_name), ("unit", unit)] {
            if value.trim().is_empty() {
                return Err(GateError::InvalidInput(format!("{field} must not be empty")));
            }
        }

        let mut state = self.state.write();

        let mut code = None;
        for attempt in 1..=self.max_code_attempts {
            let candidate = self.codes.next_code(self.code_length);
            if !state.by_code.contains_key(&candidate) {
                code = Some(candidate);
                break;
            }
            debug!(attempt = %attempt, "entry_code_collision");
        }
        let Some(code) = code else {
            error!(attempts = %self.max_code_attempts, "entry_code_space_exhausted");
            return Err(GateError::EntryCodeExhausted(self.max_code_attempts));
        };

        let pass = Pass::new(code, guest_name, host_name, unit, Utc::now());
        self.persist(&pass)?;

        state.code_by_id.insert(pass.id(), pass.entry_code().clone());
        state.by_code.insert(pass.entry_code().clone(), pass.clone());
        Ok(pass)
    }

    pub fn find_by_code(&self, code: &EntryCode) -> GateResult<Pass> {
        self.state
            .read()
            .by_code
            .get(code)
            .cloned()
            .ok_or_else(|| GateError::NotFound(format!("entry code {code}")))
    }

    pub fn find_by_id(&self, id: Uuid) -> GateResult<Pass> {
        let state = self.state.read();
        state
            .code_by_id
            .get(&id)
            .and_then(|code| state.by_code.get(code))
            .cloned()
            .ok_or_else(|| GateError::NotFound(format!("pass {id}")))
    }

    /// Find the INSIDE pass holding `plate`
    pub fn find_active_by_plate(&self, plate: &Plate) -> ActiveMatch {
        let state = self.state.read();
        let Some(holders) = state.active_by_plate.get(plate) else {
            return ActiveMatch::None;
        };
        let mut passes: Vec<Pass> =
            holders.iter().filter_map(|code| state.by_code.get(code)).cloned().collect();
        match passes.len() {
            0 => ActiveMatch::None,
            1 => ActiveMatch::One(passes.remove(0)),
            _ => ActiveMatch::Ambiguous(passes),
        }
    }

    /// Commit `pass` only if the stored status still equals `expected`.
    ///
    /// A move into INSIDE also re-checks, in the same critical section, that
    /// no other INSIDE pass holds the plate.
    pub fn compare_and_update(&self, pass: &Pass, expected: PassStatus) -> GateResult<()> {
        pass.check_invariants().map_err(GateError::InvalidInput)?;

        let mut state = self.state.write();

        let stored = match state.by_code.get(pass.entry_code()) {
            Some(stored) if stored.id() == pass.id() => stored,
            _ => return Err(GateError::NotFound(format!("entry code {}", pass.entry_code()))),
        };
        let stored_status = stored.status();
        let stored_plate = stored.plate().cloned();

        if stored_status != expected {
            debug!(
                entry_code = %pass.entry_code(),
                expected = %expected,
                stored = %stored_status,
                "compare_and_update_conflict"
            );
            return Err(GateError::Conflict(pass.entry_code().clone()));
        }

        if stored_status.successor() != Some(pass.status()) {
            return Err(GateError::InvalidTransition { from: stored_status, event: "UPDATE" });
        }

        if let Some(field) = rewritten_field(stored, pass) {
            return Err(GateError::InvalidInput(format!(
                "{field} of pass {} is immutable once set",
                pass.entry_code()
            )));
        }

        if pass.status() == PassStatus::Inside && stored_status != PassStatus::Inside {
            if let Some(plate) = pass.plate() {
                if let Some(holder) = state
                    .active_by_plate
                    .get(plate)
                    .and_then(|holders| holders.iter().find(|c| *c != pass.entry_code()))
                {
                    return Err(GateError::PlateAlreadyActive {
                        plate: plate.clone(),
                        holder: holder.clone(),
                    });
                }
            }
        }

        self.persist(pass)?;

        if stored_status == PassStatus::Inside && pass.status() != PassStatus::Inside {
            if let Some(plate) = &stored_plate {
                state.unindex_active(plate, pass.entry_code());
            }
        }
        state.index_active(pass);
        state.by_code.insert(pass.entry_code().clone(), pass.clone());
        Ok(())
    }

    pub fn is_quarantined(&self, plate: &Plate) -> bool {
        self.state.read().quarantined.contains(plate)
    }

    /// Halt automatic processing for a plate
    pub fn quarantine(&self, plate: &Plate) {
        if self.state.write().quarantined.insert(plate.clone()) {
            error!(plate = %plate, "plate_quarantined");
        }
    }

    /// Lift a quarantine. Returns false if the plate was not quarantined.
    pub fn release_plate(&self, plate: &Plate) -> bool {
        let released = self.state.write().quarantined.remove(plate);
        if released {
            warn!(plate = %plate, "plate_quarantine_released");
        }
        released
    }

    pub fn quarantined_plates(&self) -> Vec<Plate> {
        let mut plates: Vec<Plate> = self.state.read().quarantined.iter().cloned().collect();
        plates.sort();
        plates
    }

    /// Copy of every stored pass
    pub fn snapshot(&self) -> Vec<Pass> {
        self.state.read().by_code.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Hands out a fixed sequence of codes, then repeats the last one
    struct ScriptedCodes(Mutex<VecDeque<&'static str>>);

    impl ScriptedCodes {
        fn new(codes: &[&'static str]) -> Self {
            Self(Mutex::new(codes.iter().copied().collect()))
        }
    }

    impl CodeGenerator for ScriptedCodes {
        fn next_code(&self, _length: usize) -> EntryCode {
            let mut codes = self.0.lock();
            let code = if codes.len() > 1 { codes.pop_front() } else { codes.front().copied() };
            EntryCode::new(code.unwrap_or("000000"))
        }
    }

    fn registry() -> PassRegistry {
        PassRegistry::in_memory(6, 16)
    }

    fn entered(pass: &Pass, plate: &str) -> Pass {
        let mut next = pass.clone();
        next.status = PassStatus::Inside;
        next.plate = Plate::parse(plate);
        next.entry_time = Some(Utc::now());
        next
    }

    #[test]
    fn test_create_generates_numeric_code() {
        let registry = registry();
        let pass = registry.create("A. Smith", "J. Doe", "101").unwrap();
        assert_eq!(pass.entry_code().as_str().len(), 6);
        assert!(pass.entry_code().as_str().chars().all(|c| c.is_ascii_digit()));
        assert_eq!(pass.status(), PassStatus::Pending);
        assert_eq!(registry.find_by_code(pass.entry_code()).unwrap(), pass);
        assert_eq!(registry.find_by_id(pass.id()).unwrap(), pass);
    }

    #[test]
    fn test_create_rejects_empty_fields() {
        let registry = registry();
        let err = registry.create("A. Smith", "  ", "101").unwrap_err();
        assert_eq!(err, GateError::InvalidInput("hostName must not be empty".to_string()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_create_regenerates_on_collision() {
        let registry =
            registry().with_code_generator(ScriptedCodes::new(&["111111", "111111", "222222"]));
        let first = registry.create("A", "B", "1").unwrap();
        let second = registry.create("C", "D", "2").unwrap();
        assert_eq!(first.entry_code().as_str(), "111111");
        assert_eq!(second.entry_code().as_str(), "222222");
    }

    #[test]
    fn test_create_gives_up_when_codes_exhausted() {
        let registry = PassRegistry::in_memory(6, 3).with_code_generator(ScriptedCodes::new(&["111111"]));
        registry.create("A", "B", "1").unwrap();
        assert_eq!(registry.create("C", "D", "2").unwrap_err(), GateError::EntryCodeExhausted(3));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_codes_unique_across_many_creates() {
        let registry = PassRegistry::in_memory(4, 64);
        let mut seen = FxHashSet::default();
        for i in 0..500 {
            let pass = registry.create("guest", "host", &i.to_string()).unwrap();
            assert!(seen.insert(pass.entry_code().clone()));
        }
    }

    #[test]
    fn test_find_unknown_code() {
        let registry = registry();
        assert!(matches!(
            registry.find_by_code(&EntryCode::new("999999")),
            Err(GateError::NotFound(_))
        ));
    }

    #[test]
    fn test_compare_and_update_detects_stale_status() {
        let registry = registry();
        let pass = registry.create("A", "B", "1").unwrap();
        let inside = entered(&pass, "KA01AB1234");

        registry.compare_and_update(&inside, PassStatus::Pending).unwrap();
        let err = registry.compare_and_update(&inside, PassStatus::Pending).unwrap_err();
        assert_eq!(err, GateError::Conflict(pass.entry_code().clone()));
    }

    #[test]
    fn test_compare_and_update_rejects_active_plate() {
        let registry = registry();
        let first = registry.create("A", "B", "1").unwrap();
        let second = registry.create("C", "D", "2").unwrap();
        registry.compare_and_update(&entered(&first, "KA01AB1234"), PassStatus::Pending).unwrap();

        let err = registry
            .compare_and_update(&entered(&second, "ka 01 ab 1234"), PassStatus::Pending)
            .unwrap_err();
        assert!(matches!(err, GateError::PlateAlreadyActive { ref holder, .. } if holder == first.entry_code()));
        assert_eq!(registry.find_by_code(second.entry_code()).unwrap().status(), PassStatus::Pending);
    }

    #[test]
    fn test_compare_and_update_rejects_invariant_violation() {
        let registry = registry();
        let pass = registry.create("A", "B", "1").unwrap();
        let mut broken = pass.clone();
        broken.status = PassStatus::Inside;
        assert!(matches!(
            registry.compare_and_update(&broken, PassStatus::Pending),
            Err(GateError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_compare_and_update_rejects_skipped_and_repeated_status() {
        let registry = registry();
        let pass = registry.create("A", "B", "1").unwrap();

        let mut skipped = entered(&pass, "KA01AB1234");
        skipped.status = PassStatus::Exited;
        skipped.exit_time = skipped.entry_time;
        assert_eq!(
            registry.compare_and_update(&skipped, PassStatus::Pending).unwrap_err(),
            GateError::InvalidTransition { from: PassStatus::Pending, event: "UPDATE" }
        );

        let inside = entered(&pass, "KA01AB1234");
        registry.compare_and_update(&inside, PassStatus::Pending).unwrap();
        let mut rewritten = inside.clone();
        rewritten.entry_time = Some(Utc::now() + chrono::Duration::seconds(5));
        assert_eq!(
            registry.compare_and_update(&rewritten, PassStatus::Inside).unwrap_err(),
            GateError::InvalidTransition { from: PassStatus::Inside, event: "UPDATE" }
        );
        assert_eq!(registry.find_by_code(pass.entry_code()).unwrap(), inside);
    }

    #[test]
    fn test_exit_cannot_rewrite_entry_evidence() {
        let registry = registry();
        let pass = registry.create("A", "B", "1").unwrap();
        let mut inside = entered(&pass, "KA01AB1234");
        inside.plate_image = Some(bytes::Bytes::from_static(b"crop"));
        registry.compare_and_update(&inside, PassStatus::Pending).unwrap();

        let mut exited = inside.clone();
        exited.status = PassStatus::Exited;
        exited.exit_time = inside.entry_time;
        exited.plate_image = Some(bytes::Bytes::from_static(b"other"));
        assert!(matches!(
            registry.compare_and_update(&exited, PassStatus::Inside),
            Err(GateError::InvalidInput(ref msg)) if msg.starts_with("plateImage")
        ));

        exited.plate_image = inside.plate_image.clone();
        exited.entry_time = Some(Utc::now() - chrono::Duration::hours(1));
        exited.exit_time = Some(Utc::now());
        assert!(matches!(
            registry.compare_and_update(&exited, PassStatus::Inside),
            Err(GateError::InvalidInput(ref msg)) if msg.starts_with("entryTime")
        ));
        assert_eq!(registry.find_by_code(pass.entry_code()).unwrap().status(), PassStatus::Inside);
    }

    #[test]
    fn test_plate_index_follows_exit() {
        let registry = registry();
        let pass = registry.create("A", "B", "1").unwrap();
        let inside = entered(&pass, "KA01AB1234");
        registry.compare_and_update(&inside, PassStatus::Pending).unwrap();

        let plate = Plate::parse("KA01AB1234").unwrap();
        assert_eq!(registry.find_active_by_plate(&plate), ActiveMatch::One(inside.clone()));

        let mut exited = inside.clone();
        exited.status = PassStatus::Exited;
        exited.exit_time = inside.entry_time;
        registry.compare_and_update(&exited, PassStatus::Inside).unwrap();
        assert_eq!(registry.find_active_by_plate(&plate), ActiveMatch::None);
    }

    #[test]
    fn test_concurrent_updates_single_winner() {
        let registry = Arc::new(registry());
        let pass = registry.create("A", "B", "1").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let candidate = entered(&pass, "KA01AB1234");
                std::thread::spawn(move || registry.compare_and_update(&candidate, PassStatus::Pending))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, GateError::Conflict(_))));
    }

    #[test]
    fn test_journal_replay_restores_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("passes.jsonl");

        let (pending_code, inside_code) = {
            let registry = PassRegistry::open(PassJournal::new(&path), 6, 16).unwrap();
            let pending = registry.create("A", "B", "1").unwrap();
            let other = registry.create("C", "D", "2").unwrap();
            registry.compare_and_update(&entered(&other, "MH12XY9876"), PassStatus::Pending).unwrap();
            (pending.entry_code().clone(), other.entry_code().clone())
        };

        let reopened = PassRegistry::open(PassJournal::new(&path), 6, 16).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.find_by_code(&pending_code).unwrap().status(), PassStatus::Pending);
        let plate = Plate::parse("MH12XY9876").unwrap();
        match reopened.find_active_by_plate(&plate) {
            ActiveMatch::One(pass) => assert_eq!(pass.entry_code(), &inside_code),
            other => panic!("expected one active pass, got {other:?}"),
        }
    }

    #[test]
    fn test_journal_replay_surfaces_plate_conflict() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("passes.jsonl");
        let journal = PassJournal::new(&path);

        let now = Utc::now();
        for code in ["111111", "222222"] {
            let pass = Pass::new(EntryCode::new(code), "A", "B", "1", now);
            journal.append(&entered(&pass, "KA01AB1234")).unwrap();
        }

        let registry = PassRegistry::open(PassJournal::new(&path), 6, 16).unwrap();
        let plate = Plate::parse("KA01AB1234").unwrap();
        assert!(matches!(registry.find_active_by_plate(&plate), ActiveMatch::Ambiguous(ref p) if p.len() == 2));
    }

    #[test]
    fn test_pass_committed_after_torn_record_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("passes.jsonl");

        let first = {
            let registry = PassRegistry::open(PassJournal::new(&path), 6, 16).unwrap();
            registry.create("A", "B", "1").unwrap()
        };
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, b"{\"id\":\"0190").unwrap();
        drop(file);

        let second = {
            let registry = PassRegistry::open(PassJournal::new(&path), 6, 16).unwrap();
            registry.create("C", "D", "2").unwrap()
        };

        let reopened = PassRegistry::open(PassJournal::new(&path), 6, 16).unwrap();
        assert!(reopened.find_by_code(first.entry_code()).is_ok());
        assert!(reopened.find_by_code(second.entry_code()).is_ok());
    }

    #[test]
    fn test_unwritable_journal_fails_fast() {
        let dir = tempdir().unwrap();
        // A directory where the journal file should be makes every append fail
        let path = dir.path().join("blocked");
        std::fs::create_dir(&path).unwrap();
        let registry = PassRegistry {
            state: RwLock::new(RegistryState::default()),
            journal: Some(PassJournal::new(&path)),
            codes: Box::new(RandomCodes),
            code_length: 6,
            max_code_attempts: 4,
        };

        assert!(matches!(registry.create("A", "B", "1"), Err(GateError::StoreUnavailable(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_quarantine_roundtrip() {
        let registry = registry();
        let plate = Plate::parse("KA01AB1234").unwrap();
        assert!(!registry.is_quarantined(&plate));
        registry.quarantine(&plate);
        assert!(registry.is_quarantined(&plate));
        assert_eq!(registry.quarantined_plates(), vec![plate.clone()]);
        assert!(registry.release_plate(&plate));
        assert!(!registry.release_plate(&plate));
    }
}
