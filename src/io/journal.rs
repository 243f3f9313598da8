//! Pass journal - durable JSONL log of committed pass snapshots
//!
//! Every committed create/update is appended as one JSON object per line.
//! Replay keeps the last snapshot per entry code, so the file can be read
//! back into the registry on start-up.

use crate::domain::pass::{EntryCode, Pass};
use rustc_hash::FxHashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Append-only pass journal
pub struct PassJournal {
    file_path: PathBuf,
}

impl PassJournal {
    pub fn new(file_path: impl AsRef<Path>) -> Self {
        let file_path = file_path.as_ref().to_path_buf();
        info!(file_path = %file_path.display(), "pass_journal_initialized");
        Self { file_path }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Append one pass snapshot. The write is flushed to disk before returning.
    pub fn append(&self, pass: &Pass) -> std::io::Result<()> {
        let json = serde_json::to_string(pass)?;

        // Create parent directories if they don't exist
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        writeln!(file, "{}", json)?;
        file.sync_data()?;

        debug!(
            file = %self.file_path.display(),
            entry_code = %pass.entry_code(),
            status = %pass.status(),
            bytes = %json.len(),
            "pass_journal_written"
        );
        Ok(())
    }

    /// Read the journal back, keeping the latest snapshot per entry code.
    ///
    /// Passes are returned in first-seen order. A missing file is an empty
    /// journal; malformed lines are skipped with a warning. A torn final
    /// record (no trailing newline) is truncated away so later appends start
    /// on a fresh line.
    pub fn replay(&self) -> std::io::Result<Vec<Pass>> {
        let mut content = match fs::read(&self.file_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(file = %self.file_path.display(), "pass_journal_empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        if content.last().is_some_and(|b| *b != b'\n') {
            let keep = content.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
            self.truncate_to(keep as u64)?;
            warn!(
                file = %self.file_path.display(),
                dropped_bytes = %(content.len() - keep),
                "pass_journal_torn_tail_truncated"
            );
            content.truncate(keep);
        }

        let mut order: Vec<EntryCode> = Vec::new();
        let mut latest: FxHashMap<EntryCode, Pass> = FxHashMap::default();
        let mut skipped = 0usize;

        for (line_no, line) in content.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Pass>(line) {
                Ok(pass) => {
                    let code = pass.entry_code().clone();
                    if latest.insert(code.clone(), pass).is_none() {
                        order.push(code);
                    }
                }
                Err(e) => {
                    skipped += 1;
                    warn!(line = line_no + 1, error = %e, "pass_journal_line_skipped");
                }
            }
        }

        let passes: Vec<Pass> = order.iter().filter_map(|code| latest.remove(code)).collect();
        info!(
            file = %self.file_path.display(),
            passes = %passes.len(),
            skipped = %skipped,
            "pass_journal_replayed"
        );
        Ok(passes)
    }

    fn truncate_to(&self, len: u64) -> std::io::Result<()> {
        let file = OpenOptions::new().write(true).open(&self.file_path)?;
        file.set_len(len)?;
        file.sync_data()
    }
}
