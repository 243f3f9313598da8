//! Domain models - visitor passes and the checkpoint error taxonomy
//!
//! - `Pass` - one visit from registration through entry and exit
//! - `PassStatus` - PENDING, INSIDE, EXITED
//! - `EntryCode` / `Plate` - the two keys a pass is found by
//! - `GateError` - failures reported by checkpoint operations

pub mod error;
pub mod pass;

pub use error::{GateError, GateResult};
pub use pass::{EntryCode, Pass, PassStatus, Plate};
