use thiserror::Error;

use nxtv_ttx::capture::CaptureError;

/// Database mutation errors. Rejected insertions (bad netwop index,
/// missing AI) are not errors but `Ok(false)` results; only structural
/// misuse surfaces here.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database is locked by a reader (lock level {0})")]
    Locked(u32),
}

/// Acquisition-level failures. Steady-state reception problems are
/// counters; only resource faults stop acquisition.
#[derive(Debug, Error)]
pub enum AcqError {
    #[error("capture source failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("acquisition is already running")]
    AlreadyRunning,
    #[error("acquisition is not running")]
    NotRunning,
}
