//! # Errors
//!
//! There're two kinds of failures around the primitives:
//! - running out of memory while creating one - it's a run-time condition, so it's reported as [SyncError]
//! - breaking a contract (releasing a lock you don't hold, destroying a busy primitive, blocking in an interrupt handler)
//!   > those are bugs in the caller, there's no sane way to continue => they `panic!`

/// Recoverable failures, so far only allocation ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// `what` names the piece that couldn't be allocated e.g. "semaphore name"
    #[error("out of memory allocating {what}")]
    OutOfMemory { what: &'static str },
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
