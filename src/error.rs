//! Error and status codes shared by every subsystem
//!
//! Calls never panic on bad input. Caller mistakes come back as [`Error`];
//! expected outcomes that still deserve attention (a disabled subsystem, a
//! skipped low-quality datum, an evicted queue entry) come back as
//! [`Status`] inside `Ok`.

use crate::types::ZeroingPolicy;

/// Result type used throughout the crate
pub type Result<T> = core::result::Result<T, Error>;

/// Caller-visible failures
///
/// Kept `Copy` and heap-free so it can travel through the ingestion queue
/// and across threads without allocation.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// Handle does not refer to a live instance
    #[error("instance {handle} out of bounds ({live} live)")]
    InvalidHandle {
        /// Offending handle index
        handle: usize,
        /// Number of live instances at the time of the call
        live: usize,
    },

    /// Instance table has no free slot
    #[error("instance table full (capacity {capacity})")]
    TableFull {
        /// Fixed table capacity
        capacity: usize,
    },

    /// Raw calibration mode code not recognized
    #[error("unrecognized calibration mode {0}")]
    BadMode(u8),

    /// Calibration operation issued while no calibration is running
    #[error("no calibration in progress")]
    NotCalibrating,

    /// Save requested before the mode's point count was reached
    #[error("calibration incomplete: have {have} of {need} points")]
    CalibrationIncomplete {
        /// Points submitted so far
        have: usize,
        /// Points required by the mode
        need: usize,
    },

    /// Verification callback refused the reduced calibration
    #[error("calibration rejected (fom {fom})")]
    CalibrationRejected {
        /// Calibration figure of merit seen by the verifier
        fom: f32,
    },

    /// Operation requires the consumer thread to be stopped
    #[error("background consumer is running")]
    WorkerRunning,

    /// Configuration value outside its legal range
    #[error("bad configuration: {0}")]
    BadConfig(&'static str),
}

/// Non-failure outcome of a call, ordered from least to most notable
///
/// The engine runs several subsystems per datum and reports the most
/// notable outcome with [`Status::worst`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Status {
    /// Processed normally
    #[default]
    Ok,
    /// Subsystem or sensor switched off in its config; datum passed through
    Disabled,
    /// Datum accepted into the ingestion queue
    Queued,
    /// Datum quality weight was effectively zero; state unchanged
    ZeroWeight,
    /// Datum consumed to establish the orientation reference
    Zeroed(ZeroingPolicy),
    /// A stability episode ended and a calibration point was stored
    PointCaptured,
    /// Calibration reached its point count and a result is staged
    CalibrationReady,
    /// Point target already reached; the finalized point was not stored
    NoCapacity,
    /// Queue was full; the oldest queued datum was evicted
    Overflow,
}

impl Status {
    /// The more notable of two outcomes
    pub fn worst(self, other: Status) -> Status {
        self.max(other)
    }
}

/// Fold two subsystem results: an error always dominates a status.
pub(crate) fn worst_of(a: Result<Status>, b: Result<Status>) -> Result<Status> {
    match (a, b) {
        (Err(e), _) => Err(e),
        (_, Err(e)) => Err(e),
        (Ok(x), Ok(y)) => Ok(x.worst(y)),
    }
}
