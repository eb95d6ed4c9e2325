//! Custom error types for the application.
//!
//! This module defines the primary error type, `RigError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of the rig, from configuration
//! issues to driver rejections mid-sequence.
//!
//! ## Error taxonomy
//!
//! - **`Config` / `Configuration`**: parsing errors from the `config` crate,
//!   and semantic errors caught during validation (values that parse but are
//!   logically invalid, e.g. a zero frame-average count).
//! - **`Io`**: standard `std::io::Error`, covering file output from the
//!   frame store.
//! - **`ShapeMismatch`**: frames with differing dimensions or bit depths
//!   handed to the averager.
//! - **`CaptureFailed`**: the camera returned no frame. Transient: the live
//!   loop retries on the next tick; a sequence run aborts instead, because a
//!   gap mid-sequence is not acceptable.
//! - **`CommandRejected`**: an auxiliary device refused a commanded state
//!   (wavelength outside the filter's range, motion rejected). Never
//!   silently clamped.
//! - **`ExposureNotConverged`**: the de-saturation phase of auto-exposure
//!   exhausted its iteration budget.
//! - **`DeviceAbsent`**: an operation addressed a modality with no driver in
//!   the registry. A precondition violation by the caller, surfaced as an
//!   error rather than a panic.
//! - **`DeviceInit`**: driver activation failed. Reported once, at
//!   registry-add time.
//! - **`Persistence`**: the sink failed to save a frame. Recorded per step,
//!   non-fatal to a running plan.
//!
//! `SequenceError` wraps a `RigError` with the index and label of the step
//! that failed, so the operator knows exactly where a dataset is incomplete.

use crate::core::Modality;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, RigError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum RigError {
    /// Configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or directory I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frames of differing shape handed to the averager.
    #[error("Frame shape mismatch: expected {expected_width}x{expected_height}@{expected_depth}bit, got {width}x{height}@{depth}bit")]
    ShapeMismatch {
        /// Width of the first frame in the batch.
        expected_width: u32,
        /// Height of the first frame in the batch.
        expected_height: u32,
        /// Bit depth of the first frame in the batch.
        expected_depth: u8,
        /// Width of the offending frame.
        width: u32,
        /// Height of the offending frame.
        height: u32,
        /// Bit depth of the offending frame.
        depth: u8,
    },

    /// The camera returned no frame (transient).
    #[error("Camera returned no frame")]
    CaptureFailed,

    /// An auxiliary device refused a commanded state.
    #[error("Device rejected command: {0}")]
    CommandRejected(String),

    /// Auto-exposure exhausted its de-saturation iteration budget.
    #[error("Exposure failed to converge after {iterations} de-saturation steps (last exposure {exposure_us} us)")]
    ExposureNotConverged {
        /// De-saturation halvings performed before giving up.
        iterations: u32,
        /// The last exposure value tried, in microseconds.
        exposure_us: f64,
    },

    /// An operation addressed a modality with no registered driver.
    #[error("No {0} driver registered")]
    DeviceAbsent(Modality),

    /// Driver activation failed at registry-add time.
    #[error("Device initialization failed: {0}")]
    DeviceInit(String),

    /// The persistence sink failed to save a frame.
    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// Error propagated from a driver implementation.
    #[error("Driver error: {0}")]
    Driver(#[from] anyhow::Error),
}

/// A sequence plan abort, carrying the step where the plan stopped.
///
/// Entries before `step_index` in the returned dataset are valid; everything
/// from `step_index` onward was never captured.
#[derive(Error, Debug)]
#[error("Sequence aborted at step {step_index} ('{label}'): {error}")]
pub struct SequenceError {
    /// Zero-based index of the failed step within the plan.
    pub step_index: usize,
    /// The failed step's label.
    pub label: String,
    /// The underlying failure.
    pub error: RigError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RigError::CommandRejected("wavelength 800 nm out of range".to_string());
        assert_eq!(
            err.to_string(),
            "Device rejected command: wavelength 800 nm out of range"
        );
    }

    #[test]
    fn test_sequence_error_names_step() {
        let err = SequenceError {
            step_index: 3,
            label: "270".to_string(),
            error: RigError::CaptureFailed,
        };
        let msg = err.to_string();
        assert!(msg.contains("step 3"));
        assert!(msg.contains("'270'"));
    }
}
