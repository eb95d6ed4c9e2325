//! Core traits and data types for the imaging rig.
//!
//! This module defines the foundational abstractions for the acquisition and
//! sequencing core, providing trait-based interfaces for the camera, the
//! auxiliary modality devices, and durable frame storage.
//!
//! # Architecture Overview
//!
//! The rig uses capability-based traits:
//!
//! - [`CameraDriver`]: the one exclusive capture device
//! - [`ProjectorDriver`], [`FilterDriver`], [`StageDriver`]: auxiliary
//!   modality devices, each independently optional
//! - [`PersistenceSink`]: durable frame/dataset storage
//!
//! # Data Flow
//!
//! ```text
//! CameraDriver --[Frame]--> CaptureEngine --> watch channel ---> display consumer
//!                                        \--> SequenceOrchestrator --> PersistenceSink
//! ```
//!
//! # Thread Safety
//!
//! All driver traits require `Send` so instances can live inside tokio
//! tasks. The camera is exclusive: the live loop and the orchestrator never
//! issue overlapping capture calls (enforced by the suspend/resume handshake
//! in [`crate::acquisition`], not by a lock on the hardware itself).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// =============================================================================
// Constants
// =============================================================================

/// Significant bits delivered by the sensor at binning 1.
///
/// The camera ships Mono16 data with 12 significant bits; the capture path
/// strips the four padding bits with a truncating divide by 16.
pub const BASE_BIT_DEPTH: u8 = 12;

/// Empirical safety margin below full scale for the saturation ceiling.
///
/// Calibrated against the sensor; do not re-derive.
pub const SATURATION_MARGIN: u16 = 7;

// =============================================================================
// Basic Data Types
// =============================================================================

/// A single captured image.
///
/// `Frame` is immutable once produced. The samples are unsigned integers in
/// row-major order; `bit_depth` says how many of the 16 bits are
/// significant. Frames are shared as `Arc<Frame>` between the publisher and
/// display consumers, and handed to [`PersistenceSink`] by reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Number of significant bits per sample.
    pub bit_depth: u8,
    /// Monotonic capture sequence number within the session.
    pub sequence: u64,
    /// UTC timestamp when the frame was captured.
    pub timestamp: DateTime<Utc>,
    /// Pixel samples, row-major.
    pub data: Vec<u16>,
}

impl Frame {
    /// Returns the total number of pixels (width × height).
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Returns the largest sample value in the frame (0 for an empty frame).
    pub fn max_pixel(&self) -> u16 {
        self.data.iter().copied().max().unwrap_or(0)
    }

    /// True if the frame carries no pixel data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Region of Interest for camera acquisition.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Roi {
    /// Left edge in sensor pixels.
    pub x: u32,
    /// Top edge in sensor pixels.
    pub y: u32,
    /// Region width in pixels.
    pub width: u32,
    /// Region height in pixels.
    pub height: u32,
}

impl Default for Roi {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 1024,
            height: 1024,
        }
    }
}

/// Camera acquisition parameters.
///
/// Mutated only by the controller that owns the live session, never
/// concurrently with an in-flight capture (the capture engine holds it
/// behind an `RwLock` and commits changes between captures).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Exposure time in microseconds, bounded by the device-reported range.
    pub exposure_us: f64,
    /// Sensor gain in dB.
    pub gain: f64,
    /// Pixel binning factor (>= 1, power of two in practice).
    pub binning: u32,
    /// Number of raw frames averaged into each published frame (>= 1).
    pub navgs: u32,
    /// Active region of interest.
    pub roi: Roi,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            exposure_us: 10_000.0,
            gain: 0.0,
            binning: 1,
            navgs: 1,
            roi: Roi::default(),
        }
    }
}

impl AcquisitionConfig {
    /// Effective bit depth of delivered frames at the current binning.
    ///
    /// Binning sums `binning x binning` pixel wells, deepening each sample by
    /// `log2(binning^2)` bits.
    pub fn effective_bit_depth(&self) -> u8 {
        effective_bit_depth(self.binning)
    }

    /// Saturation ceiling at the current binning.
    pub fn saturation_ceiling(&self) -> u16 {
        saturation_ceiling(self.effective_bit_depth())
    }
}

/// Effective bit depth for a given binning factor.
pub fn effective_bit_depth(binning: u32) -> u8 {
    let extra = (binning.max(1) as f64).log2() * 2.0;
    BASE_BIT_DEPTH + extra.round() as u8
}

/// The pixel value at/above which a sample is considered clipped.
///
/// `2^bit_depth - 1 - SATURATION_MARGIN`.
pub fn saturation_ceiling(bit_depth: u8) -> u16 {
    ((1u32 << bit_depth) - 1) as u16 - SATURATION_MARGIN
}

// =============================================================================
// Modalities
// =============================================================================

/// One auxiliary imaging dimension driven by an auxiliary device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modality {
    /// Phase-shifting fringe projector (illumination phase).
    Projector,
    /// Tunable optical filter (wavelength).
    Filter,
    /// Rotation stage (viewing angle).
    Stage,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Projector => write!(f, "projector"),
            Modality::Filter => write!(f, "filter"),
            Modality::Stage => write!(f, "stage"),
        }
    }
}

/// A 2-D 8-bit pattern for the projector, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Pattern {
    /// Pattern width in projector pixels.
    pub width: u32,
    /// Pattern height in projector pixels.
    pub height: u32,
    /// Greyscale values, row-major.
    pub data: Vec<u8>,
}

// =============================================================================
// Driver Capability Traits
// =============================================================================

/// Camera capability trait.
///
/// The sequencing core works against this trait instead of a vendor SDK.
/// Transient capture failure is signalled by `Ok(None)`; a driver that
/// cannot initialize at all reports that once, at registry-add time.
#[async_trait]
pub trait CameraDriver: Send {
    /// Capture a single raw frame. `Ok(None)` on transient failure.
    async fn capture_one(&mut self) -> Result<Option<Frame>>;

    /// Capture `n` raw frames back to back. `Ok(None)` on transient failure.
    async fn capture_burst(&mut self, n: u32) -> Result<Option<Vec<Frame>>>;

    /// Set exposure time in microseconds.
    async fn set_exposure(&mut self, usec: f64) -> Result<()>;

    /// Set sensor gain in dB.
    async fn set_gain(&mut self, db: f64) -> Result<()>;

    /// Set pixel binning factor.
    async fn set_binning(&mut self, k: u32) -> Result<()>;

    /// Device-reported (min, max) exposure range in microseconds.
    async fn exposure_range(&self) -> Result<(f64, f64)>;

    /// Current delivered frame size (width, height) in pixels.
    async fn frame_size(&self) -> Result<(u32, u32)>;
}

/// Phase-shifting projector capability trait.
#[async_trait]
pub trait ProjectorDriver: Send {
    /// Native display resolution (width, height) in pixels.
    fn resolution(&self) -> (u32, u32);

    /// Display a pattern. Errors on display failure.
    async fn display(&mut self, pattern: &Pattern) -> Result<()>;
}

/// Tunable optical filter capability trait.
#[async_trait]
pub trait FilterDriver: Send {
    /// Enumerate attached filter devices.
    async fn list_devices(&self) -> Result<Vec<String>>;

    /// Open a device by id.
    async fn open(&mut self, id: &str) -> Result<()>;

    /// Device-reported (min, max) wavelength range in nanometers.
    async fn wavelength_range(&self) -> Result<(f64, f64)>;

    /// Tune to a wavelength. `Ok(false)` means the request was out of range
    /// and rejected; the filter state is unchanged.
    async fn set_wavelength(&mut self, nm: f64) -> Result<bool>;

    /// Release the device.
    async fn close(&mut self) -> Result<()>;
}

/// Rotation stage capability trait.
#[async_trait]
pub trait StageDriver: Send {
    /// Find the reference position. Errors on homing failure.
    async fn home(&mut self) -> Result<()>;

    /// Move to an absolute angle in degrees. With `blocking`, returns after
    /// motion completes.
    async fn move_to(&mut self, angle_deg: f64, blocking: bool) -> Result<()>;

    /// True while the stage is moving.
    async fn is_in_motion(&self) -> Result<bool>;
}

// =============================================================================
// Persistence
// =============================================================================

/// Output encodings supported by the frame store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    /// 8-bit raster, rescaled to full range.
    Raster8,
    /// 16-bit raster, samples as captured.
    Raster16,
    /// Binary archive of the full frame (samples plus metadata).
    Archive,
}

impl SaveFormat {
    /// Conventional filename extension for the format.
    pub fn extension(&self) -> &'static str {
        match self {
            SaveFormat::Raster8 => "pgm",
            SaveFormat::Raster16 => "pgm",
            SaveFormat::Archive => "bin",
        }
    }
}

/// Durable frame storage.
///
/// Implementations assign a monotonically increasing index per save so a
/// session never overwrites its own prior output.
#[async_trait]
pub trait PersistenceSink: Send {
    /// Persist one frame under the given label. Returns the written path.
    async fn save(&mut self, frame: &Frame, label: &str, format: SaveFormat) -> Result<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(data: Vec<u16>) -> Frame {
        Frame {
            width: data.len() as u32,
            height: 1,
            bit_depth: BASE_BIT_DEPTH,
            sequence: 0,
            timestamp: Utc::now(),
            data,
        }
    }

    #[test]
    fn test_frame_max_pixel() {
        assert_eq!(frame_with(vec![1, 4095, 7]).max_pixel(), 4095);
        assert_eq!(frame_with(vec![]).max_pixel(), 0);
    }

    #[test]
    fn test_effective_bit_depth_tracks_binning() {
        assert_eq!(effective_bit_depth(1), 12);
        assert_eq!(effective_bit_depth(2), 14);
        assert_eq!(effective_bit_depth(4), 16);
    }

    #[test]
    fn test_saturation_ceiling() {
        // 2^12 - 1 - 7
        assert_eq!(saturation_ceiling(12), 4088);
        // 2^14 - 1 - 7
        assert_eq!(saturation_ceiling(14), 16376);
    }

    #[test]
    fn test_modality_display() {
        assert_eq!(Modality::Projector.to_string(), "projector");
        assert_eq!(Modality::Filter.to_string(), "filter");
        assert_eq!(Modality::Stage.to_string(), "stage");
    }
}
