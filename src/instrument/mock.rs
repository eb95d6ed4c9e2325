//! Mock drivers that generate synthetic data.
//!
//! These stand in for the vendor SDK shims during development and in tests.
//! The mock camera's brightness is a deterministic function of exposure
//! time, so the exposure controller converges against it the same way every
//! run; optional noise perturbs only the pixels below the peak.

use crate::core::{CameraDriver, FilterDriver, Frame, Pattern, ProjectorDriver, StageDriver};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type ResponseFn = Arc<dyn Fn(f64) -> u16 + Send + Sync>;

/// A camera whose peak pixel value is a deterministic function of the
/// exposure time (default: 0.32 raw counts per microsecond).
pub struct MockCamera {
    width: u32,
    height: u32,
    binning: u32,
    exposure_us: f64,
    gain_db: f64,
    exposure_limits: (f64, f64),
    response: ResponseFn,
    noise: bool,
    capture_delay: Duration,
    fail_remaining: Arc<AtomicU32>,
    captures: Arc<AtomicU64>,
}

impl MockCamera {
    /// Mock camera with the given sensor size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            binning: 1,
            exposure_us: 10_000.0,
            gain_db: 0.0,
            exposure_limits: (10.0, 1_000_000.0),
            response: Arc::new(|exposure_us| {
                (exposure_us * 0.32).min(f64::from(u16::MAX)) as u16
            }),
            noise: false,
            capture_delay: Duration::ZERO,
            fail_remaining: Arc::new(AtomicU32::new(0)),
            captures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the exposure-to-peak response function (raw 16-bit counts).
    pub fn with_response(mut self, f: impl Fn(f64) -> u16 + Send + Sync + 'static) -> Self {
        self.response = Arc::new(f);
        self
    }

    /// Override the reported exposure range.
    pub fn with_exposure_limits(mut self, min_us: f64, max_us: f64) -> Self {
        self.exposure_limits = (min_us, max_us);
        self
    }

    /// Make every capture take this long (for loop-cancellation tests).
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// Add sub-peak pixel noise.
    pub fn with_noise(mut self) -> Self {
        self.noise = true;
        self
    }

    /// Make the next `n` captures fail transiently (return no frame).
    pub fn failing_next(self, n: u32) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Shared counter of raw capture attempts, for test assertions.
    pub fn capture_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.captures)
    }

    /// Current gain setting in dB.
    pub fn gain(&self) -> f64 {
        self.gain_db
    }

    fn delivered_size(&self) -> (u32, u32) {
        (
            (self.width / self.binning).max(1),
            (self.height / self.binning).max(1),
        )
    }

    fn synth_frame(&self) -> Frame {
        let (width, height) = self.delivered_size();
        let count = width as usize * height as usize;
        let peak = (self.response)(self.exposure_us);

        // Linear ramp ending exactly at the peak, so max_pixel() is the
        // response value.
        let mut data: Vec<u16> = (0..count)
            .map(|i| {
                if count > 1 {
                    (u64::from(peak) * i as u64 / (count as u64 - 1)) as u16
                } else {
                    peak
                }
            })
            .collect();

        if self.noise && count > 1 {
            let mut rng = rand::thread_rng();
            for sample in data.iter_mut().take(count - 1) {
                *sample = sample.saturating_sub(rng.gen_range(0..=2));
            }
        }

        Frame {
            width,
            height,
            bit_depth: 16,
            sequence: 0,
            timestamp: Utc::now(),
            data,
        }
    }
}

#[async_trait]
impl CameraDriver for MockCamera {
    async fn capture_one(&mut self) -> Result<Option<Frame>> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if !self.capture_delay.is_zero() {
            tokio::time::sleep(self.capture_delay).await;
        }

        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Ok(None);
        }

        Ok(Some(self.synth_frame()))
    }

    async fn capture_burst(&mut self, n: u32) -> Result<Option<Vec<Frame>>> {
        let mut frames = Vec::with_capacity(n as usize);
        for _ in 0..n {
            match self.capture_one().await? {
                Some(frame) => frames.push(frame),
                None => return Ok(None),
            }
        }
        Ok(Some(frames))
    }

    async fn set_exposure(&mut self, usec: f64) -> Result<()> {
        self.exposure_us = usec;
        Ok(())
    }

    async fn set_gain(&mut self, db: f64) -> Result<()> {
        self.gain_db = db;
        Ok(())
    }

    async fn set_binning(&mut self, k: u32) -> Result<()> {
        if k == 0 {
            bail!("binning factor must be >= 1");
        }
        self.binning = k;
        Ok(())
    }

    async fn exposure_range(&self) -> Result<(f64, f64)> {
        Ok(self.exposure_limits)
    }

    async fn frame_size(&self) -> Result<(u32, u32)> {
        Ok(self.delivered_size())
    }
}

/// A projector that records every displayed pattern.
pub struct MockProjector {
    width: u32,
    height: u32,
    fail_display: bool,
    displayed: Arc<Mutex<Vec<Pattern>>>,
}

impl MockProjector {
    /// Mock projector with the given resolution.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fail_display: false,
            displayed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make every display call fail.
    pub fn failing(mut self) -> Self {
        self.fail_display = true;
        self
    }

    /// Shared history of displayed patterns, for test assertions.
    pub fn display_history(&self) -> Arc<Mutex<Vec<Pattern>>> {
        Arc::clone(&self.displayed)
    }
}

#[async_trait]
impl ProjectorDriver for MockProjector {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    async fn display(&mut self, pattern: &Pattern) -> Result<()> {
        if self.fail_display {
            bail!("projector display failure");
        }
        if let Ok(mut history) = self.displayed.lock() {
            history.push(pattern.clone());
        }
        Ok(())
    }
}

/// A tunable filter with a fixed wavelength range.
pub struct MockFilter {
    range: (f64, f64),
    current_nm: Option<f64>,
    open: bool,
    tuned: Arc<Mutex<Vec<f64>>>,
}

impl MockFilter {
    /// Mock filter with the 420-730 nm range of the reference hardware.
    pub fn new() -> Self {
        Self {
            range: (420.0, 730.0),
            current_nm: None,
            open: false,
            tuned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Override the reported wavelength range.
    pub fn with_range(mut self, min_nm: f64, max_nm: f64) -> Self {
        self.range = (min_nm, max_nm);
        self
    }

    /// The wavelength the filter is currently tuned to.
    pub fn current_wavelength(&self) -> Option<f64> {
        self.current_nm
    }

    /// True while the device is open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Shared history of accepted tuning commands, for test assertions.
    pub fn tuning_history(&self) -> Arc<Mutex<Vec<f64>>> {
        Arc::clone(&self.tuned)
    }
}

impl Default for MockFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FilterDriver for MockFilter {
    async fn list_devices(&self) -> Result<Vec<String>> {
        Ok(vec!["mock_lctf_0".to_string()])
    }

    async fn open(&mut self, _id: &str) -> Result<()> {
        self.open = true;
        Ok(())
    }

    async fn wavelength_range(&self) -> Result<(f64, f64)> {
        Ok(self.range)
    }

    async fn set_wavelength(&mut self, nm: f64) -> Result<bool> {
        let (min, max) = self.range;
        if !(min..=max).contains(&nm) {
            return Ok(false);
        }
        self.current_nm = Some(nm);
        if let Ok(mut tuned) = self.tuned.lock() {
            tuned.push(nm);
        }
        Ok(true)
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

/// A rotation stage that tracks commanded positions.
pub struct MockStage {
    homed: bool,
    position_deg: f64,
    fail_home: bool,
    reject_above_deg: Option<f64>,
    moves: Arc<Mutex<Vec<f64>>>,
}

impl MockStage {
    /// Mock stage at position 0, not yet homed.
    pub fn new() -> Self {
        Self {
            homed: false,
            position_deg: 0.0,
            fail_home: false,
            reject_above_deg: None,
            moves: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make homing fail.
    pub fn failing_home(mut self) -> Self {
        self.fail_home = true;
        self
    }

    /// Reject motion commands above this angle.
    pub fn rejecting_above(mut self, deg: f64) -> Self {
        self.reject_above_deg = Some(deg);
        self
    }

    /// Current stage position in degrees.
    pub fn position(&self) -> f64 {
        self.position_deg
    }

    /// Shared history of completed moves, for test assertions.
    pub fn move_history(&self) -> Arc<Mutex<Vec<f64>>> {
        Arc::clone(&self.moves)
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageDriver for MockStage {
    async fn home(&mut self) -> Result<()> {
        if self.fail_home {
            bail!("stage failed to find home position");
        }
        self.homed = true;
        self.position_deg = 0.0;
        Ok(())
    }

    async fn move_to(&mut self, angle_deg: f64, _blocking: bool) -> Result<()> {
        if !self.homed {
            bail!("stage not homed");
        }
        if let Some(limit) = self.reject_above_deg {
            if angle_deg > limit {
                bail!("motion to {angle_deg:.1} deg rejected (limit {limit:.1} deg)");
            }
        }
        self.position_deg = angle_deg;
        if let Ok(mut moves) = self.moves.lock() {
            moves.push(angle_deg);
        }
        Ok(())
    }

    async fn is_in_motion(&self) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_camera_peak_tracks_exposure() {
        let mut camera = MockCamera::new(8, 8);
        camera.set_exposure(1000.0).await.unwrap();
        let frame = camera.capture_one().await.unwrap().unwrap();
        assert_eq!(frame.max_pixel(), 320);

        camera.set_exposure(2000.0).await.unwrap();
        let frame = camera.capture_one().await.unwrap().unwrap();
        assert_eq!(frame.max_pixel(), 640);
    }

    #[tokio::test]
    async fn test_camera_binning_shrinks_frames() {
        let mut camera = MockCamera::new(16, 16);
        camera.set_binning(4).await.unwrap();
        assert_eq!(camera.frame_size().await.unwrap(), (4, 4));
        let frame = camera.capture_one().await.unwrap().unwrap();
        assert_eq!(frame.pixel_count(), 16);
    }

    #[tokio::test]
    async fn test_camera_transient_failures_run_out() {
        let mut camera = MockCamera::new(4, 4).failing_next(2);
        assert!(camera.capture_one().await.unwrap().is_none());
        assert!(camera.capture_one().await.unwrap().is_none());
        assert!(camera.capture_one().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_noise_never_raises_the_peak() {
        let mut camera = MockCamera::new(8, 8).with_noise();
        for _ in 0..10 {
            let frame = camera.capture_one().await.unwrap().unwrap();
            assert_eq!(frame.max_pixel(), 3200);
        }
    }

    #[tokio::test]
    async fn test_filter_boundary_wavelengths() {
        let mut filter = MockFilter::new();
        assert!(filter.set_wavelength(420.0).await.unwrap());
        assert!(filter.set_wavelength(730.0).await.unwrap());
        assert!(!filter.set_wavelength(419.9).await.unwrap());
        assert!(!filter.set_wavelength(800.0).await.unwrap());
        assert_eq!(filter.current_wavelength(), Some(730.0));
    }

    #[tokio::test]
    async fn test_stage_requires_homing() {
        let mut stage = MockStage::new();
        assert!(stage.move_to(45.0, true).await.is_err());
        stage.home().await.unwrap();
        assert!(stage.move_to(45.0, true).await.is_ok());
        assert!((stage.position() - 45.0).abs() < f64::EPSILON);
    }
}
