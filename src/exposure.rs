//! Closed-loop exposure convergence.
//!
//! The controller aims the peak pixel of a capture at a fixed fraction of
//! the saturation ceiling. The algorithm is two-phase and deliberately
//! asymmetric:
//!
//! 1. **De-saturation**: while the freshly captured frame is saturated,
//!    halve the exposure and re-capture. Bounded by `max_iterations`; a
//!    sensor that cannot de-saturate (minimum exposure still clipping under
//!    ambient light) fails with `ExposureNotConverged` instead of looping
//!    forever.
//! 2. **Linear scaling**: once unsaturated, scale the exposure so the peak
//!    lands at `ceiling x target_fraction`, clamp to the device range, and
//!    apply once. No re-check: a single-shot correction, not a servo.

use crate::acquisition::CaptureEngine;
use crate::error::{AppResult, RigError};
use log::{debug, info};

/// Default fraction of the saturation ceiling to aim the peak pixel at.
///
/// Calibrated constant; not to be re-tuned silently.
pub const TARGET_FRACTION: f64 = 0.98;

/// Result of a convergence run.
#[derive(Clone, Copy, Debug)]
pub struct ExposureOutcome {
    /// The exposure committed to the driver and config, in microseconds.
    pub exposure_us: f64,
    /// De-saturation halvings performed.
    pub iterations: u32,
    /// Peak pixel of the last unsaturated frame, pre-correction.
    pub max_pixel: u16,
}

/// Converges exposure time toward a target brightness fraction.
#[derive(Clone, Copy, Debug)]
pub struct ExposureController {
    /// Fraction of the ceiling to aim for.
    pub target_fraction: f64,
    /// De-saturation halvings allowed before giving up.
    pub max_iterations: u32,
}

impl Default for ExposureController {
    fn default() -> Self {
        Self {
            target_fraction: TARGET_FRACTION,
            max_iterations: 16,
        }
    }
}

impl ExposureController {
    /// Controller with explicit parameters.
    pub fn new(target_fraction: f64, max_iterations: u32) -> Self {
        Self {
            target_fraction,
            max_iterations,
        }
    }

    /// Run both phases against the shared capture path.
    ///
    /// Commits the final exposure to the driver and the shared acquisition
    /// config. A transient capture failure mid-convergence surfaces as
    /// `CaptureFailed`; the caller decides whether to retry the whole run.
    pub async fn converge(&self, engine: &CaptureEngine) -> AppResult<ExposureOutcome> {
        let ceiling = engine.saturation_ceiling().await;
        let (min_exposure, _) = engine.exposure_range().await?;
        let mut exposure = engine.config().await.exposure_us;
        let mut iterations = 0u32;

        // Phase 1: halve until unsaturated, within the iteration budget.
        let unsaturated = loop {
            let frame = engine.capture().await?.ok_or(RigError::CaptureFailed)?;
            if frame.max_pixel() < ceiling {
                break frame;
            }
            if iterations >= self.max_iterations {
                return Err(RigError::ExposureNotConverged {
                    iterations,
                    exposure_us: exposure,
                });
            }
            iterations += 1;
            exposure = (exposure / 2.0).max(min_exposure);
            engine.set_exposure(exposure).await?;
            debug!(
                "De-saturation step {iterations}: exposure halved to {exposure:.0} usec (max = {}, ceiling = {ceiling})",
                frame.max_pixel()
            );
        };

        // Phase 2: one linear correction toward ceiling x target_fraction.
        let max_pixel = unsaturated.max_pixel();
        let target = f64::from(ceiling) * self.target_fraction;
        let scaled = exposure * target / f64::from(max_pixel);
        let achieved = engine.set_exposure(scaled).await?;

        info!(
            "Exposure converged: {achieved:.0} usec after {iterations} halvings (peak {max_pixel} of ceiling {ceiling})"
        );

        Ok(ExposureOutcome {
            exposure_us: achieved,
            iterations,
            max_pixel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AcquisitionConfig;
    use crate::instrument::mock::MockCamera;

    async fn engine(camera: MockCamera, exposure_us: f64) -> CaptureEngine {
        let engine = CaptureEngine::new(Box::new(camera), AcquisitionConfig::default());
        engine.set_exposure(exposure_us).await.unwrap();
        engine
    }

    /// Raw 16-bit peak proportional to exposure: 0.8 counts per usec.
    fn linear_sensor(exposure_us: f64) -> u16 {
        (exposure_us * 0.8).round().min(f64::from(u16::MAX)) as u16
    }

    #[tokio::test]
    async fn test_unsaturated_start_skips_phase_one() {
        let camera = MockCamera::new(8, 8).with_response(linear_sensor);
        let engine = engine(camera, 10_000.0).await;

        let outcome = ExposureController::default().converge(&engine).await.unwrap();
        assert_eq!(outcome.iterations, 0);

        // The corrected exposure puts the peak within one quantization step
        // of ceiling * 0.98.
        let frame = engine.capture().await.unwrap().unwrap();
        let target = f64::from(engine.saturation_ceiling().await) * TARGET_FRACTION;
        assert!((f64::from(frame.max_pixel()) - target).abs() <= 1.0);
    }

    #[tokio::test]
    async fn test_halves_until_unsaturated() {
        // 200_000 usec -> raw peak clamps at u16::MAX: saturated. Two
        // halvings reach 50_000 usec -> peak 2500 (12-bit), unsaturated.
        let camera = MockCamera::new(8, 8).with_response(linear_sensor);
        let engine = engine(camera, 200_000.0).await;

        let outcome = ExposureController::default().converge(&engine).await.unwrap();
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.max_pixel, 2500);

        let frame = engine.capture().await.unwrap().unwrap();
        let target = f64::from(engine.saturation_ceiling().await) * TARGET_FRACTION;
        assert!((f64::from(frame.max_pixel()) - target).abs() <= 1.0);
    }

    #[tokio::test]
    async fn test_gives_up_when_sensor_cannot_desaturate() {
        // Clipped regardless of exposure, e.g. ambient light at minimum
        // exposure. This is the unbounded-loop case the bound exists for.
        let camera = MockCamera::new(8, 8).with_response(|_| u16::MAX);
        let engine = engine(camera, 10_000.0).await;

        let controller = ExposureController::new(TARGET_FRACTION, 4);
        let err = controller.converge(&engine).await.unwrap_err();
        match err {
            RigError::ExposureNotConverged { iterations, .. } => assert_eq!(iterations, 4),
            other => panic!("expected ExposureNotConverged, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_commits_exposure_to_shared_config() {
        let camera = MockCamera::new(8, 8).with_response(linear_sensor);
        let engine = engine(camera, 10_000.0).await;

        let outcome = ExposureController::default().converge(&engine).await.unwrap();
        let config = engine.config().await;
        assert!((config.exposure_us - outcome.exposure_us).abs() < f64::EPSILON);
    }
}
