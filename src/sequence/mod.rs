//! Device sequencing: plans, datasets, and the orchestrator.
//!
//! A [`SequencePlan`] is the ordered set of auxiliary-device states to visit
//! when building a labeled dataset; the [`SequenceOrchestrator`] walks the
//! plan against one device, re-converging exposure where a step asks for it,
//! capturing through the same path as the live loop, and persisting one
//! frame per step.
//!
//! Failure semantics are deliberately uneven (see the per-step protocol on
//! [`SequenceOrchestrator::run`]): a driver rejection or exposure failure
//! aborts the remaining plan (a dataset with silent gaps in modality state
//! is worse than a short one), while a persistence failure is recorded and
//! the plan continues, because a frame in memory can be re-saved later.

pub mod pattern;

use crate::acquisition::{AcquisitionHandle, CaptureEngine};
use crate::core::{Frame, Modality, PersistenceSink, SaveFormat};
use crate::error::{AppResult, RigError, SequenceError};
use crate::exposure::ExposureController;
use crate::instrument::AuxDevice;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// A modality-specific device state to visit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepTarget {
    /// Display the fringe pattern for phase `index` of `total`.
    Phase {
        /// Zero-based phase index.
        index: u32,
        /// Total phase steps in the sweep.
        total: u32,
    },
    /// Tune the filter to a wavelength in nanometers.
    Wavelength(f64),
    /// Rotate the stage to an absolute angle in degrees.
    Angle(f64),
}

/// One element of a dataset-collection plan.
#[derive(Clone, Debug)]
pub struct SequenceStep {
    /// The device state to command.
    pub target: StepTarget,
    /// Human-readable label, used in the output filename.
    pub label: String,
    /// Re-converge exposure before capturing this step.
    pub reconverge_exposure: bool,
}

/// An ordered list of steps plus the baseline state the device returns to.
#[derive(Clone, Debug)]
pub struct SequencePlan {
    /// The modality this plan drives.
    pub modality: Modality,
    /// Steps in capture order.
    pub steps: Vec<SequenceStep>,
    /// State the device is returned to after the plan completes or aborts.
    pub baseline: StepTarget,
}

impl SequencePlan {
    /// Phase-shifting fringe sweep: phases `0..nphases`, labeled by the
    /// phase shift in degrees, baseline phase 0.
    pub fn fringe_sweep(nphases: u32, reconverge: bool) -> Self {
        let steps = (0..nphases)
            .map(|p| SequenceStep {
                target: StepTarget::Phase {
                    index: p,
                    total: nphases,
                },
                label: format!(
                    "{:03}",
                    (360.0 * f64::from(p) / f64::from(nphases)).round() as u32
                ),
                reconverge_exposure: reconverge,
            })
            .collect();

        Self {
            modality: Modality::Projector,
            steps,
            baseline: StepTarget::Phase {
                index: 0,
                total: nphases,
            },
        }
    }

    /// Wavelength sweep from `start_nm` toward `stop_nm` (exclusive) in
    /// `step_nm` increments, labeled by wavelength, baseline at the first
    /// wavelength.
    pub fn wavelength_sweep(start_nm: f64, stop_nm: f64, step_nm: f64, reconverge: bool) -> Self {
        let mut steps = Vec::new();
        let mut nm = start_nm;
        while nm < stop_nm {
            steps.push(SequenceStep {
                target: StepTarget::Wavelength(nm),
                label: format!("{:03}", nm.round() as u32),
                reconverge_exposure: reconverge,
            });
            nm += step_nm;
        }

        Self {
            modality: Modality::Filter,
            steps,
            baseline: StepTarget::Wavelength(start_nm),
        }
    }

    /// Rotation sweep over absolute angles, labeled by angle, baseline at
    /// the first angle.
    pub fn angle_sweep(angles: &[f64], reconverge: bool) -> Self {
        let steps = angles
            .iter()
            .map(|&angle| SequenceStep {
                target: StepTarget::Angle(angle),
                label: format!("{angle:05.1}"),
                reconverge_exposure: reconverge,
            })
            .collect();

        Self {
            modality: Modality::Stage,
            steps,
            baseline: StepTarget::Angle(angles.first().copied().unwrap_or(0.0)),
        }
    }

    /// Number of steps in the plan.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True for a plan with no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// One captured step of a dataset.
#[derive(Clone, Debug)]
pub struct DatasetEntry {
    /// The step's label.
    pub label: String,
    /// The captured frame.
    pub frame: Arc<Frame>,
    /// False if the sink failed to save this entry (re-save candidates).
    pub persisted: bool,
}

/// The ordered outputs of running a sequence plan.
#[derive(Clone, Debug)]
pub struct Dataset {
    /// Unique id for the run.
    pub id: Uuid,
    /// The modality that was swept.
    pub modality: Modality,
    /// When the plan started running.
    pub started: DateTime<Utc>,
    /// When the last step finished; `None` if the plan aborted.
    pub completed: Option<DateTime<Utc>>,
    /// One entry per completed step, in step order.
    pub entries: Vec<DatasetEntry>,
}

impl Dataset {
    fn new(modality: Modality) -> Self {
        Self {
            id: Uuid::new_v4(),
            modality,
            started: Utc::now(),
            completed: None,
            entries: Vec::new(),
        }
    }

    /// Sidecar manifest describing this run, without the pixel data.
    pub fn manifest(&self) -> DatasetManifest {
        DatasetManifest {
            id: self.id,
            modality: self.modality,
            started: self.started,
            completed: self.completed,
            entries: self
                .entries
                .iter()
                .map(|entry| ManifestEntry {
                    label: entry.label.clone(),
                    sequence: entry.frame.sequence,
                    persisted: entry.persisted,
                })
                .collect(),
        }
    }
}

/// Serializable description of a dataset run, written alongside the frames
/// so a session can be reconstructed without decoding them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetManifest {
    /// The run's id.
    pub id: Uuid,
    /// The modality that was swept.
    pub modality: Modality,
    /// When the plan started running.
    pub started: DateTime<Utc>,
    /// When the last step finished; `None` for an aborted run.
    pub completed: Option<DateTime<Utc>>,
    /// One entry per completed step, in step order.
    pub entries: Vec<ManifestEntry>,
}

/// One step of a [`DatasetManifest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// The step's label.
    pub label: String,
    /// Capture sequence number of the step's frame.
    pub sequence: u64,
    /// False if the sink failed to save the frame.
    pub persisted: bool,
}

/// A plan abort carrying the partial dataset collected before the failure.
///
/// The entries are the steps completed before `error.step_index`; they are
/// valid data, just an incomplete sweep.
#[derive(Debug)]
pub struct SequenceAbort {
    /// Entries captured before the abort.
    pub partial: Dataset,
    /// The failure, naming the step that caused it.
    pub error: SequenceError,
}

impl fmt::Display for SequenceAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for SequenceAbort {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Runs a sequence plan against one auxiliary device.
pub struct SequenceOrchestrator<'a> {
    engine: CaptureEngine,
    sink: &'a mut dyn PersistenceSink,
    format: SaveFormat,
    exposure: Option<ExposureController>,
}

impl<'a> SequenceOrchestrator<'a> {
    /// Orchestrator over the shared capture path and a persistence sink.
    pub fn new(
        engine: CaptureEngine,
        sink: &'a mut dyn PersistenceSink,
        format: SaveFormat,
    ) -> Self {
        Self {
            engine,
            sink,
            format,
            exposure: None,
        }
    }

    /// Attach an exposure controller for steps that request reconvergence.
    pub fn with_exposure(mut self, controller: ExposureController) -> Self {
        self.exposure = Some(controller);
        self
    }

    /// Run a plan to completion or first abort.
    ///
    /// Per step, in order: command the device to the step target (rejection
    /// aborts the remaining plan); re-converge exposure if the step asks for
    /// it (non-convergence aborts identically); capture one frame through
    /// the shared path (no frame aborts, since a gap mid-sequence is not
    /// acceptable); persist it (failure is recorded, the plan continues).
    ///
    /// The device is returned to the plan's baseline exactly once, whether
    /// the plan succeeded or aborted. If a live loop handle is given, the
    /// loop is suspended for the whole run and resumed afterwards.
    pub async fn run(
        &mut self,
        plan: &SequencePlan,
        device: &mut dyn AuxDevice,
        mut acquisition: Option<&mut AcquisitionHandle>,
    ) -> Result<Dataset, Box<SequenceAbort>> {
        if let Some(handle) = acquisition.as_mut() {
            handle.suspend().await;
        }

        info!(
            "Running {} sequence: {} steps",
            plan.modality,
            plan.steps.len()
        );
        let result = self.run_steps(plan, device).await;

        // Baseline restore happens exactly once, success or abort. A failed
        // restore after an abort must not mask the original error.
        if let Err(e) = device.apply(&plan.baseline).await {
            warn!("Failed to restore {} baseline state: {e}", plan.modality);
        }

        if let Some(handle) = acquisition {
            handle.resume();
        }

        result
    }

    async fn run_steps(
        &mut self,
        plan: &SequencePlan,
        device: &mut dyn AuxDevice,
    ) -> Result<Dataset, Box<SequenceAbort>> {
        let mut dataset = Dataset::new(plan.modality);

        for (step_index, step) in plan.steps.iter().enumerate() {
            info!(
                "Step {}/{}: '{}'",
                step_index + 1,
                plan.steps.len(),
                step.label
            );

            if let Err(error) = device.apply(&step.target).await {
                return Err(abort(dataset, step_index, &step.label, error));
            }

            if step.reconverge_exposure {
                match self.exposure {
                    Some(controller) => {
                        if let Err(error) = controller.converge(&self.engine).await {
                            return Err(abort(dataset, step_index, &step.label, error));
                        }
                    }
                    None => warn!(
                        "Step '{}' requests exposure reconvergence but no controller is attached",
                        step.label
                    ),
                }
            }

            let frame = match self.engine.capture().await {
                Ok(Some(frame)) => Arc::new(frame),
                Ok(None) => {
                    return Err(abort(
                        dataset,
                        step_index,
                        &step.label,
                        RigError::CaptureFailed,
                    ))
                }
                Err(error) => return Err(abort(dataset, step_index, &step.label, error)),
            };

            let persisted = match self.sink.save(&frame, &step.label, self.format).await {
                Ok(path) => {
                    info!("Saved step '{}' to {}", step.label, path.display());
                    true
                }
                Err(e) => {
                    warn!("Failed to persist step '{}': {e}", step.label);
                    false
                }
            };

            dataset.entries.push(DatasetEntry {
                label: step.label.clone(),
                frame,
                persisted,
            });
        }

        dataset.completed = Some(Utc::now());
        info!(
            "{} sequence complete: {} frames",
            plan.modality,
            dataset.entries.len()
        );
        Ok(dataset)
    }
}

fn abort(
    partial: Dataset,
    step_index: usize,
    label: &str,
    error: RigError,
) -> Box<SequenceAbort> {
    warn!("Sequence aborted at step {step_index} ('{label}'): {error}");
    Box::new(SequenceAbort {
        partial,
        error: SequenceError {
            step_index,
            label: label.to_string(),
            error,
        },
    })
}

/// Capture `n` frames back to back and persist each one.
///
/// The headless counterpart of the original's video-sequence save: the live
/// loop (if given) is suspended for the whole burst and resumed afterwards.
/// Frames go through the shared capture path, so `navgs` averaging applies
/// to each burst frame. A transient capture failure aborts the burst; a
/// persistence failure skips that frame with a warning and continues.
pub async fn record_burst(
    engine: &CaptureEngine,
    sink: &mut dyn PersistenceSink,
    format: SaveFormat,
    n: u32,
    mut acquisition: Option<&mut AcquisitionHandle>,
) -> AppResult<Vec<PathBuf>> {
    if let Some(handle) = acquisition.as_mut() {
        handle.suspend().await;
    }

    let result = async {
        let mut paths = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let frame = engine.capture().await?.ok_or(RigError::CaptureFailed)?;
            match sink.save(&frame, "", format).await {
                Ok(path) => paths.push(path),
                Err(e) => warn!("Failed to persist burst frame {}: {e}", frame.sequence),
            }
        }
        Ok(paths)
    }
    .await;

    if let Some(handle) = acquisition {
        handle.resume();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fringe_sweep_labels_are_phase_degrees() {
        let plan = SequencePlan::fringe_sweep(4, false);
        let labels: Vec<&str> = plan.steps.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["000", "090", "180", "270"]);
        assert_eq!(plan.baseline, StepTarget::Phase { index: 0, total: 4 });
    }

    #[test]
    fn test_wavelength_sweep_matches_source_range() {
        // 420..730 in 10 nm steps is 31 wavelengths, 420 through 720.
        let plan = SequencePlan::wavelength_sweep(420.0, 730.0, 10.0, false);
        assert_eq!(plan.len(), 31);
        assert_eq!(plan.steps[0].label, "420");
        assert_eq!(plan.steps[30].label, "720");
        assert_eq!(plan.baseline, StepTarget::Wavelength(420.0));
    }

    #[test]
    fn test_manifest_roundtrips_as_json() {
        let mut dataset = Dataset::new(Modality::Projector);
        dataset.entries.push(DatasetEntry {
            label: "000".to_string(),
            frame: Arc::new(Frame {
                width: 1,
                height: 1,
                bit_depth: 12,
                sequence: 42,
                timestamp: Utc::now(),
                data: vec![7],
            }),
            persisted: true,
        });

        let text = serde_json::to_string(&dataset.manifest()).unwrap();
        let back: DatasetManifest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, dataset.id);
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].sequence, 42);
        assert!(back.entries[0].persisted);
    }

    #[test]
    fn test_angle_sweep_labels() {
        let plan = SequencePlan::angle_sweep(&[0.0, 22.5, 45.0], true);
        let labels: Vec<&str> = plan.steps.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["000.0", "022.5", "045.0"]);
        assert!(plan.steps.iter().all(|s| s.reconverge_exposure));
    }
}
