//! Auxiliary device management.
//!
//! Each auxiliary modality (projector, filter, stage) is independently
//! optional. [`DeviceRegistry`] holds at most one active device per
//! modality; orchestration code queries the registry instead of branching
//! on ad hoc "has device" booleans. Activation returns an explicit
//! `Result`; a driver that fails to initialize is reported once, at
//! registry-add time.
//!
//! [`AuxDevice`] binds a driver capability trait to the sequencing core:
//! one `apply` call drives the device to a [`StepTarget`] (pattern on the
//! projector, wavelength on the filter, angle on the stage), with command
//! rejection surfaced as `RigError::CommandRejected`.

pub mod mock;

use crate::core::{FilterDriver, Modality, Pattern, ProjectorDriver, StageDriver};
use crate::error::{AppResult, RigError};
use crate::sequence::pattern::fringe_pattern;
use crate::sequence::StepTarget;
use async_trait::async_trait;
use log::{info, warn};
use std::collections::HashMap;

/// One activated auxiliary device, ready to be driven through sequence
/// steps.
#[async_trait]
pub trait AuxDevice: Send {
    /// The modality this device serves.
    fn modality(&self) -> Modality;

    /// Drive the device to a step target. Errors abort the running plan.
    async fn apply(&mut self, target: &StepTarget) -> AppResult<()>;

    /// Release the device on deactivation or session close.
    async fn shutdown(&mut self) -> AppResult<()> {
        Ok(())
    }
}

// =============================================================================
// Projector
// =============================================================================

/// A phase-shifting fringe projector bound to a [`ProjectorDriver`].
pub struct ProjectorDevice<P> {
    driver: P,
    fringes: u32,
}

impl<P: ProjectorDriver> ProjectorDevice<P> {
    /// Activate the projector and display the phase-0 pattern.
    pub async fn activate(driver: P, fringes: u32) -> AppResult<Self> {
        let (width, height) = driver.resolution();
        info!("Projecting a ({width},{height}) image");

        let mut device = Self { driver, fringes };
        device
            .project(0, 1)
            .await
            .map_err(|e| RigError::DeviceInit(format!("projector display failed: {e}")))?;
        Ok(device)
    }

    async fn project(&mut self, index: u32, total: u32) -> AppResult<()> {
        let (width, height) = self.driver.resolution();
        let pattern = fringe_pattern(self.fringes, width, height, index, total);
        self.driver.display(&pattern).await?;
        Ok(())
    }
}

#[async_trait]
impl<P: ProjectorDriver> AuxDevice for ProjectorDevice<P> {
    fn modality(&self) -> Modality {
        Modality::Projector
    }

    async fn apply(&mut self, target: &StepTarget) -> AppResult<()> {
        match target {
            StepTarget::Phase { index, total } => self.project(*index, *total).await,
            other => Err(RigError::CommandRejected(format!(
                "projector cannot apply {other:?}"
            ))),
        }
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        // Blank the display so the rig is not left illuminated.
        let (width, height) = self.driver.resolution();
        let black = Pattern {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        };
        self.driver.display(&black).await?;
        Ok(())
    }
}

// =============================================================================
// Tunable filter
// =============================================================================

/// A tunable optical filter bound to a [`FilterDriver`].
pub struct FilterDevice<F> {
    driver: F,
}

impl<F: FilterDriver> FilterDevice<F> {
    /// Activate the first attached filter device.
    pub async fn activate(mut driver: F) -> AppResult<Self> {
        let devices = driver
            .list_devices()
            .await
            .map_err(|e| RigError::DeviceInit(e.to_string()))?;
        let first = devices
            .first()
            .ok_or_else(|| RigError::DeviceInit("no filter device detected".to_string()))?;

        driver
            .open(first)
            .await
            .map_err(|e| RigError::DeviceInit(format!("failed to open filter '{first}': {e}")))?;

        let (min, max) = driver
            .wavelength_range()
            .await
            .map_err(|e| RigError::DeviceInit(e.to_string()))?;
        info!("Filter '{first}' open, wavelength range {min:.0}-{max:.0} nm");

        Ok(Self { driver })
    }
}

#[async_trait]
impl<F: FilterDriver> AuxDevice for FilterDevice<F> {
    fn modality(&self) -> Modality {
        Modality::Filter
    }

    async fn apply(&mut self, target: &StepTarget) -> AppResult<()> {
        match target {
            StepTarget::Wavelength(nm) => {
                if self.driver.set_wavelength(*nm).await? {
                    Ok(())
                } else {
                    Err(RigError::CommandRejected(format!(
                        "wavelength {nm:.0} nm outside device range"
                    )))
                }
            }
            other => Err(RigError::CommandRejected(format!(
                "filter cannot apply {other:?}"
            ))),
        }
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        self.driver.close().await?;
        Ok(())
    }
}

// =============================================================================
// Rotation stage
// =============================================================================

/// A rotation stage bound to a [`StageDriver`].
pub struct StageDevice<S> {
    driver: S,
}

impl<S: StageDriver> StageDevice<S> {
    /// Activate the stage, homing it first so positions are trustworthy.
    pub async fn activate(mut driver: S) -> AppResult<Self> {
        driver.home().await.map_err(|e| {
            RigError::DeviceInit(format!("failed to locate the stage home position: {e}"))
        })?;
        info!("Stage homed");
        Ok(Self { driver })
    }
}

#[async_trait]
impl<S: StageDriver> AuxDevice for StageDevice<S> {
    fn modality(&self) -> Modality {
        Modality::Stage
    }

    async fn apply(&mut self, target: &StepTarget) -> AppResult<()> {
        match target {
            StepTarget::Angle(deg) => {
                self.driver.move_to(*deg, true).await?;
                Ok(())
            }
            other => Err(RigError::CommandRejected(format!(
                "stage cannot apply {other:?}"
            ))),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// At most one active device per auxiliary modality.
///
/// Absent at startup; devices are added on explicit user activation and
/// torn down on session close. A sequence plan for a modality may only run
/// while that modality is present here.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<Modality, Box<dyn AuxDevice>>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activated device. Fails if the modality already has one.
    pub fn insert(&mut self, device: Box<dyn AuxDevice>) -> AppResult<()> {
        let modality = device.modality();
        if self.devices.contains_key(&modality) {
            return Err(RigError::DeviceInit(format!(
                "{modality} driver already active"
            )));
        }
        info!("{modality} driver registered");
        self.devices.insert(modality, device);
        Ok(())
    }

    /// True if the modality has an active device.
    pub fn contains(&self, modality: Modality) -> bool {
        self.devices.contains_key(&modality)
    }

    /// Borrow the active device for a modality.
    pub fn get_mut(&mut self, modality: Modality) -> AppResult<&mut (dyn AuxDevice + 'static)> {
        self.devices
            .get_mut(&modality)
            .map(|device| device.as_mut())
            .ok_or(RigError::DeviceAbsent(modality))
    }

    /// Deactivate and release one modality's device.
    pub async fn remove(&mut self, modality: Modality) -> AppResult<()> {
        let mut device = self
            .devices
            .remove(&modality)
            .ok_or(RigError::DeviceAbsent(modality))?;
        device.shutdown().await?;
        info!("{modality} driver released");
        Ok(())
    }

    /// Tear down every registered device (session close).
    pub async fn shutdown_all(&mut self) {
        for (modality, mut device) in self.devices.drain() {
            if let Err(e) = device.shutdown().await {
                warn!("{modality} driver shutdown failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockFilter, MockProjector, MockStage};
    use super::*;

    #[tokio::test]
    async fn test_registry_starts_empty() {
        let mut registry = DeviceRegistry::new();
        assert!(!registry.contains(Modality::Projector));
        assert!(matches!(
            registry.get_mut(Modality::Filter),
            Err(RigError::DeviceAbsent(Modality::Filter))
        ));
    }

    #[tokio::test]
    async fn test_activation_lifecycle() {
        let mut registry = DeviceRegistry::new();

        let projector = ProjectorDevice::activate(MockProjector::new(64, 48), 16)
            .await
            .unwrap();
        registry.insert(Box::new(projector)).unwrap();
        assert!(registry.contains(Modality::Projector));

        registry.remove(Modality::Projector).await.unwrap();
        assert!(!registry.contains(Modality::Projector));
    }

    #[tokio::test]
    async fn test_second_activation_rejected() {
        let mut registry = DeviceRegistry::new();
        let filter = FilterDevice::activate(MockFilter::new()).await.unwrap();
        registry.insert(Box::new(filter)).unwrap();

        let second = FilterDevice::activate(MockFilter::new()).await.unwrap();
        assert!(registry.insert(Box::new(second)).is_err());
    }

    #[tokio::test]
    async fn test_stage_activation_homes_first() {
        let stage = MockStage::new();
        let device = StageDevice::activate(stage).await.unwrap();
        assert_eq!(device.modality(), Modality::Stage);
    }

    #[tokio::test]
    async fn test_failed_homing_is_init_error() {
        let stage = MockStage::new().failing_home();
        assert!(matches!(
            StageDevice::activate(stage).await,
            Err(RigError::DeviceInit(_))
        ));
    }

    #[tokio::test]
    async fn test_filter_rejects_out_of_range_wavelength() {
        let mut device = FilterDevice::activate(MockFilter::new()).await.unwrap();
        assert!(device.apply(&StepTarget::Wavelength(550.0)).await.is_ok());
        assert!(matches!(
            device.apply(&StepTarget::Wavelength(800.0)).await,
            Err(RigError::CommandRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_cross_modality_target_rejected() {
        let mut device = FilterDevice::activate(MockFilter::new()).await.unwrap();
        assert!(matches!(
            device.apply(&StepTarget::Angle(45.0)).await,
            Err(RigError::CommandRejected(_))
        ));
    }
}
