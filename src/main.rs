//! Headless demonstration binary for the imaging rig core.
//!
//! Wires the mock drivers through the full pipeline: live acquisition,
//! burst recording, and sequence plans for each auxiliary modality. The
//! vendor shims plug in behind the same traits the mocks implement.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use rust_rig::acquisition::{AcquisitionLoop, CaptureEngine};
use rust_rig::config::Settings;
use rust_rig::core::{AcquisitionConfig, Modality, Roi};
use rust_rig::exposure::ExposureController;
use rust_rig::instrument::mock::{MockCamera, MockFilter, MockProjector, MockStage};
use rust_rig::instrument::{DeviceRegistry, FilterDevice, ProjectorDevice, StageDevice};
use rust_rig::sequence::{record_burst, SequenceOrchestrator, SequencePlan};
use rust_rig::storage::FrameStore;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rust_rig", about = "Imaging rig acquisition core (mock hardware)")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live loop and report published frames.
    Live {
        /// Number of frames to observe before stopping.
        #[arg(long, default_value_t = 20)]
        frames: u32,
    },
    /// Capture and persist a burst of frames.
    Burst {
        /// Number of frames to record.
        #[arg(long, default_value_t = 10)]
        frames: u32,
    },
    /// Run a sequence plan for one modality and persist the dataset.
    Sequence {
        /// The modality to sweep.
        modality: ModalityArg,
        /// Re-converge exposure at every step.
        #[arg(long)]
        reconverge: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModalityArg {
    Projector,
    Filter,
    Stage,
}

impl From<ModalityArg> for Modality {
    fn from(arg: ModalityArg) -> Self {
        match arg {
            ModalityArg::Projector => Modality::Projector,
            ModalityArg::Filter => Modality::Filter,
            ModalityArg::Stage => Modality::Stage,
        }
    }
}

fn engine_from(settings: &Settings) -> CaptureEngine {
    let camera = MockCamera::new(256, 256).with_noise();
    let config = AcquisitionConfig {
        exposure_us: settings.acquisition.exposure_us,
        gain: settings.acquisition.gain,
        binning: settings.acquisition.binning,
        navgs: settings.acquisition.navgs,
        roi: Roi::default(),
    };
    CaptureEngine::new(Box::new(camera), config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;
    let engine = engine_from(&settings);
    engine.apply_config().await?;
    let period = Duration::from_millis(settings.acquisition.frame_period_ms);

    match cli.command {
        Command::Live { frames } => {
            let mut handle = AcquisitionLoop::start(engine, period);
            let mut rx = handle.subscribe();
            for _ in 0..frames {
                rx.changed().await?;
                if let Some(live) = rx.borrow_and_update().clone() {
                    info!(
                        "frame {} max = {}{}",
                        live.frame.sequence,
                        live.frame.max_pixel(),
                        if live.saturated { " (saturated)" } else { "" }
                    );
                }
            }
            handle.stop().await;
        }
        Command::Burst { frames } => {
            let mut store = FrameStore::from_settings(&settings.storage)?;
            let paths = record_burst(
                &engine,
                &mut store,
                settings.storage.format,
                frames,
                None,
            )
            .await?;
            info!("Recorded {} frames", paths.len());
        }
        Command::Sequence {
            modality,
            reconverge,
        } => {
            let modality = Modality::from(modality);
            let mut registry = DeviceRegistry::new();
            let plan = match modality {
                Modality::Projector => {
                    let projector =
                        MockProjector::new(settings.projector.fringes * 40, 480);
                    let device =
                        ProjectorDevice::activate(projector, settings.projector.fringes).await?;
                    registry.insert(Box::new(device))?;
                    SequencePlan::fringe_sweep(settings.projector.phases, reconverge)
                }
                Modality::Filter => {
                    let device = FilterDevice::activate(MockFilter::new()).await?;
                    registry.insert(Box::new(device))?;
                    SequencePlan::wavelength_sweep(
                        settings.filter.start_nm,
                        settings.filter.stop_nm,
                        settings.filter.step_nm,
                        reconverge,
                    )
                }
                Modality::Stage => {
                    let device = StageDevice::activate(MockStage::new()).await?;
                    registry.insert(Box::new(device))?;
                    SequencePlan::angle_sweep(&settings.stage.angles, reconverge)
                }
            };

            let mut handle = AcquisitionLoop::start(engine.clone(), period);
            let mut store = FrameStore::from_settings(&settings.storage)?;
            let controller = ExposureController::new(
                settings.exposure.target_fraction,
                settings.exposure.max_iterations,
            );
            let mut orchestrator =
                SequenceOrchestrator::new(engine, &mut store, settings.storage.format)
                    .with_exposure(controller);

            let device = registry.get_mut(modality)?;
            let dataset = match orchestrator.run(&plan, device, Some(&mut handle)).await {
                Ok(dataset) => {
                    info!(
                        "Dataset {} complete: {} frames",
                        dataset.id,
                        dataset.entries.len()
                    );
                    dataset
                }
                Err(abort) => {
                    info!(
                        "Dataset incomplete ({} of {} steps): {}",
                        abort.partial.entries.len(),
                        plan.len(),
                        abort.error
                    );
                    abort.partial
                }
            };

            // Sidecar manifest so the run can be inventoried without
            // decoding the frames.
            let manifest_path = std::path::Path::new(&settings.storage.default_path)
                .join(format!("dataset_{}.json", dataset.id));
            std::fs::write(
                &manifest_path,
                serde_json::to_string_pretty(&dataset.manifest())?,
            )?;
            info!("Wrote manifest {}", manifest_path.display());

            handle.stop().await;
            registry.shutdown_all().await;
        }
    }

    Ok(())
}
