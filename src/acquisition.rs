//! The shared capture path and the live acquisition loop.
//!
//! [`CaptureEngine`] is the single route to the camera: burst capture,
//! integer averaging, bit-depth normalization, and sequence numbering all
//! happen here, so the live loop and a running sequence plan produce
//! identical frames. The camera is non-reentrant; the engine serializes
//! access behind an async mutex, while the suspend/resume handshake on
//! [`AcquisitionHandle`] is what actually keeps the live loop and the
//! orchestrator from competing for it.
//!
//! [`AcquisitionLoop`] is the live polling loop: capture, classify
//! saturation, publish into a single-slot `watch` channel. The display
//! consumer always sees the newest frame, never a backlog.

use crate::core::{effective_bit_depth, AcquisitionConfig, CameraDriver, Frame};
use crate::error::AppResult;
use crate::processing::{FrameAverager, SaturationClassifier};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// The one capture path shared by the live loop and the orchestrator.
///
/// Cloning is cheap; clones share the camera, the acquisition config, and
/// the frame counter.
#[derive(Clone)]
pub struct CaptureEngine {
    camera: Arc<Mutex<Box<dyn CameraDriver>>>,
    config: Arc<RwLock<AcquisitionConfig>>,
    counter: Arc<AtomicU64>,
}

impl CaptureEngine {
    /// Wrap a camera driver with an initial configuration.
    pub fn new(camera: Box<dyn CameraDriver>, config: AcquisitionConfig) -> Self {
        Self {
            camera: Arc::new(Mutex::new(camera)),
            config: Arc::new(RwLock::new(config)),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the current acquisition configuration.
    pub async fn config(&self) -> AcquisitionConfig {
        self.config.read().await.clone()
    }

    /// Push the configured exposure, gain, and binning to the driver.
    ///
    /// Run once after construction so the hardware state matches the
    /// configuration before the first capture.
    pub async fn apply_config(&self) -> AppResult<()> {
        let config = self.config.read().await.clone();
        let mut camera = self.camera.lock().await;
        camera.set_exposure(config.exposure_us).await?;
        camera.set_gain(config.gain).await?;
        camera.set_binning(config.binning).await?;
        Ok(())
    }

    /// Saturation ceiling at the current binning.
    pub async fn saturation_ceiling(&self) -> u16 {
        self.config.read().await.saturation_ceiling()
    }

    /// Capture one frame through the full pipeline.
    ///
    /// With `navgs > 1`, a burst is captured and averaged first. Samples are
    /// then truncate-divided by 16 to strip the four padding bits of the
    /// Mono16 transport, and the frame is stamped with its effective bit
    /// depth and a session-monotonic sequence number. `Ok(None)` signals a
    /// transient capture failure; retry policy is the caller's.
    pub async fn capture(&self) -> AppResult<Option<Frame>> {
        let (navgs, binning) = {
            let config = self.config.read().await;
            (config.navgs, config.binning)
        };

        let mut camera = self.camera.lock().await;
        let averaged = if navgs == 1 {
            match camera.capture_one().await? {
                Some(frame) => frame,
                None => return Ok(None),
            }
        } else {
            match camera.capture_burst(navgs).await? {
                Some(frames) => FrameAverager::average(&frames)?,
                None => return Ok(None),
            }
        };
        drop(camera);

        let mut frame = averaged;
        for sample in &mut frame.data {
            *sample /= 16;
        }
        frame.bit_depth = effective_bit_depth(binning);
        frame.sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(Some(frame))
    }

    /// Commit a new exposure time, clamped to the device-reported range.
    ///
    /// The driver is updated first; the shared config only after the driver
    /// accepts. Returns the clamped value actually set.
    pub async fn set_exposure(&self, usec: f64) -> AppResult<f64> {
        let (min, max) = self.exposure_range().await?;
        let clamped = usec.clamp(min, max);

        self.camera.lock().await.set_exposure(clamped).await?;
        self.config.write().await.exposure_us = clamped;
        info!("Setting exposure = {clamped:.0} usec");
        Ok(clamped)
    }

    /// Commit a new sensor gain.
    pub async fn set_gain(&self, db: f64) -> AppResult<()> {
        self.camera.lock().await.set_gain(db).await?;
        self.config.write().await.gain = db;
        info!("Setting gain = {db:.1} dB");
        Ok(())
    }

    /// Commit a new binning factor. Changes the delivered frame size and the
    /// effective bit depth.
    pub async fn set_binning(&self, k: u32) -> AppResult<()> {
        self.camera.lock().await.set_binning(k).await?;
        self.config.write().await.binning = k;
        info!("Setting binning = {k}");
        Ok(())
    }

    /// Set the number of frames averaged per published frame.
    pub async fn set_navgs(&self, navgs: u32) {
        self.config.write().await.navgs = navgs.max(1);
        info!("Setting navgs = {}", navgs.max(1));
    }

    /// Device-reported (min, max) exposure range in microseconds.
    pub async fn exposure_range(&self) -> AppResult<(f64, f64)> {
        Ok(self.camera.lock().await.exposure_range().await?)
    }

    /// Delivered frame size (width, height) in pixels.
    pub async fn frame_size(&self) -> AppResult<(u32, u32)> {
        Ok(self.camera.lock().await.frame_size().await?)
    }
}

/// Live-loop lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// No captures are scheduled.
    Idle,
    /// Capturing and publishing on the frame period.
    Live,
    /// Live, but the publish cadence is paused and the camera untouched.
    Suspended,
}

/// A published frame plus its saturation verdict.
#[derive(Clone, Debug)]
pub struct LiveFrame {
    /// The captured frame.
    pub frame: Arc<Frame>,
    /// True iff any pixel reached the saturation ceiling.
    pub saturated: bool,
}

/// The live polling loop.
///
/// `start` spawns the loop task and hands back an [`AcquisitionHandle`];
/// there is no further state on this type.
pub struct AcquisitionLoop;

impl AcquisitionLoop {
    /// Transition `Idle -> Live`: schedule the first capture and return the
    /// control handle.
    pub fn start(engine: CaptureEngine, period: Duration) -> AcquisitionHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let (suspend_tx, suspend_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(LoopState::Live);
        let (latest_tx, latest_rx) = watch::channel::<Option<LiveFrame>>(None);

        let task = tokio::spawn(async move {
            info!("Acquisition loop started ({} ms period)", period.as_millis());

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    // Each completed capture schedules the next after a
                    // fixed delay, so a slow capture stretches the cadence
                    // instead of queueing ticks.
                    _ = tokio::time::sleep(period) => {
                        if *suspend_rx.borrow() {
                            if *state_tx.borrow() != LoopState::Suspended {
                                debug!("Acquisition loop suspended");
                                let _ = state_tx.send(LoopState::Suspended);
                            }
                            continue;
                        }
                        if *state_tx.borrow() == LoopState::Suspended {
                            debug!("Acquisition loop resumed");
                            let _ = state_tx.send(LoopState::Live);
                        }

                        match engine.capture().await {
                            Ok(Some(frame)) => {
                                let ceiling = engine.saturation_ceiling().await;
                                let report = SaturationClassifier::classify(&frame, ceiling);
                                if report.is_saturated {
                                    debug!(
                                        "Frame {} saturated (max = {}, ceiling = {})",
                                        frame.sequence,
                                        frame.max_pixel(),
                                        ceiling
                                    );
                                }
                                let _ = latest_tx.send(Some(LiveFrame {
                                    frame: Arc::new(frame),
                                    saturated: report.is_saturated,
                                }));
                            }
                            // Transient: log and keep scheduling.
                            Ok(None) => warn!("Failed to collect an image"),
                            Err(e) => warn!("Capture error: {e}"),
                        }
                    }
                }
            }

            let _ = state_tx.send(LoopState::Idle);
            info!("Acquisition loop stopped");
        });

        AcquisitionHandle {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
            suspend_tx,
            state_rx,
            latest_rx,
        }
    }
}

/// Control handle for a running acquisition loop.
pub struct AcquisitionHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    suspend_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<LoopState>,
    latest_rx: watch::Receiver<Option<LiveFrame>>,
}

impl AcquisitionHandle {
    /// Current loop state.
    pub fn state(&self) -> LoopState {
        *self.state_rx.borrow()
    }

    /// Newest published frame, if any has been published yet.
    pub fn latest(&self) -> Option<LiveFrame> {
        self.latest_rx.borrow().clone()
    }

    /// Subscribe to the single-slot latest-frame observable.
    pub fn subscribe(&self) -> watch::Receiver<Option<LiveFrame>> {
        self.latest_rx.clone()
    }

    /// Pause the publish cadence without stopping the loop.
    ///
    /// Returns once the loop has acknowledged the suspension, i.e. no
    /// capture is in flight and none will start until [`resume`]. A loop
    /// that has already stopped acknowledges immediately.
    ///
    /// [`resume`]: AcquisitionHandle::resume
    pub async fn suspend(&mut self) {
        let _ = self.suspend_tx.send(true);
        // wait_for checks the current value first, so an Idle loop returns
        // without waiting for a tick.
        let _ = self
            .state_rx
            .wait_for(|state| matches!(state, LoopState::Suspended | LoopState::Idle))
            .await;
    }

    /// Resume the publish cadence after [`suspend`].
    ///
    /// [`suspend`]: AcquisitionHandle::suspend
    pub fn resume(&self) {
        let _ = self.suspend_tx.send(false);
    }

    /// Transition `Live -> Idle`.
    ///
    /// No further captures are scheduled; an in-flight capture finishes and
    /// publishes before the loop task exits.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Acquisition task join failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockCamera;

    fn engine_with(camera: MockCamera) -> CaptureEngine {
        CaptureEngine::new(Box::new(camera), AcquisitionConfig::default())
    }

    #[tokio::test]
    async fn test_capture_strips_padding_bits() {
        // Raw peak 16000 -> 1000 after the truncating divide by 16.
        let camera = MockCamera::new(8, 8).with_response(|_| 16000);
        let engine = engine_with(camera);

        let frame = engine.capture().await.unwrap().unwrap();
        assert_eq!(frame.max_pixel(), 1000);
        assert_eq!(frame.bit_depth, 12);
    }

    #[tokio::test]
    async fn test_capture_assigns_monotonic_sequence() {
        let engine = engine_with(MockCamera::new(4, 4));
        let a = engine.capture().await.unwrap().unwrap();
        let b = engine.capture().await.unwrap().unwrap();
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
    }

    #[tokio::test]
    async fn test_capture_averages_burst() {
        let camera = MockCamera::new(4, 4).with_response(|_| 3200);
        let engine = engine_with(camera);
        engine.set_navgs(5).await;

        let frame = engine.capture().await.unwrap().unwrap();
        // Identical burst frames average to themselves; then /16.
        assert_eq!(frame.max_pixel(), 200);
    }

    #[tokio::test]
    async fn test_set_exposure_clamps_to_range() {
        let camera = MockCamera::new(4, 4).with_exposure_limits(100.0, 50_000.0);
        let engine = engine_with(camera);

        let set = engine.set_exposure(1e9).await.unwrap();
        assert!((set - 50_000.0).abs() < f64::EPSILON);
        assert!((engine.config().await.exposure_us - 50_000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_loop_publishes_and_stops() {
        let camera = MockCamera::new(4, 4);
        let captures = camera.capture_counter();
        let engine = engine_with(camera);

        let mut handle = AcquisitionLoop::start(engine, Duration::from_millis(5));
        let mut rx = handle.subscribe();
        // Wait for the first published frame.
        rx.changed().await.unwrap();
        assert!(handle.latest().is_some());
        assert_eq!(handle.state(), LoopState::Live);

        handle.stop().await;
        assert_eq!(handle.state(), LoopState::Idle);

        let after_stop = captures.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(captures.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_stop_mid_capture_publishes_in_flight_frame_once() {
        let camera = MockCamera::new(4, 4).with_capture_delay(Duration::from_millis(50));
        let captures = camera.capture_counter();
        let engine = engine_with(camera);

        let mut handle = AcquisitionLoop::start(engine, Duration::from_millis(1));
        // Let the loop enter its first capture, then stop mid-capture.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(captures.load(Ordering::SeqCst), 1);
        handle.stop().await;

        // The in-flight frame was completed and published exactly once, and
        // nothing further was scheduled.
        let published = handle.latest().unwrap();
        assert_eq!(published.frame.sequence, 1);
        assert_eq!(captures.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_transient_capture_failure_is_not_fatal() {
        let camera = MockCamera::new(4, 4).failing_next(3);
        let engine = engine_with(camera);

        let mut handle = AcquisitionLoop::start(engine, Duration::from_millis(1));
        let mut rx = handle.subscribe();
        // The loop keeps scheduling through the failures and eventually
        // publishes.
        rx.changed().await.unwrap();
        assert!(handle.latest().is_some());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_suspend_halts_captures_until_resume() {
        let camera = MockCamera::new(4, 4);
        let captures = camera.capture_counter();
        let engine = engine_with(camera);

        let mut handle = AcquisitionLoop::start(engine, Duration::from_millis(1));
        let mut rx = handle.subscribe();
        rx.changed().await.unwrap();

        handle.suspend().await;
        assert_eq!(handle.state(), LoopState::Suspended);
        let during = captures.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(captures.load(Ordering::SeqCst), during);

        handle.resume();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(captures.load(Ordering::SeqCst) > during);
        handle.stop().await;
    }
}
