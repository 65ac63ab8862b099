//! The frame pipeline: source → detection → congestion → signal → render →
//! hub, one cycle at a time on a dedicated producer thread.
//!
//! A cycle works on copies of the congestion window, the signal state and
//! the FPS meter, and commits them only once the frame has rendered and been
//! published. A cycle that fails part-way leaves no trace besides counters.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DetectorKind, SourceKind};
use crate::congestion::{CongestionReading, CongestionWindow};
use crate::detect::{
    DetectionAdapter, Detector, HttpDetector, NullDetector, RawDetection, StaticDetector,
};
use crate::error::SourceError;
use crate::frame::Frame;
use crate::hub::{FramePacket, Hub};
use crate::render::{Overlay, Renderer, pulse_intensity};
use crate::signal::{SignalController, SignalState};
use crate::snapshot::{SignalView, Snapshot, SnapshotParts};
use crate::source::{FfmpegOpener, FrameSource, PatternOpener, SourceEvent, VideoOpener};
use crate::stats::PipelineStats;

/// Cycles per second over the last `capacity` cycle instants.
#[derive(Debug, Clone)]
pub struct FpsMeter {
    stamps: VecDeque<Instant>,
    capacity: usize,
}

impl FpsMeter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            stamps: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn tick(&mut self, now: Instant) -> f64 {
        if self.stamps.len() == self.capacity {
            self.stamps.pop_front();
        }
        self.stamps.push_back(now);
        self.rate()
    }

    pub fn rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.stamps.front(), self.stamps.back()) else {
            return 0.0;
        };
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (self.stamps.len() - 1) as f64 / span
    }
}

const FPS_WINDOW: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The source could not be reopened this cycle.
    SourceUnavailable,
    RenderFailed,
    PublishFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Published {
        sequence: u64,
        frame_number: u64,
        loop_number: u64,
        vehicle_count: u32,
    },
    Skipped(SkipReason),
}

/// The stages a pipeline is assembled from.
pub struct PipelineParts {
    pub source: FrameSource,
    pub detector: DetectionAdapter,
    pub congestion: CongestionWindow,
    pub signal: SignalController,
    pub renderer: Renderer,
}

pub struct Pipeline {
    source: FrameSource,
    detector: DetectionAdapter,
    congestion: CongestionWindow,
    signal: SignalController,
    renderer: Renderer,
    fps: FpsMeter,
    hub: Hub,
    stats: Arc<PipelineStats>,
    epoch: Instant,
}

pub fn build_opener(config: &Config) -> Box<dyn VideoOpener> {
    let s = &config.source;
    match s.kind {
        SourceKind::Ffmpeg => Box::new(FfmpegOpener::new(
            s.video_path.clone(),
            s.frame_width,
            s.frame_height,
        )),
        SourceKind::Pattern => Box::new(PatternOpener::new(
            s.frame_width,
            s.frame_height,
            s.pattern_frames,
        )),
    }
}

/// Builds the configured detector. The http detector uses a blocking
/// client, so this must run off the async runtime.
pub fn build_detector(config: &Config) -> Result<Box<dyn Detector>> {
    let d = &config.detector;
    Ok(match d.kind {
        DetectorKind::Disabled => Box::new(NullDetector),
        DetectorKind::Static => Box::new(StaticDetector::new(
            d.detections.iter().map(RawDetection::from).collect(),
        )),
        DetectorKind::Http => {
            let endpoint = d
                .endpoint
                .clone()
                .ok_or_else(|| anyhow!("detector.endpoint is required for the http detector"))?;
            Box::new(
                HttpDetector::new(endpoint, config.detector_timeout())
                    .context("Failed to build http detector client")?,
            )
        }
    })
}

impl Pipeline {
    pub fn new(parts: PipelineParts, hub: Hub, stats: Arc<PipelineStats>, now: Instant) -> Self {
        Self {
            source: parts.source,
            detector: parts.detector,
            congestion: parts.congestion,
            signal: parts.signal,
            renderer: parts.renderer,
            fps: FpsMeter::new(FPS_WINDOW),
            hub,
            stats,
            epoch: now,
        }
    }

    /// Opens the source and builds every stage from `config`. Fails when the
    /// video cannot be opened or the detector cannot be built.
    #[tracing::instrument(skip_all, fields(source = ?config.source.kind, detector = ?config.detector.kind))]
    pub fn from_config(config: &Config, hub: Hub, stats: Arc<PipelineStats>) -> Result<Self> {
        let source = FrameSource::start(build_opener(config), config.source.restart_attempts)
            .map_err(|err| match err {
                SourceError::NotFound { ref path } => {
                    anyhow!("Video file {} does not exist", path.display())
                }
                other => anyhow::Error::new(other).context("Failed to open video source"),
            })?;
        let detector = DetectionAdapter::new(
            build_detector(config)?,
            config.detector.confidence_threshold,
        );
        let now = Instant::now();

        info!(
            detector = detector.detector_name(),
            width = config.source.frame_width,
            height = config.source.frame_height,
            "Pipeline ready"
        );

        Ok(Self::new(
            PipelineParts {
                source,
                detector,
                congestion: CongestionWindow::new(
                    config.congestion.window_size,
                    config.congestion.thresholds(),
                ),
                signal: SignalController::new(config.signal, now),
                renderer: Renderer::new(config.render.jpeg_quality, config.render.max_frame_bytes),
            },
            hub,
            stats,
            now,
        ))
    }

    /// Runs one cycle at `now`.
    pub fn cycle(&mut self, now: Instant) -> CycleOutcome {
        self.stats.record_cycle();

        let Some(frame) = self.next_frame() else {
            self.stats.record_skipped();
            return CycleOutcome::Skipped(SkipReason::SourceUnavailable);
        };

        let detections = self.detector.detect(&frame);
        self.stats.set_detection_errors(self.detector.error_count());
        let vehicle_count = detections.len() as u32;

        let mut congestion = self.congestion.clone();
        let reading = congestion.observe(vehicle_count, frame.captured_at);
        let signal = self.signal.preview(now, reading.tier);
        let mut fps = self.fps.clone();
        let rate = fps.tick(now);

        let overlay = self.overlay(&frame, vehicle_count, reading, &signal, rate, now);
        let jpeg = match self.renderer.render(&frame, &detections, &overlay) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                self.stats.record_render_error();
                self.stats.record_skipped();
                error!(sequence = frame.sequence, error = %err, "Render failed; cycle dropped");
                return CycleOutcome::Skipped(SkipReason::RenderFailed);
            }
        };

        let snapshot = Snapshot::build(SnapshotParts {
            timestamp: frame.captured_at,
            vehicle_count,
            reading,
            signal: &signal,
            now,
            frame_number: frame.frame_number,
            loop_number: frame.loop_number,
            fps: rate,
        });
        let packet = FramePacket {
            jpeg,
            sequence: frame.sequence,
            frame_number: frame.frame_number,
            loop_number: frame.loop_number,
            captured_at: frame.captured_at,
        };
        if let Err(err) = self.hub.publish(packet, snapshot) {
            self.stats.record_skipped();
            error!(sequence = frame.sequence, error = %err, "Snapshot serialization failed");
            return CycleOutcome::Skipped(SkipReason::PublishFailed);
        }

        self.congestion = congestion;
        self.fps = fps;
        if let Some(ended) = self.signal.commit(signal) {
            info!(
                from = %ended,
                to = %signal.phase,
                duration_secs = signal.phase_duration.as_secs(),
                tier = %signal.scheduled_tier,
                "Signal phase changed"
            );
        }
        self.stats.record_published();

        debug!(
            sequence = frame.sequence,
            vehicles = vehicle_count,
            average = reading.rolling_average,
            tier = %reading.tier,
            "Cycle complete"
        );

        CycleOutcome::Published {
            sequence: frame.sequence,
            frame_number: frame.frame_number,
            loop_number: frame.loop_number,
            vehicle_count,
        }
    }

    fn overlay(
        &self,
        frame: &Frame,
        vehicle_count: u32,
        reading: CongestionReading,
        signal: &SignalState,
        fps: f64,
        now: Instant,
    ) -> Overlay {
        Overlay {
            vehicle_count,
            rolling_average: reading.rolling_average,
            tier: reading.tier,
            signal: SignalView::at(signal, now),
            fps,
            frame_number: frame.frame_number,
            loop_number: frame.loop_number,
            pulse: pulse_intensity(now.saturating_duration_since(self.epoch).as_secs_f64()),
        }
    }

    /// Reads the next frame, restarting the source at end of loop or after a
    /// read error. `None` when the source stays unavailable this cycle.
    fn next_frame(&mut self) -> Option<Frame> {
        match self.source.next_frame() {
            Ok(SourceEvent::Frame(frame)) => return Some(frame),
            Ok(SourceEvent::EndOfLoop) => {
                debug!(loop_number = self.source.loop_number(), "End of loop");
            }
            Err(err) => {
                self.stats.record_source_error();
                warn!(error = %err, "Frame read failed; restarting source");
            }
        }

        if let Err(err) = self.source.restart() {
            self.stats.record_source_error();
            warn!(error = %err, "Source restart failed; retrying next cycle");
            return None;
        }
        self.stats.record_loop();

        match self.source.next_frame() {
            Ok(SourceEvent::Frame(frame)) => Some(frame),
            Ok(SourceEvent::EndOfLoop) => None,
            Err(err) => {
                self.stats.record_source_error();
                warn!(error = %err, "Frame read failed right after restart");
                None
            }
        }
    }

    /// Cycles at `period` until `stop` is cancelled. Late cycles are not
    /// made up.
    pub fn run(&mut self, period: Duration, stop: &CancellationToken) {
        info!(period_ms = period.as_secs_f64() * 1000.0, "Producer running");
        let mut deadline = Instant::now();
        while !stop.is_cancelled() {
            self.cycle(Instant::now());

            deadline += period;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            } else {
                deadline = now;
            }
        }
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        self.source.close();
        info!(
            loop_number = self.source.loop_number(),
            "Producer stopped"
        );
    }

    pub fn signal_state(&self) -> SignalState {
        self.signal.state()
    }

    pub fn congestion(&self) -> &CongestionWindow {
        &self.congestion
    }

    pub fn fps(&self) -> f64 {
        self.fps.rate()
    }
}

/// Handle to the running producer thread.
pub struct Producer {
    stop: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
}

impl Producer {
    /// Starts the producer thread and waits until its pipeline is built.
    /// Startup failures (missing video, unusable detector) are returned here.
    pub async fn spawn(config: Config, hub: Hub, stats: Arc<PipelineStats>) -> Result<Self> {
        let stop = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let period = config.cycle_period();
        let thread_stop = stop.clone();

        let thread = thread::Builder::new()
            .name("producer".into())
            .spawn(move || {
                let mut pipeline = match Pipeline::from_config(&config, hub, stats) {
                    Ok(pipeline) => {
                        let _ = ready_tx.send(Ok(()));
                        pipeline
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                pipeline.run(period, &thread_stop);
            })
            .context("Failed to spawn producer thread")?;

        let mut producer = Self {
            stop,
            thread: Some(thread),
        };
        match ready_rx.await {
            Ok(Ok(())) => Ok(producer),
            Ok(Err(err)) => {
                producer.join().await;
                Err(err)
            }
            Err(_) => {
                producer.join().await;
                Err(anyhow!("Producer thread exited during startup"))
            }
        }
    }

    /// Signals the producer to stop and waits for its current cycle to end.
    pub async fn stop(mut self) {
        self.stop.cancel();
        self.join().await;
    }

    async fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => error!("Producer thread panicked"),
                Err(err) => error!(error = %err, "Failed to join producer thread"),
            }
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::{CongestionTier, Thresholds};
    use crate::detect::BBox;
    use crate::hub::HubOptions;
    use crate::signal::{Phase, PhaseTimings};
    use crate::source::tests::scripted;

    fn parts(opener: Box<dyn VideoOpener>, detector: Box<dyn Detector>, now: Instant) -> PipelineParts {
        PipelineParts {
            source: FrameSource::start(opener, 2).unwrap(),
            detector: DetectionAdapter::new(detector, 0.3),
            congestion: CongestionWindow::new(30, Thresholds::default()),
            signal: SignalController::new(PhaseTimings::default(), now),
            renderer: Renderer::new(80, 2 * 1024 * 1024),
        }
    }

    fn pattern_pipeline(frames_per_loop: u64, detector: Box<dyn Detector>) -> (Pipeline, Hub, Instant) {
        let t0 = Instant::now();
        let hub = Hub::new(HubOptions::default());
        let opener = Box::new(PatternOpener::new(64, 48, frames_per_loop));
        let pipeline = Pipeline::new(
            parts(opener, detector, t0),
            hub.clone(),
            Arc::new(PipelineStats::default()),
            t0,
        );
        (pipeline, hub, t0)
    }

    fn cars(n: usize) -> Box<dyn Detector> {
        Box::new(StaticDetector::new(
            (0..n)
                .map(|i| RawDetection {
                    label: "car".into(),
                    confidence: 0.9,
                    bbox: BBox::new(i as f32 * 5.0, 5.0, 4.0, 4.0),
                })
                .collect(),
        ))
    }

    #[test]
    fn test_fps_meter() {
        let t0 = Instant::now();
        let mut meter = FpsMeter::new(30);
        assert_eq!(meter.tick(t0), 0.0);

        let mut rate = 0.0;
        for i in 1..10 {
            rate = meter.tick(t0 + Duration::from_millis(100 * i));
        }
        assert!((rate - 10.0).abs() < 1e-6, "{rate}");
    }

    #[test]
    fn test_cycle_publishes_frame_and_snapshot() {
        let (mut pipeline, hub, t0) = pattern_pipeline(10, cars(3));

        let outcome = pipeline.cycle(t0);
        assert_eq!(
            outcome,
            CycleOutcome::Published {
                sequence: 1,
                frame_number: 1,
                loop_number: 1,
                vehicle_count: 3,
            }
        );

        let frame = hub.latest_frame().unwrap();
        assert_eq!(&frame.jpeg[..2], &[0xFF, 0xD8]);
        let published = hub.latest_snapshot().unwrap();
        assert_eq!(published.snapshot.vehicle_count, 3);
        assert_eq!(published.snapshot.rolling_average, 3.0);
        assert_eq!(published.snapshot.signal.phase, Phase::Green);
    }

    #[test]
    fn test_end_of_loop_restarts_with_next_loop_number() {
        let (mut pipeline, hub, t0) = pattern_pipeline(2, Box::new(NullDetector));

        pipeline.cycle(t0);
        pipeline.cycle(t0 + Duration::from_millis(33));
        let outcome = pipeline.cycle(t0 + Duration::from_millis(66));

        assert_eq!(
            outcome,
            CycleOutcome::Published {
                sequence: 3,
                frame_number: 1,
                loop_number: 2,
                vehicle_count: 0,
            }
        );
        let snapshot = &hub.latest_snapshot().unwrap().snapshot;
        assert_eq!(snapshot.loop_number, 2);
        assert_eq!(snapshot.vehicle_count, 0);
    }

    #[test]
    fn test_render_failure_commits_nothing() {
        let t0 = Instant::now();
        let hub = Hub::new(HubOptions::default());
        let stats = Arc::new(PipelineStats::default());
        let mut p = parts(Box::new(PatternOpener::new(64, 48, 10)), cars(20), t0);
        p.renderer = Renderer::new(80, 64);
        let mut pipeline = Pipeline::new(p, hub.clone(), stats.clone(), t0);

        let outcome = pipeline.cycle(t0 + Duration::from_secs(31));

        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::RenderFailed));
        assert!(hub.latest_frame().is_none());
        assert!(hub.latest_snapshot().is_none());
        assert!(pipeline.congestion().is_empty());
        assert_eq!(pipeline.signal_state().phase, Phase::Green);
        assert_eq!(stats.snapshot().render_errors, 1);
    }

    #[test]
    fn test_failed_restart_skips_then_recovers() {
        let t0 = Instant::now();
        let hub = Hub::new(HubOptions::default());
        let stats = Arc::new(PipelineStats::default());
        let (opener, _) = scripted(vec![
            Ok(vec![Ok(true)]),
            Err(()),
            Err(()),
            Ok(vec![Ok(true)]),
        ]);
        let mut pipeline = Pipeline::new(
            parts(Box::new(opener), Box::new(NullDetector), t0),
            hub.clone(),
            stats.clone(),
            t0,
        );

        assert!(matches!(pipeline.cycle(t0), CycleOutcome::Published { .. }));
        assert_eq!(
            pipeline.cycle(t0),
            CycleOutcome::Skipped(SkipReason::SourceUnavailable)
        );
        assert!(matches!(
            pipeline.cycle(t0),
            CycleOutcome::Published { loop_number: 2, .. }
        ));

        let s = stats.snapshot();
        assert_eq!(s.loops, 1);
        assert_eq!(s.skipped_cycles, 1);
        assert_eq!(s.frames_published, 2);
    }

    #[test]
    fn test_signal_follows_injected_clock() {
        let (mut pipeline, hub, t0) = pattern_pipeline(1000, cars(20));

        pipeline.cycle(t0);
        pipeline.cycle(t0 + Duration::from_secs(29));
        assert_eq!(pipeline.signal_state().phase, Phase::Green);

        pipeline.cycle(t0 + Duration::from_secs(30));
        let state = pipeline.signal_state();
        assert_eq!(state.phase, Phase::Yellow);
        assert_eq!(state.scheduled_tier, CongestionTier::High);

        pipeline.cycle(t0 + Duration::from_secs(33));
        let snapshot = &hub.latest_snapshot().unwrap().snapshot;
        assert_eq!(snapshot.signal.phase, Phase::Red);
        assert_eq!(snapshot.signal.duration, 35.0);
        assert_eq!(snapshot.congestion_tier, CongestionTier::High);
    }
}
