use anyhow::Result;
use log::{info, warn};
use serde::Serialize;
use std::{sync::Arc, time::Instant};

use crate::capture::{CaptureConfig, CaptureStatus, CaptureWorker, ReplayOpener, SourceOpener};
use crate::config::Config;
use crate::display::{DisplayConfig, DisplayStatus, DisplayWorker};
use crate::driver::{CommandDriver, DEFAULT_TICK, DriverConfig};
use crate::inference::{InferenceWorker, PoseEstimator, RecordedEstimator};
use crate::keypoint::TrackedRegion;
use crate::relay::FrameRelay;
use crate::tracker::PoseAggregator;
use crate::transport::{LinkState, StreamTransport};
use crate::worker::ActiveWorker;

#[derive(Debug, Serialize)]
pub struct WindowCounts {
    pub raw: usize,
    pub smoothed: usize,
    pub movement: usize,
    pub raw_span_ms: u64,
    pub smoothed_span_ms: u64,
    pub movement_span_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct WorkerState {
    pub name: &'static str,
    pub running: bool,
}

#[derive(Debug, Serialize)]
pub struct PipelineStatus {
    pub link: LinkState,
    pub pending: usize,
    pub sent_lines: u64,
    pub commands: u64,
    pub capture: CaptureStatus,
    pub camera: u32,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub region: Option<TrackedRegion>,
    pub samples: usize,
    pub windows: WindowCounts,
    pub workers: Vec<WorkerState>,
    pub display: DisplayStatus,
}

/// All workers of one daemon. Fields drop in declaration order, which is
/// also the shutdown order: the transport goes last so queued commands flush.
pub struct Pipeline {
    driver: ActiveWorker<CommandDriver>,
    inference: ActiveWorker<InferenceWorker>,
    capture: ActiveWorker<CaptureWorker>,
    display: ActiveWorker<DisplayWorker>,
    transport: ActiveWorker<StreamTransport>,
    relay: Arc<FrameRelay>,
    aggregator: Arc<PoseAggregator>,
}

impl Pipeline {
    /// Replay recordings through the recorded-output estimator.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        if cfg.capture.recordings.is_empty() {
            warn!("pipeline: no recordings configured; capture has nothing to open");
        }
        let opener = ReplayOpener::new(cfg.capture.recordings.clone(), cfg.capture.fps);
        let estimator = RecordedEstimator::new(cfg.pose.input_size, cfg.pose.score_threshold);
        Self::start(cfg, Box::new(opener), Box::new(estimator))
    }

    pub fn start(
        cfg: &Config,
        opener: Box<dyn SourceOpener>,
        estimator: Box<dyn PoseEstimator>,
    ) -> Result<Self> {
        let relay = Arc::new(FrameRelay::new());
        let aggregator = Arc::new(PoseAggregator::new(cfg.pose.samples));
        aggregator.select_tracked_region(cfg.pose.region);
        let transport = ActiveWorker::new(StreamTransport::new());
        let driver = ActiveWorker::new(CommandDriver::new(
            Arc::clone(&aggregator),
            Arc::clone(transport.task()),
        ));

        let p = Self {
            driver,
            inference: ActiveWorker::new(InferenceWorker::new(Arc::clone(&relay))),
            capture: ActiveWorker::new(CaptureWorker::new(Arc::clone(&relay))),
            display: ActiveWorker::new(DisplayWorker::new()),
            transport,
            relay,
            aggregator,
        };

        // consumers before producers
        p.transport.start(cfg.remote.transport())?;
        p.driver.start(DriverConfig {
            detections: p.inference.task().subscribe(),
            tick: DEFAULT_TICK,
        })?;
        p.display.start(DisplayConfig {
            detections: p.inference.task().subscribe(),
            movement: p.aggregator.subscribe(),
            aggregator: Arc::clone(&p.aggregator),
        })?;
        p.inference.start(estimator)?;
        p.capture.start(CaptureConfig {
            device: cfg.capture.camera,
            autostart: cfg.capture.autostart,
            opener,
        })?;

        info!(
            "pipeline: started (k={}, region={})",
            cfg.pose.samples,
            cfg.pose.region.map_or("none", TrackedRegion::name)
        );
        Ok(p)
    }

    pub fn shutdown(&self) {
        self.driver.shutdown();
        self.inference.shutdown();
        self.capture.shutdown();
        self.display.shutdown();
        self.transport.shutdown();
        info!("pipeline: stopped");
    }

    pub fn select_region(&self, region: Option<TrackedRegion>) {
        self.aggregator.select_tracked_region(region);
        info!("pipeline: tracking {}", region.map_or("none", TrackedRegion::name));
    }

    pub fn region(&self) -> Option<TrackedRegion> {
        self.aggregator.tracked_region()
    }

    pub fn select_camera(&self, index: u32) {
        self.capture.task().select_device(index);
    }

    pub fn set_capture(&self, running: bool) {
        if running {
            self.capture.task().start_capture();
        } else {
            self.capture.task().stop_capture();
        }
    }

    pub fn status(&self) -> PipelineStatus {
        let transport = self.transport.task();
        let capture = self.capture.task();
        let w = self.aggregator.window_stats();
        let span_ms = |oldest: Option<Instant>| match (w.latest, oldest) {
            (Some(new), Some(old)) => new.saturating_duration_since(old).as_millis() as u64,
            _ => 0,
        };

        PipelineStatus {
            link: transport.state(),
            pending: transport.pending(),
            sent_lines: transport.sent_lines(),
            commands: self.driver.task().encoded(),
            capture: capture.status(),
            camera: capture.device(),
            frames_captured: self.relay.submitted(),
            frames_dropped: self.relay.dropped(),
            frames_processed: self.inference.task().processed(),
            region: self.aggregator.tracked_region(),
            samples: self.aggregator.samples(),
            windows: WindowCounts {
                raw: w.raw,
                smoothed: w.smoothed,
                movement: w.movement,
                raw_span_ms: span_ms(w.oldest_raw),
                smoothed_span_ms: span_ms(w.oldest_smoothed),
                movement_span_ms: span_ms(w.oldest_movement),
            },
            workers: vec![
                WorkerState {
                    name: "driver",
                    running: self.driver.is_running(),
                },
                WorkerState {
                    name: "inference",
                    running: self.inference.is_running(),
                },
                WorkerState {
                    name: "capture",
                    running: self.capture.is_running(),
                },
                WorkerState {
                    name: "display",
                    running: self.display.is_running(),
                },
                WorkerState {
                    name: "transport",
                    running: self.transport.is_running(),
                },
            ],
            display: self.display.task().status(),
        }
    }
}
