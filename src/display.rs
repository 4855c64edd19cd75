//! Headless display: keeps the newest detection and movement frame and
//! reports them through the log and the control socket.

use log::info;
use serde::Serialize;
use std::{
    sync::{
        Arc, Mutex,
        mpsc::{Receiver, TryRecvError},
    },
    time::{Duration, Instant},
};

use crate::inference::Detection;
use crate::keypoint::TrackedRegion;
use crate::tracker::{MovementFrame, MovementSnapshot, PoseAggregator};
use crate::worker::{StopToken, Task, lock};

const REFRESH: Duration = Duration::from_millis(10);
const SUMMARY_EVERY: Duration = Duration::from_secs(1);

pub struct DisplayConfig {
    pub detections: Receiver<Detection>,
    pub movement: Receiver<MovementFrame>,
    pub aggregator: Arc<PoseAggregator>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DisplayStatus {
    pub detections: u64,
    pub movement_frames: u64,
    pub last_frame: Option<u64>,
    pub image_size: Option<(u32, u32)>,
    pub visible_keypoints: usize,
    pub region: Option<TrackedRegion>,
    pub snapshot: Option<MovementSnapshot>,
}

#[derive(Debug, Default)]
pub struct DisplayWorker {
    state: Mutex<DisplayStatus>,
}

impl DisplayWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> DisplayStatus {
        lock(&self.state).clone()
    }

    fn show_detection(&self, det: &Detection) {
        let mut s = lock(&self.state);
        s.detections += 1;
        s.last_frame = Some(det.image.seq);
        s.image_size = Some((det.image.width, det.image.height));
        s.visible_keypoints = det.pose.keypoints.iter().filter(|k| k.is_present()).count();
    }

    fn show_movement(&self, frame: &MovementFrame, region: Option<TrackedRegion>) {
        let mut s = lock(&self.state);
        s.movement_frames += 1;
        s.region = region;
        s.snapshot = region.map(|r| *frame.region(r));
    }
}

fn drain<T>(rx: &Receiver<T>, mut f: impl FnMut(T)) -> bool {
    loop {
        match rx.try_recv() {
            Ok(v) => f(v),
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}

impl Task for DisplayWorker {
    type Config = DisplayConfig;
    const NAME: &'static str = "display";

    fn run(&self, cfg: DisplayConfig, stop: &StopToken) -> anyhow::Result<()> {
        let mut next_summary = Instant::now() + SUMMARY_EVERY;
        while !stop.is_requested() {
            let dets_open = drain(&cfg.detections, |d| self.show_detection(&d));
            let region = cfg.aggregator.tracked_region();
            let moves_open = drain(&cfg.movement, |m| self.show_movement(&m, region));
            if !dets_open && !moves_open {
                info!("display: all producers gone");
                break;
            }

            if Instant::now() >= next_summary {
                next_summary += SUMMARY_EVERY;
                let s = self.status();
                match (s.region, s.snapshot) {
                    (Some(r), Some(snap)) if snap.is_present() => info!(
                        "display: {r} at ({:.0}, {:.0}) velocity {:+.2}; {} detections",
                        snap.current.x, snap.current.y, snap.velocity, s.detections
                    ),
                    (Some(r), _) => info!("display: {r} not visible; {} detections", s.detections),
                    (None, _) => info!("display: no region tracked; {} detections", s.detections),
                }
            }

            if stop.sleep(REFRESH) {
                break;
            }
        }
        Ok(())
    }
}
