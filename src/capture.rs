//! Capture worker: pulls frames from the selected device into the relay.

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use crate::relay::{Frame, FrameRelay};
use crate::worker::{StopToken, Task, lock};

const IDLE_BACKOFF: Duration = Duration::from_millis(100);
const FRAME_POLL: Duration = Duration::from_millis(1);

pub trait FrameSource: Send {
    /// Next frame, or `None` if none is ready yet. Must not block for long:
    /// the caller polls again after a short wait.
    fn read(&mut self) -> Result<Option<Frame>>;
}

pub trait SourceOpener: Send {
    fn open(&mut self, device: u32) -> Result<Box<dyn FrameSource>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Stopped,
    Running,
    Error,
}

impl CaptureStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CaptureStatus::Running,
            2 => CaptureStatus::Error,
            _ => CaptureStatus::Stopped,
        }
    }
}

pub struct CaptureConfig {
    pub device: u32,
    pub autostart: bool,
    pub opener: Box<dyn SourceOpener>,
}

pub struct CaptureWorker {
    relay: Arc<FrameRelay>,
    status: AtomicU8,
    device: AtomicU32,
    requested: Mutex<Option<u32>>,
}

impl CaptureWorker {
    pub fn new(relay: Arc<FrameRelay>) -> Self {
        Self {
            relay,
            status: AtomicU8::new(CaptureStatus::Stopped as u8),
            device: AtomicU32::new(0),
            requested: Mutex::new(None),
        }
    }

    pub fn status(&self) -> CaptureStatus {
        CaptureStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, s: CaptureStatus) {
        self.status.store(s as u8, Ordering::SeqCst);
    }

    pub fn start_capture(&self) {
        self.set_status(CaptureStatus::Running);
    }

    pub fn stop_capture(&self) {
        self.set_status(CaptureStatus::Stopped);
    }

    /// Switch devices; applied on the next loop iteration while running.
    pub fn select_device(&self, device: u32) {
        *lock(&self.requested) = Some(device);
    }

    pub fn device(&self) -> u32 {
        self.device.load(Ordering::SeqCst)
    }

    fn open(&self, opener: &mut dyn SourceOpener, device: u32) -> Option<Box<dyn FrameSource>> {
        match opener.open(device) {
            Ok(src) => {
                self.device.store(device, Ordering::SeqCst);
                info!("capture: opened device {device}");
                Some(src)
            }
            Err(e) => {
                warn!("capture: cannot open device {device}: {e:#}");
                self.set_status(CaptureStatus::Error);
                None
            }
        }
    }
}

impl Task for CaptureWorker {
    type Config = CaptureConfig;
    const NAME: &'static str = "capture";

    fn run(&self, cfg: CaptureConfig, stop: &StopToken) -> Result<()> {
        let mut opener = cfg.opener;
        self.device.store(cfg.device, Ordering::SeqCst);
        if cfg.autostart {
            self.start_capture();
        }

        let mut source: Option<Box<dyn FrameSource>> = None;
        let mut seq = 0u64;
        while !stop.is_requested() {
            let mut wait = Some(IDLE_BACKOFF);

            if self.status() == CaptureStatus::Running {
                let switch = lock(&self.requested).take();
                if let Some(dev) = switch {
                    if dev != self.device() || source.is_none() {
                        source = self.open(opener.as_mut(), dev);
                    }
                }
                if source.is_none() && self.status() == CaptureStatus::Running {
                    source = self.open(opener.as_mut(), self.device());
                }

                if let Some(src) = source.as_mut() {
                    match src.read() {
                        Ok(Some(mut frame)) => {
                            seq += 1;
                            frame.seq = seq;
                            self.relay.submit(frame);
                            wait = None;
                        }
                        Ok(None) => wait = Some(FRAME_POLL),
                        Err(e) => {
                            warn!("capture: read failed: {e:#}");
                            source = None;
                        }
                    }
                }
            } else if source.take().is_some() {
                info!("capture: device {} released", self.device());
            }

            if let Some(d) = wait {
                if stop.sleep(d) {
                    break;
                }
            }
        }
        Ok(())
    }
}

/// One recorded inference input: the source image size plus the raw MoveNet
/// output tensor that was produced for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedFrame {
    pub width: u32,
    pub height: u32,
    pub output: Vec<f32>,
}

/// Plays a JSON-lines recording back at a fixed rate, looping at the end.
pub struct ReplaySource {
    frames: Vec<RecordedFrame>,
    cursor: usize,
    interval: Duration,
    next_due: Instant,
}

impl ReplaySource {
    pub fn load(path: &Path, fps: u32) -> Result<Self> {
        let txt = fs::read_to_string(path)
            .with_context(|| format!("failed to read recording {}", path.display()))?;
        let mut frames = Vec::new();
        for (n, line) in txt.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let f: RecordedFrame = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: bad frame", path.display(), n + 1))?;
            frames.push(f);
        }
        if frames.is_empty() {
            return Err(anyhow!("recording {} has no frames", path.display()));
        }
        debug!("replay: {} frames from {}", frames.len(), path.display());
        Ok(Self::new(frames, fps))
    }

    pub fn new(frames: Vec<RecordedFrame>, fps: u32) -> Self {
        Self {
            frames,
            cursor: 0,
            interval: Duration::from_secs(1) / fps.max(1),
            next_due: Instant::now(),
        }
    }
}

impl FrameSource for ReplaySource {
    fn read(&mut self) -> Result<Option<Frame>> {
        let Some(rec) = self.frames.get(self.cursor) else {
            return Ok(None);
        };
        let now = Instant::now();
        if self.next_due > now {
            return Ok(None);
        }
        // a late frame resets the cadence instead of bursting to catch up
        self.next_due += self.interval;
        if self.next_due < now {
            self.next_due = now;
        }
        self.cursor = (self.cursor + 1) % self.frames.len();

        Ok(Some(Frame {
            seq: 0,
            captured_at: Instant::now(),
            width: rec.width,
            height: rec.height,
            data: serde_json::to_vec(&rec.output)?,
        }))
    }
}

/// Device index `n` selects the `n`-th configured recording.
pub struct ReplayOpener {
    recordings: Vec<PathBuf>,
    fps: u32,
}

impl ReplayOpener {
    pub fn new(recordings: Vec<PathBuf>, fps: u32) -> Self {
        Self { recordings, fps }
    }
}

impl SourceOpener for ReplayOpener {
    fn open(&mut self, device: u32) -> Result<Box<dyn FrameSource>> {
        let path = self
            .recordings
            .get(device as usize)
            .ok_or_else(|| anyhow!("no recording configured for camera {device}"))?;
        Ok(Box::new(ReplaySource::load(path, self.fps)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ActiveWorker;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    struct Counting {
        device: u32,
        open: Arc<AtomicBool>,
    }

    impl FrameSource for Counting {
        fn read(&mut self) -> Result<Option<Frame>> {
            thread::sleep(Duration::from_millis(2));
            Ok(Some(Frame {
                seq: 0,
                captured_at: Instant::now(),
                width: self.device,
                height: 1,
                data: Vec::new(),
            }))
        }
    }

    impl Drop for Counting {
        fn drop(&mut self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    struct Opener {
        devices: u32,
        open: Arc<AtomicBool>,
    }

    impl SourceOpener for Opener {
        fn open(&mut self, device: u32) -> Result<Box<dyn FrameSource>> {
            if device >= self.devices {
                return Err(anyhow!("no such device"));
            }
            self.open.store(true, Ordering::SeqCst);
            Ok(Box::new(Counting {
                device,
                open: Arc::clone(&self.open),
            }))
        }
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn worker(autostart: bool) -> (ActiveWorker<CaptureWorker>, Arc<FrameRelay>, Arc<AtomicBool>) {
        let relay = Arc::new(FrameRelay::new());
        let open = Arc::new(AtomicBool::new(false));
        let w = ActiveWorker::new(CaptureWorker::new(Arc::clone(&relay)));
        w.start(CaptureConfig {
            device: 0,
            autostart,
            opener: Box::new(Opener {
                devices: 2,
                open: Arc::clone(&open),
            }),
        })
        .unwrap();
        (w, relay, open)
    }

    #[test]
    fn frames_flow_while_running() {
        let (w, relay, open) = worker(true);
        assert!(wait_until(|| relay.submitted() > 3));
        assert!(open.load(Ordering::SeqCst));
        assert_eq!(w.task().status(), CaptureStatus::Running);

        w.task().stop_capture();
        assert!(wait_until(|| !open.load(Ordering::SeqCst)));
        let n = relay.submitted();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(relay.submitted(), n);
        w.shutdown();
    }

    #[test]
    fn idle_until_started() {
        let (w, relay, _open) = worker(false);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(relay.submitted(), 0);
        w.task().start_capture();
        assert!(wait_until(|| relay.submitted() > 0));
        w.shutdown();
    }

    #[test]
    fn switching_device() {
        let (w, relay, _open) = worker(true);
        w.task().select_device(1);
        assert!(wait_until(|| w.task().device() == 1));
        assert!(wait_until(|| relay.take().is_some_and(|f| f.width == 1)));

        w.task().select_device(7);
        assert!(wait_until(|| w.task().status() == CaptureStatus::Error));
        assert_eq!(w.task().device(), 1);
        w.shutdown();
    }

    #[test]
    fn replay_loops_over_recording() {
        let path = std::env::temp_dir().join(format!("posectl-replay-{}.jsonl", std::process::id()));
        let rec = RecordedFrame {
            width: 640,
            height: 480,
            output: vec![0.5; 51],
        };
        let line = serde_json::to_string(&rec).unwrap();
        fs::write(&path, format!("{line}\n\n{line}\n")).unwrap();

        let mut opener = ReplayOpener::new(vec![path.clone()], 1000);
        let mut src = opener.open(0).unwrap();
        for _ in 0..3 {
            let mut next = None;
            assert!(wait_until(|| {
                next = src.read().unwrap();
                next.is_some()
            }));
            let f = next.unwrap();
            assert_eq!((f.width, f.height), (640, 480));
            let out: Vec<f32> = serde_json::from_slice(&f.data).unwrap();
            assert_eq!(out.len(), 51);
        }
        assert!(opener.open(1).is_err());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn replay_does_not_block_between_frames() {
        let mut src = ReplaySource::new(
            vec![RecordedFrame {
                width: 1,
                height: 1,
                output: Vec::new(),
            }],
            1,
        );
        assert!(src.read().unwrap().is_some());
        let t = Instant::now();
        assert!(src.read().unwrap().is_none());
        assert!(t.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn slow_replay_stops_promptly() {
        let path = std::env::temp_dir().join(format!("posectl-slow-{}.jsonl", std::process::id()));
        let rec = RecordedFrame {
            width: 640,
            height: 480,
            output: vec![0.5; 51],
        };
        fs::write(&path, serde_json::to_string(&rec).unwrap() + "\n").unwrap();

        let relay = Arc::new(FrameRelay::new());
        let w = ActiveWorker::new(CaptureWorker::new(Arc::clone(&relay)));
        w.start(CaptureConfig {
            device: 0,
            autostart: true,
            opener: Box::new(ReplayOpener::new(vec![path.clone()], 1)),
        })
        .unwrap();
        assert!(wait_until(|| relay.submitted() > 0));

        let t = Instant::now();
        w.shutdown();
        assert!(t.elapsed() < Duration::from_millis(100), "took {:?}", t.elapsed());
        assert!(!w.is_running());
        let _ = fs::remove_file(path);
    }
}
