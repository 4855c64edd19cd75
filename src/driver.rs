//! Detection → aggregator → encoder → transport.

use log::{info, trace};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
        mpsc::{Receiver, RecvTimeoutError},
    },
    time::{Duration, Instant},
};

use crate::command::CommandEncoder;
use crate::inference::Detection;
use crate::tracker::PoseAggregator;
use crate::transport::StreamTransport;
use crate::worker::{StopToken, Task};

const RECV_WAIT: Duration = Duration::from_millis(1);
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

pub struct DriverConfig {
    pub detections: Receiver<Detection>,
    pub tick: Duration,
}

pub struct CommandDriver {
    aggregator: Arc<PoseAggregator>,
    transport: Arc<StreamTransport>,
    encoded: AtomicU64,
}

impl CommandDriver {
    pub fn new(aggregator: Arc<PoseAggregator>, transport: Arc<StreamTransport>) -> Self {
        Self {
            aggregator,
            transport,
            encoded: AtomicU64::new(0),
        }
    }

    /// Commands accepted by the transport so far.
    pub fn encoded(&self) -> u64 {
        self.encoded.load(Ordering::Relaxed)
    }

    fn emit(&self, encoder: &mut CommandEncoder) {
        let Some(region) = self.aggregator.tracked_region() else {
            return;
        };
        let Some(frame) = self.aggregator.latest_movement() else {
            return;
        };
        let Some(line) = encoder.encode(&frame, region) else {
            return;
        };
        match self.transport.enqueue(line) {
            Ok(()) => {
                self.encoded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => trace!("driver: command dropped: {e}"),
        }
    }
}

impl Task for CommandDriver {
    type Config = DriverConfig;
    const NAME: &'static str = "driver";

    fn run(&self, cfg: DriverConfig, stop: &StopToken) -> anyhow::Result<()> {
        let mut encoder = CommandEncoder::new();
        let mut next_tick = Instant::now();
        while !stop.is_requested() {
            match cfg.detections.recv_timeout(RECV_WAIT) {
                Ok(det) => {
                    self.aggregator.ingest(det.pose);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("driver: detection source closed");
                    break;
                }
            }

            let now = Instant::now();
            if now >= next_tick {
                next_tick = now + cfg.tick;
                self.emit(&mut encoder);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypoint::{KeypointId, KeypointSample, PoseFrame, Position, TrackedRegion};
    use crate::relay::Frame;
    use crate::transport::TransportConfig;
    use crate::worker::ActiveWorker;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    fn detection(t: Instant) -> Detection {
        let mut pose = PoseFrame::empty(t);
        pose.set(KeypointId::Nose, KeypointSample::present(Position::new(120.0, 80.0, 0.0)));
        Detection {
            image: Arc::new(Frame {
                seq: 0,
                captured_at: t,
                width: 640,
                height: 480,
                data: Vec::new(),
            }),
            pose,
        }
    }

    #[test]
    fn steady_head_reaches_the_wire() {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = l.local_addr().unwrap().port();
        let transport = Arc::new(StreamTransport::new());
        transport.connect(&TransportConfig::new("127.0.0.1", port)).unwrap();
        let (peer, _) = l.accept().unwrap();

        let agg = Arc::new(PoseAggregator::new(3));
        agg.select_tracked_region(Some(TrackedRegion::Head));
        let (tx, rx) = mpsc::channel();
        let w = ActiveWorker::new(CommandDriver::new(Arc::clone(&agg), Arc::clone(&transport)));
        w.start(DriverConfig {
            detections: rx,
            tick: DEFAULT_TICK,
        })
        .unwrap();

        let t0 = Instant::now();
        for i in 0..5u64 {
            tx.send(detection(t0 + Duration::from_millis(33 * i))).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while transport.pending() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        transport.service(Duration::from_millis(1), &StopToken::new());

        peer.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let mut line = String::new();
        BufReader::new(peer).read_line(&mut line).unwrap();
        assert_eq!(line, "L00000I5 L14999I5\n");
        assert!(w.task().encoded() >= 1);
        w.shutdown();
    }

    #[test]
    fn nothing_is_sent_without_a_region() {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = l.local_addr().unwrap().port();
        let transport = Arc::new(StreamTransport::new());
        transport.connect(&TransportConfig::new("127.0.0.1", port)).unwrap();

        let agg = Arc::new(PoseAggregator::new(1));
        let (tx, rx) = mpsc::channel();
        let w = ActiveWorker::new(CommandDriver::new(Arc::clone(&agg), Arc::clone(&transport)));
        w.start(DriverConfig {
            detections: rx,
            tick: Duration::from_millis(1),
        })
        .unwrap();
        tx.send(detection(Instant::now())).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while agg.window_stats().raw == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(transport.pending(), 0);
        assert_eq!(w.task().encoded(), 0);
        w.shutdown();
    }

    #[test]
    fn disconnected_transport_drops_commands() {
        let transport = Arc::new(StreamTransport::new());
        let agg = Arc::new(PoseAggregator::new(1));
        agg.select_tracked_region(Some(TrackedRegion::Head));
        let (tx, rx) = mpsc::channel();
        let w = ActiveWorker::new(CommandDriver::new(Arc::clone(&agg), transport));
        w.start(DriverConfig {
            detections: rx,
            tick: Duration::from_millis(1),
        })
        .unwrap();
        tx.send(detection(Instant::now())).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(w.is_running());
        assert_eq!(w.task().encoded(), 0);

        drop(tx);
        let deadline = Instant::now() + Duration::from_secs(3);
        while w.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!w.is_running());
    }
}
