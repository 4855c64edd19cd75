//! Pose estimation stage: relay frame → `PoseFrame` → detection subscribers.

use log::{debug, trace};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::fanout::Fanout;
use crate::keypoint::{KEYPOINT_COUNT, KeypointId, KeypointSample, PoseFrame, Position};
use crate::relay::{Frame, FrameRelay};
use crate::worker::{StopToken, Task};

/// y, x, score per keypoint.
pub const MOVENET_OUTPUT_LEN: usize = KEYPOINT_COUNT * 3;

const IDLE_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Error, PartialEq)]
pub enum PoseError {
    #[error("model output has {got} values, expected {expected}")]
    ShapeMismatch { expected: usize, got: usize },
    #[error("malformed frame payload: {0}")]
    Malformed(String),
}

/// Square centre crop of the source image that was scaled to the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropGeometry {
    pub input_size: u32,
    /// Source pixels per model pixel.
    pub scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

impl CropGeometry {
    pub fn for_frame(width: u32, height: u32, input_size: u32) -> Self {
        let size = input_size.max(1);
        let short = width.min(height) as f32;
        Self {
            input_size: size,
            scale: short / size as f32,
            offset_x: (width as f32 - short) / 2.0,
            offset_y: (height as f32 - short) / 2.0,
        }
    }

    /// Normalised model coordinates → source image pixels.
    pub fn to_source(&self, x_norm: f32, y_norm: f32) -> Position {
        let span = self.input_size as f32 * self.scale;
        Position::new(x_norm * span + self.offset_x, y_norm * span + self.offset_y, 0.0)
    }
}

/// Decode a single-pose MoveNet output tensor.
pub fn decode_movenet(
    output: &[f32],
    crop: &CropGeometry,
    threshold: f32,
    timestamp: Instant,
) -> Result<PoseFrame, PoseError> {
    if output.len() != MOVENET_OUTPUT_LEN {
        return Err(PoseError::ShapeMismatch {
            expected: MOVENET_OUTPUT_LEN,
            got: output.len(),
        });
    }
    let mut pose = PoseFrame::empty(timestamp);
    for (id, chunk) in KeypointId::ALL.iter().zip(output.chunks_exact(3)) {
        let (y, x, score) = (chunk[0], chunk[1], chunk[2]);
        let sample = if score > threshold {
            KeypointSample::present(crop.to_source(x, y))
        } else {
            KeypointSample::absent()
        };
        pose.set(*id, sample);
    }
    Ok(pose)
}

pub trait PoseEstimator: Send {
    fn estimate(&mut self, frame: &Frame) -> Result<PoseFrame, PoseError>;
}

/// Replays model outputs stored in the frame payload as a JSON array.
#[derive(Debug, Clone)]
pub struct RecordedEstimator {
    input_size: u32,
    threshold: f32,
}

impl RecordedEstimator {
    pub fn new(input_size: u32, threshold: f32) -> Self {
        Self {
            input_size,
            threshold,
        }
    }
}

impl PoseEstimator for RecordedEstimator {
    fn estimate(&mut self, frame: &Frame) -> Result<PoseFrame, PoseError> {
        let output: Vec<f32> =
            serde_json::from_slice(&frame.data).map_err(|e| PoseError::Malformed(e.to_string()))?;
        let crop = CropGeometry::for_frame(frame.width, frame.height, self.input_size);
        decode_movenet(&output, &crop, self.threshold, frame.captured_at)
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub image: Arc<Frame>,
    pub pose: PoseFrame,
}

pub struct InferenceWorker {
    relay: Arc<FrameRelay>,
    detections: Fanout<Detection>,
    processed: AtomicU64,
}

impl InferenceWorker {
    pub fn new(relay: Arc<FrameRelay>) -> Self {
        Self {
            relay,
            detections: Fanout::new(),
            processed: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<Detection> {
        self.detections.subscribe()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl Task for InferenceWorker {
    type Config = Box<dyn PoseEstimator>;
    const NAME: &'static str = "inference";

    fn run(&self, mut estimator: Box<dyn PoseEstimator>, stop: &StopToken) -> anyhow::Result<()> {
        while !stop.is_requested() {
            let Some(frame) = self.relay.take() else {
                if stop.sleep(IDLE_WAIT) {
                    break;
                }
                continue;
            };
            match estimator.estimate(&frame) {
                Ok(pose) => {
                    trace!("inference: frame {} decoded", frame.seq);
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    self.detections.publish(&Detection {
                        image: Arc::new(frame),
                        pose,
                    });
                }
                // the model does not fit this pipeline; no later frame will either
                Err(e @ PoseError::ShapeMismatch { .. }) => return Err(e.into()),
                Err(e) => debug!("inference: frame {} skipped: {e}", frame.seq),
            }
        }
        Ok(())
    }
}
