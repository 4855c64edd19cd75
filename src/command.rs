//! Movement snapshot → outbound protocol line.
//!
//! Line format: `L0<pppp>I5 L1<vvvv>I5`, where `pppp` is the position along
//! the region's min→max axis and `vvvv` the velocity, both in 0..=9999.

use std::time::Instant;

use crate::keypoint::TrackedRegion;
use crate::tracker::{MovementFrame, MovementSnapshot};

pub const AXIS_MAX: f32 = 9999.0;

#[derive(Debug, Default)]
pub struct CommandEncoder {
    last: Option<Instant>,
}

impl CommandEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `region` from `frame`, at most once per frame timestamp.
    pub fn encode(&mut self, frame: &MovementFrame, region: TrackedRegion) -> Option<String> {
        if self.last.is_some_and(|t| frame.timestamp <= t) {
            return None;
        }
        self.last = Some(frame.timestamp);

        let snap = frame.region(region);
        if !snap.is_present() {
            return None;
        }
        let d = displacement(snap)?;
        Some(format_command(position_value(d), velocity_value(snap.velocity)))
    }
}

/// Where `current` lies along min→max, 0.0 at `min` and 1.0 at `max`.
/// A collapsed axis (min == max) puts the region on its `max` end.
pub fn displacement(snap: &MovementSnapshot) -> Option<f32> {
    let axis = snap.max - snap.min;
    let len2 = axis.dot(&axis);
    let d = if len2 > 0.0 {
        (snap.current - snap.min).dot(&axis) / len2
    } else {
        1.0
    };
    d.is_finite().then(|| d.clamp(0.0, 1.0))
}

/// Image `y` grows downwards while the device axis grows upwards, so the
/// displacement is inverted.
pub fn position_value(displacement: f32) -> u16 {
    to_axis(1.0 - displacement.clamp(0.0, 1.0))
}

pub fn velocity_value(velocity: f32) -> u16 {
    let v = if velocity.is_finite() { velocity } else { 0.0 };
    to_axis(v.clamp(-1.0, 1.0) / 2.0 + 0.5)
}

fn to_axis(unit: f32) -> u16 {
    (unit * AXIS_MAX).clamp(0.0, AXIS_MAX) as u16
}

pub fn format_command(position: u16, velocity: u16) -> String {
    format!("L0{position:04}I5 L1{velocity:04}I5")
}
