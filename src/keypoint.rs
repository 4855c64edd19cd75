//! Keypoint schema: positions, per-frame samples and the tracked body regions.

use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt,
    ops::{Add, AddAssign, Div, DivAssign, Sub},
    str::FromStr,
    time::Instant,
};

pub const KEYPOINT_COUNT: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeypointId {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl KeypointId {
    /// Model output order.
    pub const ALL: [KeypointId; KEYPOINT_COUNT] = [
        KeypointId::Nose,
        KeypointId::LeftEye,
        KeypointId::RightEye,
        KeypointId::LeftEar,
        KeypointId::RightEar,
        KeypointId::LeftShoulder,
        KeypointId::RightShoulder,
        KeypointId::LeftElbow,
        KeypointId::RightElbow,
        KeypointId::LeftWrist,
        KeypointId::RightWrist,
        KeypointId::LeftHip,
        KeypointId::RightHip,
        KeypointId::LeftKnee,
        KeypointId::RightKnee,
        KeypointId::LeftAnkle,
        KeypointId::RightAnkle,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    #[default]
    Unknown,
    Present,
    Absent,
}

/// Scene coordinates. `y` grows downwards, as in image space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance2(&self, other: &Self) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    pub fn distance(&self, other: &Self) -> f32 {
        self.distance2(other).sqrt()
    }

    pub fn dot(&self, other: &Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Strict ordering used to tell the two sides of a movement apart:
    /// vertical first, then horizontal, then depth.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        let by = |a: f32, b: f32| a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        by(self.y, other.y)
            .then_with(|| by(self.x, other.x))
            .then_with(|| by(self.z, other.z))
    }
}

impl Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Position {
    fn add_assign(&mut self, rhs: Position) {
        *self = *self + rhs;
    }
}

impl Sub for Position {
    type Output = Position;

    fn sub(self, rhs: Position) -> Position {
        Position::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

/// Dividing by zero leaves the position unchanged.
impl Div<f32> for Position {
    type Output = Position;

    fn div(self, rhs: f32) -> Position {
        if rhs == 0.0 {
            return self;
        }
        Position::new(self.x / rhs, self.y / rhs, self.z / rhs)
    }
}

impl DivAssign<f32> for Position {
    fn div_assign(&mut self, rhs: f32) {
        *self = *self / rhs;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KeypointSample {
    pub presence: Presence,
    pub position: Position,
}

impl KeypointSample {
    pub fn present(position: Position) -> Self {
        Self {
            presence: Presence::Present,
            position,
        }
    }

    pub fn absent() -> Self {
        Self {
            presence: Presence::Absent,
            position: Position::default(),
        }
    }

    pub fn is_present(&self) -> bool {
        self.presence == Presence::Present
    }
}

/// Mean of the present samples; absent when none are present.
pub fn average_present<'a, I>(samples: I) -> KeypointSample
where
    I: IntoIterator<Item = &'a KeypointSample>,
{
    let mut sum = Position::default();
    let mut count = 0usize;
    for s in samples.into_iter().filter(|s| s.is_present()) {
        sum += s.position;
        count += 1;
    }
    if count == 0 {
        return KeypointSample::absent();
    }
    KeypointSample::present(sum / count as f32)
}

/// One inference result. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseFrame {
    pub keypoints: [KeypointSample; KEYPOINT_COUNT],
    pub timestamp: Instant,
}

impl PoseFrame {
    pub fn empty(timestamp: Instant) -> Self {
        Self {
            keypoints: [KeypointSample::default(); KEYPOINT_COUNT],
            timestamp,
        }
    }

    pub fn keypoint(&self, id: KeypointId) -> &KeypointSample {
        &self.keypoints[id.index()]
    }

    pub fn set(&mut self, id: KeypointId, sample: KeypointSample) {
        self.keypoints[id.index()] = sample;
    }

    /// Region position: mean of its keypoints, absent if any of them is absent.
    pub fn region(&self, region: TrackedRegion) -> KeypointSample {
        let ids = region.keypoints();
        let mut sum = Position::default();
        let mut count = 0usize;
        let mut presence = Presence::Present;
        for id in ids {
            let kp = self.keypoint(*id);
            if kp.is_present() {
                sum += kp.position;
                count += 1;
            } else {
                presence = Presence::Absent;
            }
        }
        KeypointSample {
            presence,
            position: sum / count as f32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackedRegion {
    Head,
    Hips,
    LeftHand,
    RightHand,
    LeftFoot,
    RightFoot,
}

pub const REGION_COUNT: usize = 6;

impl TrackedRegion {
    pub const ALL: [TrackedRegion; REGION_COUNT] = [
        TrackedRegion::Head,
        TrackedRegion::Hips,
        TrackedRegion::LeftHand,
        TrackedRegion::RightHand,
        TrackedRegion::LeftFoot,
        TrackedRegion::RightFoot,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn keypoints(self) -> &'static [KeypointId] {
        use KeypointId::*;
        match self {
            TrackedRegion::Head => &[Nose],
            TrackedRegion::Hips => &[LeftHip, RightHip],
            TrackedRegion::LeftHand => &[LeftWrist],
            TrackedRegion::RightHand => &[RightWrist],
            TrackedRegion::LeftFoot => &[LeftAnkle],
            TrackedRegion::RightFoot => &[RightAnkle],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TrackedRegion::Head => "head",
            TrackedRegion::Hips => "hips",
            TrackedRegion::LeftHand => "left-hand",
            TrackedRegion::RightHand => "right-hand",
            TrackedRegion::LeftFoot => "left-foot",
            TrackedRegion::RightFoot => "right-foot",
        }
    }
}

impl fmt::Display for TrackedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TrackedRegion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        TrackedRegion::ALL
            .into_iter()
            .find(|r| r.name() == norm)
            .ok_or_else(|| format!("unknown region '{s}'"))
    }
}
