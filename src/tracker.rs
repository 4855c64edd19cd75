//! Windowed pose aggregation: raw detections are smoothed over the last `k`
//! samples, then each tracked region is summarised over a 30 s window into
//! center / extent / current position / velocity.

use log::trace;
use serde::Serialize;
use std::{
    cmp::Ordering,
    collections::VecDeque,
    sync::{Mutex, mpsc::Receiver},
    time::{Duration, Instant},
};

use crate::fanout::Fanout;
use crate::keypoint::{
    KEYPOINT_COUNT, KeypointSample, PoseFrame, Position, Presence, REGION_COUNT, TrackedRegion,
    average_present,
};
use crate::worker::lock;

/// Every window is pruned to this age relative to the newest sample.
pub const HISTORY_WINDOW: Duration = Duration::from_secs(60);
/// Span of smoothed samples that movement statistics are computed over.
pub const MOVEMENT_WINDOW: Duration = Duration::from_secs(30);
/// Crossing the whole min..max extent in this many ms is velocity 1.0.
pub const FULL_TRAVERSAL_MS: f32 = 100.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MovementSnapshot {
    pub presence: Presence,
    pub center: Position,
    pub min: Position,
    pub max: Position,
    pub current: Position,
    pub velocity: f32,
}

impl MovementSnapshot {
    pub fn is_present(&self) -> bool {
        self.presence == Presence::Present
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementFrame {
    pub regions: [MovementSnapshot; REGION_COUNT],
    pub timestamp: Instant,
}

impl MovementFrame {
    pub fn region(&self, region: TrackedRegion) -> &MovementSnapshot {
        &self.regions[region.index()]
    }
}

#[derive(Debug, Clone, Default)]
pub struct WindowStats {
    pub raw: usize,
    pub smoothed: usize,
    pub movement: usize,
    pub latest: Option<Instant>,
    pub oldest_raw: Option<Instant>,
    pub oldest_smoothed: Option<Instant>,
    pub oldest_movement: Option<Instant>,
}

#[derive(Debug, Default)]
struct Windows {
    raw: VecDeque<PoseFrame>,
    smoothed: VecDeque<PoseFrame>,
    movement: VecDeque<MovementFrame>,
}

/// Owns the three sliding windows behind one lock; `ingest` expects a single
/// producer feeding frames in capture order.
#[derive(Debug)]
pub struct PoseAggregator {
    samples: usize,
    windows: Mutex<Windows>,
    region: Mutex<Option<TrackedRegion>>,
    movement_out: Fanout<MovementFrame>,
}

impl PoseAggregator {
    pub fn new(samples: usize) -> Self {
        Self {
            samples: samples.max(1),
            windows: Mutex::new(Windows::default()),
            region: Mutex::new(None),
            movement_out: Fanout::new(),
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Receive every movement frame built from here on.
    pub fn subscribe(&self) -> Receiver<MovementFrame> {
        self.movement_out.subscribe()
    }

    pub fn ingest(&self, frame: PoseFrame) -> MovementFrame {
        let now = frame.timestamp;
        let cutoff = now.checked_sub(HISTORY_WINDOW);
        let mut w = lock(&self.windows);

        w.raw.push_back(frame);
        prune(&mut w.raw, cutoff, |f| f.timestamp);

        let smoothed = smooth(&w.raw, self.samples, now);
        w.smoothed.push_back(smoothed);
        prune(&mut w.smoothed, cutoff, |f| f.timestamp);

        let prior = w.movement.back().map(|m| m.regions).unwrap_or_default();
        let since = now.checked_sub(MOVEMENT_WINDOW);
        let mut regions = [MovementSnapshot::default(); REGION_COUNT];
        for region in TrackedRegion::ALL {
            let i = region.index();
            regions[i] = summarize(&w.smoothed, region, since, &prior[i]);
        }

        let movement = MovementFrame {
            regions,
            timestamp: now,
        };
        w.movement.push_back(movement);
        prune(&mut w.movement, cutoff, |m| m.timestamp);

        trace!(
            "ingest: raw={} smoothed={} movement={}",
            w.raw.len(),
            w.smoothed.len(),
            w.movement.len()
        );
        self.movement_out.publish(&movement);
        movement
    }

    /// Takes effect from the next encoded frame; nothing is recomputed.
    pub fn select_tracked_region(&self, region: Option<TrackedRegion>) {
        *lock(&self.region) = region;
    }

    pub fn tracked_region(&self) -> Option<TrackedRegion> {
        *lock(&self.region)
    }

    pub fn latest_movement(&self) -> Option<MovementFrame> {
        lock(&self.windows).movement.back().copied()
    }

    #[cfg(test)]
    pub fn latest_smoothed(&self) -> Option<PoseFrame> {
        lock(&self.windows).smoothed.back().copied()
    }

    pub fn window_stats(&self) -> WindowStats {
        let w = lock(&self.windows);
        WindowStats {
            raw: w.raw.len(),
            smoothed: w.smoothed.len(),
            movement: w.movement.len(),
            latest: w.raw.back().map(|f| f.timestamp),
            oldest_raw: w.raw.front().map(|f| f.timestamp),
            oldest_smoothed: w.smoothed.front().map(|f| f.timestamp),
            oldest_movement: w.movement.front().map(|m| m.timestamp),
        }
    }
}

fn prune<T>(window: &mut VecDeque<T>, cutoff: Option<Instant>, ts: impl Fn(&T) -> Instant) {
    let Some(cutoff) = cutoff else { return };
    while window.front().is_some_and(|e| ts(e) < cutoff) {
        window.pop_front();
    }
}

/// Per-keypoint mean over the newest `k` raw frames, regardless of their age.
fn smooth(raw: &VecDeque<PoseFrame>, k: usize, timestamp: Instant) -> PoseFrame {
    let mut out = PoseFrame::empty(timestamp);
    for i in 0..KEYPOINT_COUNT {
        out.keypoints[i] = average_present(raw.iter().rev().take(k).map(|f| &f.keypoints[i]));
    }
    out
}

fn summarize(
    smoothed: &VecDeque<PoseFrame>,
    region: TrackedRegion,
    since: Option<Instant>,
    prior: &MovementSnapshot,
) -> MovementSnapshot {
    // newest first
    let points: Vec<(KeypointSample, Instant)> = smoothed
        .iter()
        .rev()
        .take_while(|f| since.is_none_or(|s| f.timestamp > s))
        .map(|f| {
            let mut p = f.region(region);
            if !p.position.is_finite() {
                p = KeypointSample::absent();
            }
            (p, f.timestamp)
        })
        .collect();

    let center = average_present(points.iter().map(|(p, _)| p));
    if !center.is_present() {
        return MovementSnapshot {
            presence: Presence::Absent,
            ..*prior
        };
    }
    let center = center.position;

    let mut snap = MovementSnapshot {
        presence: Presence::Absent,
        center,
        min: center,
        max: center,
        current: prior.current,
        velocity: prior.velocity,
    };
    if let Some((newest, _)) = points.first() {
        snap.presence = newest.presence;
        if newest.is_present() {
            snap.current = newest.position;
        }
    }

    let mut min_d2 = 0.0f32;
    let mut max_d2 = 0.0f32;
    for (p, _) in points.iter().filter(|(p, _)| p.is_present()) {
        let d2 = p.position.distance2(&center);
        if p.position.rank_cmp(&center) == Ordering::Greater {
            if d2 > max_d2 {
                max_d2 = d2;
                snap.max = p.position;
            }
        } else if d2 > min_d2 {
            min_d2 = d2;
            snap.min = p.position;
        }
    }

    // velocity pairs the newest entry with the nearest earlier present one
    if let Some((cur, rest)) = points.split_first().filter(|(cur, _)| cur.0.is_present()) {
        if let Some(prev) = rest.iter().find(|(p, _)| p.is_present()) {
            if let Some(v) = velocity(cur, prev, snap.min.distance(&snap.max)) {
                snap.velocity = v;
            }
        }
    }
    snap
}

/// Signed, normalised speed between two samples; `None` when undefined.
fn velocity(
    (cur, cur_t): &(KeypointSample, Instant),
    (prev, prev_t): &(KeypointSample, Instant),
    diameter: f32,
) -> Option<f32> {
    // whole milliseconds; pairs closer than 1 ms carry no speed
    let ms = cur_t.saturating_duration_since(*prev_t).as_millis() as f32;
    if diameter <= 0.0 || ms == 0.0 {
        return None;
    }
    let travelled = cur.position.distance(&prev.position);
    let mut v = ((travelled / diameter) * FULL_TRAVERSAL_MS / ms).min(1.0);
    if cur.position.rank_cmp(&prev.position) == Ordering::Less {
        v = -v;
    }
    v.is_finite().then(|| v.clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypoint::KeypointId;

    fn approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    fn head_at(t: Instant, y: Option<f32>) -> PoseFrame {
        let mut f = PoseFrame::empty(t);
        for kp in f.keypoints.iter_mut() {
            *kp = KeypointSample::absent();
        }
        if let Some(y) = y {
            f.set(
                KeypointId::Nose,
                KeypointSample::present(Position::new(50.0, y, 0.0)),
            );
        }
        f
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn windows_never_hold_entries_older_than_a_minute() {
        let agg = PoseAggregator::new(3);
        let t0 = Instant::now();
        for i in 0..300u64 {
            let t = t0 + ms(i * 500);
            agg.ingest(head_at(t, Some(i as f32)));
            let st = agg.window_stats();
            let floor = t.checked_sub(HISTORY_WINDOW).unwrap_or(t0);
            for oldest in [st.oldest_raw, st.oldest_smoothed, st.oldest_movement] {
                assert!(oldest.unwrap() >= floor);
            }
        }
        let st = agg.window_stats();
        assert_eq!(st.raw, 121);
        assert_eq!(st.smoothed, st.raw);
        assert_eq!(st.movement, st.raw);
    }

    #[test]
    fn smoothing_averages_last_k_present_samples() {
        let agg = PoseAggregator::new(3);
        let t0 = Instant::now();
        agg.ingest(head_at(t0, Some(0.0)));
        agg.ingest(head_at(t0 + ms(10), Some(3.0)));
        agg.ingest(head_at(t0 + ms(20), Some(6.0)));
        let s = agg.latest_smoothed().unwrap();
        assert!(approx_eq(s.keypoint(KeypointId::Nose).position.y, 3.0));

        agg.ingest(head_at(t0 + ms(30), None));
        let s = agg.latest_smoothed().unwrap();
        assert!(approx_eq(s.keypoint(KeypointId::Nose).position.y, 4.5));

        agg.ingest(head_at(t0 + ms(40), None));
        agg.ingest(head_at(t0 + ms(50), None));
        let s = agg.latest_smoothed().unwrap();
        assert_eq!(s.keypoint(KeypointId::Nose).presence, Presence::Absent);
        assert_eq!(s.keypoint(KeypointId::LeftAnkle).presence, Presence::Absent);
    }

    #[test]
    fn extent_sits_on_either_side_of_center() {
        let agg = PoseAggregator::new(1);
        let t0 = Instant::now();
        agg.ingest(head_at(t0, Some(0.0)));
        agg.ingest(head_at(t0 + ms(100), Some(10.0)));
        let m = agg.ingest(head_at(t0 + ms(200), Some(20.0)));
        let head = m.region(TrackedRegion::Head);
        assert!(head.is_present());
        assert!(approx_eq(head.center.y, 10.0));
        assert!(approx_eq(head.min.y, 0.0));
        assert!(approx_eq(head.max.y, 20.0));
        assert!(approx_eq(head.current.y, 20.0));
    }

    #[test]
    fn velocity_is_normalised_and_signed() {
        let agg = PoseAggregator::new(1);
        let t0 = Instant::now();
        agg.ingest(head_at(t0, Some(0.0)));
        let m = agg.ingest(head_at(t0 + ms(100), Some(10.0)));
        assert!(approx_eq(m.region(TrackedRegion::Head).velocity, 1.0));

        let m = agg.ingest(head_at(t0 + ms(200), Some(0.0)));
        assert!(approx_eq(m.region(TrackedRegion::Head).velocity, -1.0));

        // a tenth of the extent per 100 ms
        let m = agg.ingest(head_at(t0 + ms(1200), Some(10.0)));
        assert!(approx_eq(m.region(TrackedRegion::Head).velocity, 0.1));

        // far faster than full scale still clamps
        let m = agg.ingest(head_at(t0 + ms(1201), Some(0.0)));
        assert!(approx_eq(m.region(TrackedRegion::Head).velocity, -1.0));
    }

    #[test]
    fn velocity_skips_over_missing_samples() {
        let agg = PoseAggregator::new(1);
        let t0 = Instant::now();
        agg.ingest(head_at(t0, Some(0.0)));
        agg.ingest(head_at(t0 + ms(100), None));
        let m = agg.ingest(head_at(t0 + ms(1000), Some(10.0)));
        assert!(approx_eq(m.region(TrackedRegion::Head).velocity, 0.1));
    }

    #[test]
    fn velocity_holds_while_newest_sample_is_missing() {
        let agg = PoseAggregator::new(1);
        let t0 = Instant::now();
        agg.ingest(head_at(t0, Some(100.0)));
        agg.ingest(head_at(t0 + Duration::from_secs(20), Some(0.0)));
        let m = agg.ingest(head_at(t0 + ms(20_100), Some(10.0)));
        assert!(approx_eq(m.region(TrackedRegion::Head).velocity, 0.1));

        // the y=100 sample ages out, shrinking the extent, while the head is gone
        let m = agg.ingest(head_at(t0 + Duration::from_secs(31), None));
        let head = m.region(TrackedRegion::Head);
        assert_eq!(head.presence, Presence::Absent);
        assert!(approx_eq(head.velocity, 0.1));
    }

    #[test]
    fn sub_millisecond_pairs_keep_prior_velocity() {
        let agg = PoseAggregator::new(1);
        let t0 = Instant::now();
        agg.ingest(head_at(t0, Some(0.0)));
        agg.ingest(head_at(t0 + ms(1000), Some(10.0)));
        let m = agg.ingest(head_at(t0 + ms(1000) + Duration::from_micros(400), Some(0.0)));
        assert!(approx_eq(m.region(TrackedRegion::Head).velocity, 0.1));
    }

    #[test]
    fn velocity_holds_when_only_one_sample_is_left() {
        let agg = PoseAggregator::new(1);
        let t0 = Instant::now();
        agg.ingest(head_at(t0, Some(0.0)));
        agg.ingest(head_at(t0 + ms(100), Some(10.0)));
        let m = agg.ingest(head_at(t0 + Duration::from_secs(40), Some(5.0)));
        let head = m.region(TrackedRegion::Head);
        assert!(head.is_present());
        assert!(approx_eq(head.velocity, 1.0));
        assert!(approx_eq(head.center.y, 5.0));
    }

    #[test]
    fn absent_region_keeps_prior_extent() {
        let agg = PoseAggregator::new(1);
        let t0 = Instant::now();
        agg.ingest(head_at(t0, Some(0.0)));
        agg.ingest(head_at(t0 + ms(100), Some(20.0)));

        // let every present sample fall out of the 30 s window
        let gone = t0 + Duration::from_secs(31);
        let first = agg.ingest(head_at(gone, None));
        let later = agg.ingest(head_at(gone + Duration::from_secs(9), None));

        for m in [first, later] {
            let head = m.region(TrackedRegion::Head);
            assert_eq!(head.presence, Presence::Absent);
            assert!(head.center.is_finite() && head.min.is_finite() && head.max.is_finite());
            assert!(head.velocity.is_finite());
        }
        let (a, b) = (first.region(TrackedRegion::Head), later.region(TrackedRegion::Head));
        assert_eq!((a.center, a.min, a.max), (b.center, b.min, b.max));
        assert!(approx_eq(a.center.y, 10.0));
    }

    #[test]
    fn never_seen_region_is_absent_and_finite() {
        let agg = PoseAggregator::new(2);
        let t0 = Instant::now();
        let m = agg.ingest(head_at(t0, Some(1.0)));
        let hips = m.region(TrackedRegion::Hips);
        assert_eq!(hips.presence, Presence::Absent);
        assert_eq!(hips.center, Position::default());
        assert_eq!(hips.velocity, 0.0);
    }

    #[test]
    fn non_finite_input_does_not_leak() {
        let agg = PoseAggregator::new(1);
        let t0 = Instant::now();
        agg.ingest(head_at(t0, Some(0.0)));
        let m = agg.ingest(head_at(t0 + ms(100), Some(f32::NAN)));
        let head = m.region(TrackedRegion::Head);
        assert_eq!(head.presence, Presence::Absent);
        assert!(head.center.is_finite() && head.current.is_finite());
    }

    #[test]
    fn ingest_notifies_subscribers_and_keeps_selection() {
        let agg = PoseAggregator::new(1);
        let rx = agg.subscribe();
        assert_eq!(agg.tracked_region(), None);
        agg.select_tracked_region(Some(TrackedRegion::LeftHand));

        let t0 = Instant::now();
        let m = agg.ingest(head_at(t0, Some(1.0)));
        assert_eq!(rx.try_recv(), Ok(m));
        assert_eq!(agg.latest_movement(), Some(m));
        assert_eq!(agg.tracked_region(), Some(TrackedRegion::LeftHand));
    }
}
