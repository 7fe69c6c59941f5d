//! Centroid-based identity tracker for counting distinct people.
//!
//! Associates detections between consecutive sampled frames by greedy
//! nearest-centroid matching. Each track keeps a count of the frames it was
//! matched in so that single-frame detector noise can be excluded from the
//! final unique-people figure.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::detection::{BoundingBox, Detection, Point};

pub type TrackId = u64;

/// Tracker thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    /// Detections further than this (pixels) from every active track start a new track.
    pub max_distance: f64,
    /// Consecutive unmatched frames a track survives before it is retired.
    pub max_age: u32,
    /// Frames a track must be matched in to count as a unique person.
    pub min_frames_for_confidence: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_distance: 50.0,
            max_age: 30,
            min_frames_for_confidence: 3,
        }
    }
}

/// Read-only view of a track returned from [`IdentityTracker::update`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrackView {
    pub id: TrackId,
    pub centroid: Point,
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub age: u32,
    pub frames_seen: u32,
}

#[derive(Debug, Clone)]
struct Track {
    centroid: Point,
    bbox: BoundingBox,
    confidence: f64,
    /// Frames since last match
    age: u32,
    frames_seen: u32,
}

impl Track {
    fn from_detection(detection: &Detection) -> Self {
        Self {
            centroid: detection.centroid(),
            bbox: detection.bbox,
            confidence: detection.confidence,
            age: 0,
            frames_seen: 1,
        }
    }

    fn observe(&mut self, detection: &Detection) {
        self.centroid = detection.centroid();
        self.bbox = detection.bbox;
        self.confidence = detection.confidence;
        self.age = 0;
        self.frames_seen += 1;
    }

    fn view(&self, id: TrackId) -> TrackView {
        TrackView {
            id,
            centroid: self.centroid,
            bbox: self.bbox,
            confidence: self.confidence,
            age: self.age,
            frames_seen: self.frames_seen,
        }
    }
}

/// Multi-object tracker for one analysis run.
///
/// `update` must be called once per sampled frame in frame order; matching is
/// always against the previous frame's active tracks.
pub struct IdentityTracker {
    config: TrackerConfig,
    /// Active tracks, iterated in id (creation) order
    active: BTreeMap<TrackId, Track>,
    /// Retired id -> frames seen
    retired: BTreeMap<TrackId, u32>,
    next_id: TrackId,
}

impl IdentityTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            active: BTreeMap::new(),
            retired: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Feed one frame's detections and return the active tracks.
    pub fn update(&mut self, detections: &[Detection]) -> BTreeMap<TrackId, TrackView> {
        let centroids: Vec<Point> = detections.iter().map(Detection::centroid).collect();
        let mut claimed = vec![false; detections.len()];
        let mut expired = Vec::new();

        for (&id, track) in self.active.iter_mut() {
            let mut best: Option<(usize, f64)> = None;
            for (idx, centroid) in centroids.iter().enumerate() {
                if claimed[idx] {
                    continue;
                }
                let dist = track.centroid.distance(centroid);
                if dist >= self.config.max_distance {
                    continue;
                }
                if best.map_or(true, |(_, best_dist)| dist < best_dist) {
                    best = Some((idx, dist));
                }
            }

            match best {
                Some((idx, _)) => {
                    claimed[idx] = true;
                    track.observe(&detections[idx]);
                }
                None => {
                    track.age += 1;
                    if track.age > self.config.max_age {
                        expired.push(id);
                    }
                }
            }
        }

        for id in expired {
            if let Some(track) = self.active.remove(&id) {
                tracing::trace!(track_id = id, frames_seen = track.frames_seen, "Track retired");
                self.retired.insert(id, track.frames_seen);
            }
        }

        for (idx, detection) in detections.iter().enumerate() {
            if claimed[idx] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.active.insert(id, Track::from_detection(detection));
        }

        self.active
            .iter()
            .map(|(&id, track)| (id, track.view(id)))
            .collect()
    }

    /// Ids of every track, active or retired, matched in enough frames to be trusted.
    pub fn confident_tracks(&self) -> BTreeSet<TrackId> {
        let min = self.config.min_frames_for_confidence;
        let active = self
            .active
            .iter()
            .filter(|(_, track)| track.frames_seen >= min)
            .map(|(&id, _)| id);
        let retired = self
            .retired
            .iter()
            .filter(|(_, &frames_seen)| frames_seen >= min)
            .map(|(&id, _)| id);
        active.chain(retired).collect()
    }

    /// Number of ids allocated so far, including noise.
    pub fn total_created(&self) -> u64 {
        self.next_id - 1
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Active tracks matched (or created) in the latest frame.
    pub fn visible_count(&self) -> usize {
        self.active.values().filter(|t| t.age == 0).count()
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }
}
