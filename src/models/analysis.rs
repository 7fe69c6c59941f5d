use serde::{Deserialize, Serialize};

/// Summary of one media item's people-counting run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Tracks seen in at least `min_frames_for_confidence` frames.
    pub unique_people: usize,
    pub frames_analyzed: usize,
    pub total_frames: i64,
    /// Most people matched in a single analyzed frame.
    pub peak_occupancy: usize,
    pub avg_occupancy: f64,
    pub processing_time_seconds: f64,

    pub frames_sampled: usize,
    /// Sampled frames dropped because decoding or detection failed.
    pub frames_skipped: usize,
    pub total_detections: usize,
    /// Every track id allocated, including single-frame noise.
    pub total_tracks_created: u64,
    pub confident_track_ids: Vec<u64>,
    pub min_frames_for_confidence: u32,
    /// Breakdown of the first few analyzed frames.
    pub frame_samples: Vec<FrameStat>,
}

/// Tracker state after one analyzed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameStat {
    pub frame: u32,
    pub detections: usize,
    /// Active tracks, including ones not matched in this frame.
    pub tracked_objects: usize,
    pub tracking_ids: Vec<u64>,
}

/// Round to two decimal places for reporting.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
