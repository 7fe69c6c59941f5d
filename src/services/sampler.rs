use std::collections::BTreeSet;

/// Chooses which frames of a clip are sent to the detector.
///
/// Short clips are analyzed exhaustively. Longer clips get a fixed budget
/// (`sample_ratio` of the clip, never less than `min_samples`) split evenly
/// across four overlapping strategies:
/// - a contiguous block at the start of the clip (people entering)
/// - evenly spaced points across the middle band
/// - a contiguous block at the end of the clip (people leaving)
/// - evenly spaced points across the whole clip
///
/// Each edge block is at most `edge_ratio` of the clip but is also held to its
/// quarter of the budget, so on long clips it covers less than the full edge
/// span (10,000 frames: blocks 1..=500 and 9,501..=10,000).
///
/// Frame indices are 1-based.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    /// Clips with at most this many frames are fully analyzed.
    pub exhaustive_limit: i64,
    pub sample_ratio: f64,
    pub min_samples: i64,
    /// Share of the clip covered by each of the entry and exit blocks.
    pub edge_ratio: f64,
    pub middle_start: f64,
    pub middle_end: f64,
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self {
            exhaustive_limit: 100,
            sample_ratio: 0.20,
            min_samples: 50,
            edge_ratio: 0.10,
            middle_start: 0.40,
            middle_end: 0.60,
        }
    }
}

impl FrameSampler {
    /// Target number of frames for a clip above the exhaustive limit.
    pub fn target_size(&self, total_frames: i64) -> i64 {
        let budget = (total_frames as f64 * self.sample_ratio).round() as i64;
        budget.max(self.min_samples)
    }

    /// Select frame indices in `1..=total_frames`. Non-positive counts yield an empty set.
    pub fn sample(&self, total_frames: i64) -> BTreeSet<u32> {
        if total_frames <= 0 {
            return BTreeSet::new();
        }
        let total = total_frames.min(u32::MAX as i64) as u32;

        if total_frames <= self.exhaustive_limit {
            return (1..=total).collect();
        }

        let quota = (self.target_size(total_frames) / 4).max(1) as u32;
        let edge_span = ((total as f64 * self.edge_ratio).ceil() as u32).max(1);
        let block = quota.min(edge_span).min(total);

        let mut frames = BTreeSet::new();

        // Entry block
        frames.extend(1..=block);

        // Middle band
        let middle_lo = ((total as f64 * self.middle_start).round() as u32).clamp(1, total);
        let middle_hi = ((total as f64 * self.middle_end).round() as u32).clamp(middle_lo, total);
        frames.extend(evenly_spaced(middle_lo, middle_hi, quota));

        // Exit block
        frames.extend((total - block + 1)..=total);

        // Baseline coverage
        frames.extend(evenly_spaced(1, total, quota));

        frames
    }
}

/// `count` points from `start` to `end` inclusive, spread as evenly as integer indices allow.
fn evenly_spaced(start: u32, end: u32, count: u32) -> impl Iterator<Item = u32> {
    let span = (end - start) as f64;
    (0..count).map(move |i| {
        if count == 1 {
            start
        } else {
            start + (i as f64 * span / (count - 1) as f64).round() as u32
        }
    })
}
