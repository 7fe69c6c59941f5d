use serde::Deserialize;
use std::time::Duration;

use crate::services::tracker::TrackerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Worker slots in the job scheduler.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-job timeout in seconds.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// How often finished jobs are swept from the job table.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// How long finished jobs are kept before a sweep removes them.
    #[serde(default = "default_retain_completed_secs")]
    pub retain_completed_secs: u64,

    /// Status polling interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Centroid distance (pixels) beyond which a detection starts a new track.
    #[serde(default = "default_tracker_max_distance")]
    pub tracker_max_distance: f64,

    /// Sampled frames a track may go unmatched before it is retired.
    #[serde(default = "default_tracker_max_age")]
    pub tracker_max_age: u32,

    /// Frames a track must be seen in to count as a person.
    #[serde(default = "default_min_frames_for_confidence")]
    pub min_frames_for_confidence: u32,

    /// Object-detection endpoint URL
    pub detector_url: String,

    /// Bearer token for the detection endpoint
    #[serde(default)]
    pub detector_api_token: Option<String>,

    /// Minimum detector confidence for a box to be kept.
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f64,

    /// Detector class label to count.
    #[serde(default = "default_person_label")]
    pub person_label: String,

    /// Only the first this many frames of each media item are analyzed.
    #[serde(default)]
    pub max_frames: Option<u32>,

    /// Prometheus scrape listener (e.g., "0.0.0.0:9090"). Disabled when unset.
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_job_timeout_secs() -> u64 {
    600
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_retain_completed_secs() -> u64 {
    24 * 3600
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_tracker_max_distance() -> f64 {
    50.0
}

fn default_tracker_max_age() -> u32 {
    30
}

fn default_min_frames_for_confidence() -> u32 {
    3
}

fn default_detection_threshold() -> f64 {
    0.5
}

fn default_person_label() -> String {
    "person".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            max_distance: self.tracker_max_distance,
            max_age: self.tracker_max_age,
            min_frames_for_confidence: self.min_frames_for_confidence,
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn retain_completed(&self) -> Duration {
        Duration::from_secs(self.retain_completed_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
