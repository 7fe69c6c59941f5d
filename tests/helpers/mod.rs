//! Test doubles for the media decoder and detection backend.

#![allow(dead_code)]

use image::RgbImage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use headcount::models::detection::Detection;
use headcount::services::detector::{DetectError, Detector};
use headcount::services::media::{Frame, MediaError, MediaSource};

/// Synthetic media whose frames are tiny blank images.
pub struct FakeMedia {
    reported_frames: i64,
    real_frames: u32,
    broken: HashSet<u32>,
    reads: Arc<Mutex<Vec<u32>>>,
}

impl FakeMedia {
    pub fn new(frames: u32) -> Self {
        Self {
            reported_frames: frames as i64,
            real_frames: frames,
            broken: HashSet::new(),
            reads: Arc::default(),
        }
    }

    /// Claims more frames than it can actually produce.
    pub fn truncated(reported: i64, real: u32) -> Self {
        Self {
            reported_frames: reported,
            real_frames: real,
            broken: HashSet::new(),
            reads: Arc::default(),
        }
    }

    pub fn with_broken(mut self, frames: impl IntoIterator<Item = u32>) -> Self {
        self.broken.extend(frames);
        self
    }

    /// Shared log of every `read_frame` index, readable after the media is consumed.
    pub fn read_log(&self) -> Arc<Mutex<Vec<u32>>> {
        Arc::clone(&self.reads)
    }
}

impl MediaSource for FakeMedia {
    fn frame_count(&self) -> Result<i64, MediaError> {
        Ok(self.reported_frames)
    }

    fn read_frame(&mut self, index: u32) -> Result<Frame, MediaError> {
        self.reads.lock().unwrap().push(index);
        if index == 0 || index > self.real_frames {
            return Err(MediaError::EndOfMedia);
        }
        if self.broken.contains(&index) {
            return Err(MediaError::Decode(image::ImageError::IoError(
                std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt frame"),
            )));
        }
        Ok(Frame {
            index,
            image: RgbImage::new(4, 4),
        })
    }
}

/// Media whose decoder blocks the calling thread for `per_frame` on every read.
pub struct SlowMedia {
    frames: u32,
    per_frame: Duration,
}

impl SlowMedia {
    pub fn new(frames: u32, per_frame: Duration) -> Self {
        Self { frames, per_frame }
    }
}

impl MediaSource for SlowMedia {
    fn frame_count(&self) -> Result<i64, MediaError> {
        Ok(self.frames as i64)
    }

    fn read_frame(&mut self, index: u32) -> Result<Frame, MediaError> {
        if index == 0 || index > self.frames {
            return Err(MediaError::EndOfMedia);
        }
        std::thread::sleep(self.per_frame);
        Ok(Frame {
            index,
            image: RgbImage::new(4, 4),
        })
    }
}

/// Detector that answers from a per-frame script.
///
/// Frames without a script entry return `default`.
pub struct ScriptedDetector {
    script: HashMap<u32, Vec<Detection>>,
    failing: HashSet<u32>,
    default: Vec<Detection>,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<u32>>,
}

impl ScriptedDetector {
    pub fn constant(detections: Vec<Detection>) -> Self {
        Self {
            script: HashMap::new(),
            failing: HashSet::new(),
            default: detections,
            delay: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn on_frame(mut self, frame: u32, detections: Vec<Detection>) -> Self {
        self.script.insert(frame, detections);
        self
    }

    pub fn failing_on(mut self, frames: impl IntoIterator<Item = u32>) -> Self {
        self.failing.extend(frames);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for ScriptedDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(frame.index);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(&frame.index) {
            return Err(DetectError::Backend(format!("model crashed on frame {}", frame.index)));
        }
        Ok(self
            .script
            .get(&frame.index)
            .cloned()
            .unwrap_or_else(|| self.default.clone()))
    }
}

/// A standing person centred on (`cx`, `cy`).
pub fn person(cx: f64, cy: f64) -> Detection {
    Detection::new(cx - 25.0, cy - 60.0, cx + 25.0, cy + 60.0, 0.87)
}
