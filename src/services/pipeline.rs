use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::models::analysis::{round2, AnalysisReport, FrameStat};
use crate::models::job::JobId;
use crate::services::detector::Detector;
use crate::services::media::{Frame, MediaError, MediaSource};
use crate::services::sampler::FrameSampler;
use crate::services::scheduler::{JobContext, SchedulerError, TaskScheduler};
use crate::services::tracker::{IdentityTracker, TrackerConfig};

/// Confident track ids kept in a report.
const MAX_REPORTED_IDS: usize = 100;

/// Frames between progress log lines.
const LOG_EVERY_FRAMES: usize = 50;

/// Leading analyzed frames whose per-frame breakdown is kept in a report.
const MAX_FRAME_SAMPLES: usize = 10;

/// Counts unique people in one media item: sample frames, detect, track.
#[derive(Debug, Clone, Default)]
pub struct AnalysisPipeline {
    sampler: FrameSampler,
    tracker: TrackerConfig,
    /// Only the first `max_frames` frames of the media are considered.
    max_frames: Option<u32>,
}

impl AnalysisPipeline {
    pub fn new(sampler: FrameSampler, tracker: TrackerConfig) -> Self {
        Self {
            sampler,
            tracker,
            max_frames: None,
        }
    }

    pub fn with_max_frames(mut self, max_frames: Option<u32>) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Run the full analysis.
    ///
    /// Frames are processed in increasing index order. A frame that fails to
    /// decode or detect is logged and skipped; the run only fails when every
    /// attempted frame failed. Cancellation is checked between frames.
    ///
    /// Decoding runs on the blocking pool, so `media` is moved there for each
    /// call and handed back afterwards.
    pub async fn analyze<M, D>(
        &self,
        media: M,
        detector: &D,
        ctx: &JobContext,
    ) -> Result<AnalysisReport, PipelineError>
    where
        M: MediaSource + 'static,
        D: Detector,
    {
        let start = Instant::now();
        let (mut media, total_frames) = on_blocking_pool(media, |m| m.frame_count()).await?;
        let total_frames = total_frames?;
        let considered = match self.max_frames {
            Some(cap) => total_frames.min(i64::from(cap)),
            None => total_frames,
        };
        let frames = self.sampler.sample(considered);
        let sampled = frames.len();

        info!(
            job_id = %ctx.id(),
            total_frames,
            considered,
            sampled,
            "Starting people count"
        );

        let mut tracker = IdentityTracker::new(self.tracker);
        let mut analyzed = 0usize;
        let mut skipped = 0usize;
        let mut total_detections = 0usize;
        let mut peak_occupancy = 0usize;
        let mut occupancy_sum = 0usize;
        let mut frame_samples = Vec::new();

        for (position, &index) in frames.iter().enumerate() {
            if ctx.is_cancelled() {
                info!(job_id = %ctx.id(), frame = index, "Analysis cancelled");
                return Err(PipelineError::Cancelled);
            }

            let (returned, read) =
                on_blocking_pool(media, move |m| m.read_frame(index)).await?;
            media = returned;

            let frame: Frame = match read {
                Ok(frame) => frame,
                Err(MediaError::EndOfMedia) => {
                    debug!(job_id = %ctx.id(), frame = index, "Reached end of media early");
                    break;
                }
                Err(e) => {
                    warn!(job_id = %ctx.id(), frame = index, error = %e, "Failed to decode frame, skipping");
                    skipped += 1;
                    metrics::counter!("frames_skipped_total").increment(1);
                    continue;
                }
            };

            let detections = match detector.detect(&frame).await {
                Ok(detections) => detections,
                Err(e) => {
                    warn!(job_id = %ctx.id(), frame = index, error = %e, "Detection failed, skipping frame");
                    skipped += 1;
                    metrics::counter!("frames_skipped_total").increment(1);
                    continue;
                }
            };

            total_detections += detections.len();
            let tracks = tracker.update(&detections);

            let visible = tracker.visible_count();
            peak_occupancy = peak_occupancy.max(visible);
            occupancy_sum += visible;
            analyzed += 1;
            metrics::counter!("frames_analyzed_total").increment(1);

            if frame_samples.len() < MAX_FRAME_SAMPLES {
                frame_samples.push(FrameStat {
                    frame: index,
                    detections: detections.len(),
                    tracked_objects: tracks.len(),
                    tracking_ids: tracks.keys().copied().collect(),
                });
            }

            let pct = ((position + 1) * 100 / sampled) as u8;
            if let Err(e) = ctx.set_progress(pct) {
                debug!(job_id = %ctx.id(), error = %e, "Progress update rejected");
            }

            if analyzed % LOG_EVERY_FRAMES == 0 {
                info!(
                    job_id = %ctx.id(),
                    frame = index,
                    analyzed,
                    sampled,
                    detections = detections.len(),
                    visible,
                    "Analysis progress"
                );
            }
        }

        if analyzed == 0 && skipped > 0 {
            return Err(PipelineError::NoFramesAnalyzed { attempted: skipped });
        }

        let confident = tracker.confident_tracks();
        let avg_occupancy = if analyzed > 0 {
            occupancy_sum as f64 / analyzed as f64
        } else {
            0.0
        };

        let report = AnalysisReport {
            unique_people: confident.len(),
            frames_analyzed: analyzed,
            total_frames,
            peak_occupancy,
            avg_occupancy: round2(avg_occupancy),
            processing_time_seconds: round2(start.elapsed().as_secs_f64()),
            frames_sampled: sampled,
            frames_skipped: skipped,
            total_detections,
            total_tracks_created: tracker.total_created(),
            confident_track_ids: confident.iter().take(MAX_REPORTED_IDS).copied().collect(),
            min_frames_for_confidence: self.tracker.min_frames_for_confidence,
            frame_samples,
        };

        info!(
            job_id = %ctx.id(),
            unique_people = report.unique_people,
            frames_analyzed = report.frames_analyzed,
            frames_skipped = report.frames_skipped,
            tracks_created = report.total_tracks_created,
            "People count complete"
        );

        Ok(report)
    }

    /// Queue an analysis of `media` on `scheduler`.
    pub fn submit<M, D>(
        self: &Arc<Self>,
        scheduler: &TaskScheduler<AnalysisReport>,
        media: M,
        detector: Arc<D>,
        timeout: Duration,
    ) -> Result<JobId, SchedulerError>
    where
        M: MediaSource + 'static,
        D: Detector + 'static,
    {
        let pipeline = Arc::clone(self);
        scheduler.submit(timeout, move |ctx| async move {
            pipeline.analyze(media, detector.as_ref(), &ctx).await
        })
    }
}

/// Run `f` against `media` on tokio's blocking pool and return the source with the result.
async fn on_blocking_pool<M, R, F>(mut media: M, f: F) -> Result<(M, R), PipelineError>
where
    M: MediaSource + 'static,
    R: Send + 'static,
    F: FnOnce(&mut M) -> R + Send + 'static,
{
    let (media, out) = tokio::task::spawn_blocking(move || {
        let out = f(&mut media);
        (media, out)
    })
    .await?;
    Ok((media, out))
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("No frames could be analyzed ({attempted} attempted)")]
    NoFramesAnalyzed { attempted: usize },

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Decoder task failed: {0}")]
    DecoderTask(#[from] tokio::task::JoinError),
}
