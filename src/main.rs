use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use headcount::config::AppConfig;
use headcount::models::analysis::AnalysisReport;
use headcount::models::job::{JobCounts, JobStatus};
use headcount::services::{
    detector::HttpDetector,
    media::ImageSequenceSource,
    pipeline::AnalysisPipeline,
    sampler::FrameSampler,
    scheduler::TaskScheduler,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    let paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        tracing::error!("No media given. Usage: headcount <image-or-frame-dir>...");
        std::process::exit(2);
    }


    // Initialize Prometheus metrics recorder
    let prometheus = PrometheusBuilder::new();
    match config.metrics_addr.as_deref() {
        Some(addr) => {
            let addr: SocketAddr = addr.parse().expect("METRICS_ADDR is not a socket address");
            prometheus
                .with_http_listener(addr)
                .install()
                .expect("Failed to install Prometheus exporter");
            tracing::info!("Serving metrics on {}", addr);
        }
        None => {
            prometheus
                .install_recorder()
                .expect("Failed to install Prometheus metrics recorder");
        }
    }
    describe_metrics();

    let scheduler = TaskScheduler::<AnalysisReport>::new(config.max_concurrency);
    let pipeline = Arc::new(
        AnalysisPipeline::new(FrameSampler::default(), config.tracker())
            .with_max_frames(config.max_frames),
    );

    tracing::info!(
        max_concurrency = scheduler.max_concurrency(),
        max_frames = ?config.max_frames,
        media = paths.len(),
        "Initializing headcount"
    );
    let detector = Arc::new(HttpDetector::new(
        config.detector_url.clone(),
        config.detector_api_token.clone(),
        config.person_label.clone(),
        config.detection_threshold,
    ));

    // Periodically drop old finished jobs
    let sweeper = {
        let scheduler = scheduler.clone();
        let interval = config.cleanup_interval();
        let retain = config.retain_completed();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                scheduler.cleanup(retain);
                publish_gauges(scheduler.counts());
            }
        })
    };

    let mut submitted = Vec::new();
    for path in paths {
        let media = match ImageSequenceSource::open(&path) {
            Ok(media) => media,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to open media");
                continue;
            }
        };
        match pipeline.submit(&scheduler, media, Arc::clone(&detector), config.job_timeout()) {
            Ok(job_id) => submitted.push((job_id, path)),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to submit job"),
        }
    }
    publish_gauges(scheduler.counts());

    // Cancel everything on Ctrl-C
    {
        let scheduler = scheduler.clone();
        let ids: Vec<_> = submitted.iter().map(|(id, _)| *id).collect();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling jobs");
                for id in ids {
                    if let Err(e) = scheduler.cancel(id) {
                        tracing::debug!(job_id = %id, error = %e, "Cancel skipped");
                    }
                }
            }
        });
    }

    let mut failed = 0usize;
    for (job_id, path) in &submitted {
        let view = match scheduler.wait(*job_id, config.poll_interval()).await {
            Ok(view) => view,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Lost track of job");
                failed += 1;
                continue;
            }
        };
        publish_gauges(scheduler.counts());

        match (view.status, &view.result) {
            (JobStatus::Completed, Some(report)) => {
                let report_json = serde_json::to_string(report).unwrap_or_default();
                tracing::info!(
                    job_id = %job_id,
                    path = %path.display(),
                    unique_people = report.unique_people,
                    report = %report_json,
                    "Analysis finished"
                );
            }
            (status, _) => {
                failed += 1;
                tracing::error!(
                    job_id = %job_id,
                    path = %path.display(),
                    status = %status,
                    error = view.error.as_deref().unwrap_or("unknown"),
                    "Analysis did not complete"
                );
            }
        }
    }

    sweeper.abort();
    scheduler.shutdown().await;

    if failed > 0 || submitted.is_empty() {
        std::process::exit(1);
    }
}

fn describe_metrics() {
    metrics::describe_counter!("jobs_submitted_total", "Total analysis jobs submitted");
    metrics::describe_counter!("jobs_completed_total", "Total jobs completed");
    metrics::describe_counter!("jobs_failed_total", "Total jobs whose work returned an error or panicked");
    metrics::describe_counter!("jobs_timed_out_total", "Total jobs observed past their timeout");
    metrics::describe_counter!("jobs_cancelled_total", "Total jobs cancelled");
    metrics::describe_histogram!("job_duration_seconds", "Wall time of finished jobs");
    metrics::describe_counter!("frames_analyzed_total", "Sampled frames run through the tracker");
    metrics::describe_counter!("frames_skipped_total", "Sampled frames skipped after a decode or detection failure");
    metrics::describe_gauge!("jobs_pending", "Jobs waiting for a worker slot");
    metrics::describe_gauge!("jobs_running", "Jobs currently holding a worker slot");
}

fn publish_gauges(counts: JobCounts) {
    metrics::gauge!("jobs_pending").set(counts.pending as f64);
    metrics::gauge!("jobs_running").set(counts.running as f64);
}
