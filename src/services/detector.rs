use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Cursor;

use crate::models::detection::Detection;
use crate::services::media::Frame;

/// Person detector backend.
///
/// Failures must be reported as errors rather than an empty list so that the
/// pipeline can tell "nobody in frame" from "detector broken".
pub trait Detector: Send + Sync {
    fn detect(
        &self,
        frame: &Frame,
    ) -> impl Future<Output = Result<Vec<Detection>, DetectError>> + Send;
}

/// Client for a remote object-detection endpoint.
pub struct HttpDetector {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
    label: String,
    min_confidence: f64,
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    image: &'a str,
    frame: u32,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    detections: Vec<RemoteBox>,
}

#[derive(Debug, Deserialize)]
struct RemoteBox {
    label: String,
    confidence: f64,
    #[serde(rename = "box")]
    xyxy: [f64; 4],
}

impl HttpDetector {
    pub fn new(
        endpoint: impl Into<String>,
        api_token: Option<String>,
        label: impl Into<String>,
        min_confidence: f64,
    ) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            api_token,
            label: label.into(),
            min_confidence,
        }
    }

    fn keep(&self, remote: RemoteBox) -> Option<Detection> {
        if remote.label != self.label || remote.confidence < self.min_confidence {
            return None;
        }
        let [x1, y1, x2, y2] = remote.xyxy;
        Some(Detection::new(x1, y1, x2, y2, remote.confidence))
    }

    /// Parse a response body into detections of the configured class.
    fn parse(&self, body: &str) -> Result<Vec<Detection>, DetectError> {
        let response: DetectResponse = serde_json::from_str(body)?;
        Ok(response
            .detections
            .into_iter()
            .filter_map(|b| self.keep(b))
            .collect())
    }
}

impl Detector for HttpDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        let encoded = encode_frame(frame).await?;

        let mut request = self.http.post(&self.endpoint).json(&DetectRequest {
            image: &encoded,
            frame: frame.index,
        });
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let body = request
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        self.parse(&body)
    }
}

/// PNG-encode and base64 a frame on the blocking pool.
async fn encode_frame(frame: &Frame) -> Result<String, DetectError> {
    let image = frame.image.clone();
    tokio::task::spawn_blocking(move || {
        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
        Ok::<_, DetectError>(base64::engine::general_purpose::STANDARD.encode(&png))
    })
    .await?
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse detection response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Detector backend error: {0}")]
    Backend(String),

    #[error("Encoder task failed: {0}")]
    EncodeTask(#[from] tokio::task::JoinError),
}
