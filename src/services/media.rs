use image::RgbImage;
use std::path::{Path, PathBuf};

/// One decoded frame. `index` is 1-based.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u32,
    pub image: RgbImage,
}

/// Decoder for a media item.
///
/// Frames are addressed by 1-based index. `read_frame` returns
/// [`MediaError::EndOfMedia`] once the index runs past the real end of the
/// media, which may happen before `frame_count` if the count was estimated.
/// Both calls may block; the pipeline makes them from tokio's blocking pool.
pub trait MediaSource: Send {
    fn frame_count(&self) -> Result<i64, MediaError>;

    fn read_frame(&mut self, index: u32) -> Result<Frame, MediaError>;
}

/// Still-image media: a single image file, or a directory of images where
/// each file (sorted by name) is one frame.
pub struct ImageSequenceSource {
    frames: Vec<PathBuf>,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

impl ImageSequenceSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MediaError> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| MediaError::io(path, e))?;

        let frames = if metadata.is_dir() {
            let mut frames = Vec::new();
            for entry in std::fs::read_dir(path).map_err(|e| MediaError::io(path, e))? {
                let entry = entry.map_err(|e| MediaError::io(path, e))?;
                let candidate = entry.path();
                if candidate.is_file() && has_image_extension(&candidate) {
                    frames.push(candidate);
                }
            }
            frames.sort();
            frames
        } else {
            vec![path.to_path_buf()]
        };

        if frames.is_empty() {
            return Err(MediaError::Empty(path.to_path_buf()));
        }

        tracing::debug!(path = %path.display(), frames = frames.len(), "Opened image sequence");
        Ok(Self { frames })
    }
}

impl MediaSource for ImageSequenceSource {
    fn frame_count(&self) -> Result<i64, MediaError> {
        Ok(self.frames.len() as i64)
    }

    fn read_frame(&mut self, index: u32) -> Result<Frame, MediaError> {
        let path = index
            .checked_sub(1)
            .and_then(|i| self.frames.get(i as usize))
            .ok_or(MediaError::EndOfMedia)?;

        let image = image::open(path)?.to_rgb8();
        Ok(Frame { index, image })
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),

    #[error("No image frames found in {0}")]
    Empty(PathBuf),

    #[error("End of media")]
    EndOfMedia,
}

impl MediaError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        MediaError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
