use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::tool::{ToolCommand, ToolRunner};

/// Seek points tried in order, in seconds (5 min, 2 min, 10 min).
pub const SEEK_OFFSETS: [u64; 3] = [300, 120, 600];
pub const FALLBACK_OFFSET: u64 = 300;
pub const FALLBACK_WIDTH: u32 = 1920;
pub const FALLBACK_HEIGHT: u32 = 1080;
pub const FALLBACK_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("{0}")]
    Tool(#[from] crate::core::tool::ToolError),

    #[error("exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("no output written")]
    EmptyOutput,

    #[error("raw frame was {actual} bytes, expected {expected}")]
    ShortFrame { expected: usize, actual: usize },

    #[error("encode failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Every attempt failed; the video cannot be embedded this run.
#[derive(Debug, Error)]
#[error("No frame could be extracted from {}: {}", .video.display(), summarize(.attempts))]
pub struct ExtractionError {
    pub video: PathBuf,
    pub attempts: Vec<(String, AttemptError)>,
}

fn summarize(attempts: &[(String, AttemptError)]) -> String {
    attempts
        .iter()
        .map(|(label, error)| format!("{label}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A still image written for one video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameImage {
    pub video: PathBuf,
    pub path: PathBuf,
    /// Seek offset that produced the frame, `None` when the raw fallback did.
    pub offset: Option<u64>,
}

/// Pulls one representative frame out of a video with ffmpeg.
pub struct FrameExtractor<R: ToolRunner> {
    runner: Arc<R>,
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl<R: ToolRunner> FrameExtractor<R> {
    pub fn new(runner: Arc<R>, ffmpeg: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            ffmpeg: ffmpeg.into(),
            timeout,
        }
    }

    /// Frame location for `video` inside `frame_dir`, keyed by a hash of the full path
    /// so identically named videos in different folders do not share a frame.
    pub fn frame_path(frame_dir: &Path, video: &Path) -> PathBuf {
        let hash = blake3::hash(video.to_string_lossy().as_bytes()).to_hex();
        frame_dir.join(format!("{}.jpg", &hash.as_str()[..16]))
    }

    pub async fn extract(&self, video: &Path, output: &Path) -> Result<FrameImage, ExtractionError> {
        let mut attempts = Vec::new();

        for offset in SEEK_OFFSETS {
            match self.extract_at(video, output, offset).await {
                Ok(()) => {
                    log::debug!("Extracted frame of {} at {}", video.display(), timestamp(offset));
                    return Ok(FrameImage {
                        video: video.to_path_buf(),
                        path: output.to_path_buf(),
                        offset: Some(offset),
                    });
                }
                Err(e) => attempts.push((format!("seek {}", timestamp(offset)), e)),
            }
        }

        match self.extract_raw(video, output).await {
            Ok(()) => {
                log::debug!("Extracted frame of {} with raw decode", video.display());
                Ok(FrameImage {
                    video: video.to_path_buf(),
                    path: output.to_path_buf(),
                    offset: None,
                })
            }
            Err(e) => {
                attempts.push(("raw decode".to_string(), e));
                let _ = fs::remove_file(output);
                Err(ExtractionError {
                    video: video.to_path_buf(),
                    attempts,
                })
            }
        }
    }

    async fn extract_at(&self, video: &Path, output: &Path, offset: u64) -> Result<(), AttemptError> {
        remove_stale(output)?;

        let command = ToolCommand::new(&self.ffmpeg, self.timeout)
            .arg("-ss")
            .arg(timestamp(offset))
            .arg("-i")
            .arg(video)
            .args(["-vframes", "1", "-q:v", "2", "-f", "image2", "-y"])
            .arg(output);

        let result = self.runner.run(&command).await?;
        if !result.success {
            return Err(AttemptError::Exit {
                code: result.code,
                stderr: result.stderr_summary(),
            });
        }

        match fs::metadata(output) {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(AttemptError::EmptyOutput),
        }
    }

    async fn extract_raw(&self, video: &Path, output: &Path) -> Result<(), AttemptError> {
        remove_stale(output)?;

        let command = ToolCommand::new(&self.ffmpeg, self.timeout)
            .arg("-ss")
            .arg(timestamp(FALLBACK_OFFSET))
            .arg("-i")
            .arg(video)
            .args(["-vframes", "1", "-f", "rawvideo", "-pix_fmt", "rgb24", "-s"])
            .arg(format!("{FALLBACK_WIDTH}x{FALLBACK_HEIGHT}"))
            .args(["-y", "-"]);

        let result = self.runner.run(&command).await?;
        if !result.success {
            return Err(AttemptError::Exit {
                code: result.code,
                stderr: result.stderr_summary(),
            });
        }
        if result.stdout.is_empty() {
            return Err(AttemptError::EmptyOutput);
        }

        let expected = (FALLBACK_WIDTH * FALLBACK_HEIGHT * 3) as usize;
        let actual = result.stdout.len();
        let mut pixels = result.stdout;
        if actual < expected {
            return Err(AttemptError::ShortFrame { expected, actual });
        }
        pixels.truncate(expected);

        let frame = RgbImage::from_raw(FALLBACK_WIDTH, FALLBACK_HEIGHT, pixels)
            .ok_or(AttemptError::ShortFrame { expected, actual })?;
        save_jpeg(&frame, output, FALLBACK_JPEG_QUALITY)
    }
}

fn remove_stale(output: &Path) -> Result<(), AttemptError> {
    match fs::remove_file(output) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AttemptError::Io(e)),
    }
}

fn save_jpeg(frame: &RgbImage, path: &Path, quality: u8) -> Result<(), AttemptError> {
    let mut output = fs::File::create(path)?;
    let encoder = JpegEncoder::new_with_quality(&mut output, quality);
    frame.write_with_encoder(encoder)?;
    Ok(())
}

/// `HH:MM:SS` form ffmpeg accepts for `-ss`.
pub fn timestamp(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}
