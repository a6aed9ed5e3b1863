use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::tool::{ToolCommand, ToolError, ToolRunner};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe failed: {0}")]
    Tool(#[from] ToolError),

    #[error("ffprobe exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("No video stream found")]
    NoVideoStream,

    #[error("Unparsable {field}: {value:?}")]
    Parse { field: &'static str, value: String },
}

/// Stream and container metadata that feeds the quality score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoQuality {
    pub width: u64,
    pub height: u64,
    pub duration: f64,
    pub bit_rate: u64,
}

impl VideoQuality {
    /// width × height × duration × max(bit rate, 1). A reported zero bit rate must not
    /// flatten the whole product.
    pub fn score(&self) -> f64 {
        self.width as f64 * self.height as f64 * self.duration * self.bit_rate.max(1) as f64
    }
}

/// Ranks videos by probing them with ffprobe.
pub struct QualityScorer<R: ToolRunner> {
    runner: Arc<R>,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl<R: ToolRunner> QualityScorer<R> {
    pub fn new(runner: Arc<R>, ffprobe: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            ffprobe: ffprobe.into(),
            timeout,
        }
    }

    /// Score of `video`, 0 when its metadata cannot be obtained.
    pub async fn score(&self, video: &Path) -> f64 {
        match self.probe(video).await {
            Ok(quality) => quality.score(),
            Err(e) => {
                log::warn!("Failed to probe {}: {}", video.display(), e);
                0.0
            }
        }
    }

    pub async fn probe(&self, video: &Path) -> Result<VideoQuality, ProbeError> {
        let stream = ToolCommand::new(&self.ffprobe, self.timeout)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=width,height,bit_rate", "-of", "csv=p=0"])
            .arg(video);
        let stream_text = self.run(&stream).await?;
        let (width, height, bit_rate) = parse_stream_line(&stream_text)?;

        let format = ToolCommand::new(&self.ffprobe, self.timeout)
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(video);
        let duration = parse_duration(&self.run(&format).await?)?;

        Ok(VideoQuality {
            width,
            height,
            duration,
            bit_rate,
        })
    }

    async fn run(&self, command: &ToolCommand) -> Result<String, ProbeError> {
        let output = self.runner.run(command).await?;
        if !output.success {
            return Err(ProbeError::Exit {
                code: output.code,
                stderr: output.stderr_summary(),
            });
        }
        Ok(output.stdout_text())
    }
}

/// Parses `width,height,bit_rate` as printed by `-of csv=p=0`.
pub fn parse_stream_line(text: &str) -> Result<(u64, u64, u64), ProbeError> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or(ProbeError::NoVideoStream)?;

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 3 {
        return Err(ProbeError::Parse {
            field: "stream",
            value: line.to_string(),
        });
    }

    let parse = |field: &'static str, value: &str| {
        value.parse::<u64>().map_err(|_| ProbeError::Parse {
            field,
            value: value.to_string(),
        })
    };

    Ok((
        parse("width", fields[0])?,
        parse("height", fields[1])?,
        parse("bit_rate", fields[2])?,
    ))
}

pub fn parse_duration(text: &str) -> Result<f64, ProbeError> {
    let value = text.trim();
    match value.parse::<f64>() {
        Ok(duration) if duration.is_finite() && duration >= 0.0 => Ok(duration),
        _ => Err(ProbeError::Parse {
            field: "duration",
            value: value.to_string(),
        }),
    }
}
