// Scripted stand-ins for ffmpeg, ffprobe and the embedding model.

use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::embedding::{EmbeddingError, EmbeddingVector, ImageEmbedder};
use crate::core::frame::{FALLBACK_HEIGHT, FALLBACK_WIDTH};
use crate::core::tool::{ToolCommand, ToolError, ToolOutput, ToolRunner};

/// How a fake video answers ffmpeg and ffprobe.
#[derive(Debug, Clone, Default)]
pub struct FakeVideo {
    /// Red channel of the decoded frame; `None` means ffmpeg cannot read the file.
    red: Option<u8>,
    /// Seek offsets that yield a frame. `None` means every offset does.
    offsets: Option<Vec<u64>>,
    empty_at: Vec<u64>,
    timeout_at: Vec<u64>,
    raw_only: bool,
    truncated_raw: bool,
    stream: Option<String>,
    duration: Option<String>,
    delay: Duration,
}

impl FakeVideo {
    pub fn frame(red: u8) -> Self {
        Self {
            red: Some(red),
            ..Self::default()
        }
    }

    pub fn unreadable() -> Self {
        Self::default()
    }

    pub fn only_at(mut self, offsets: &[u64]) -> Self {
        self.offsets = Some(offsets.to_vec());
        self
    }

    pub fn empty_at(mut self, offsets: &[u64]) -> Self {
        self.empty_at = offsets.to_vec();
        self
    }

    pub fn timing_out_at(mut self, offsets: &[u64]) -> Self {
        self.timeout_at = offsets.to_vec();
        self
    }

    pub fn only_raw(mut self) -> Self {
        self.raw_only = true;
        self
    }

    pub fn truncated_raw(mut self) -> Self {
        self.truncated_raw = true;
        self
    }

    pub fn probe(self, width: u64, height: u64, duration: f64, bit_rate: u64) -> Self {
        self.probe_output(&format!("{width},{height},{bit_rate}"), &format!("{duration:.6}"))
    }

    pub fn probe_output(mut self, stream: &str, duration: &str) -> Self {
        self.stream = Some(stream.to_string());
        self.duration = Some(duration.to_string());
        self
    }

    pub fn delayed(mut self, millis: u64) -> Self {
        self.delay = Duration::from_millis(millis);
        self
    }
}

/// [`ToolRunner`] that answers from a table of [`FakeVideo`]s keyed by file name and
/// records every command it receives.
#[derive(Default)]
pub struct FakeRunner {
    videos: HashMap<String, FakeVideo>,
    calls: Mutex<Vec<ToolCommand>>,
    cancel_on_probe: Option<Arc<AtomicBool>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video(mut self, file_name: &str, video: FakeVideo) -> Self {
        self.videos.insert(file_name.to_string(), video);
        self
    }

    /// Raise `token` as soon as the first probe arrives.
    pub fn cancelling_on_probe(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancel_on_probe = Some(token);
        self
    }

    pub fn ffmpeg_calls(&self) -> Vec<Vec<String>> {
        self.calls_to("ffmpeg")
    }

    pub fn ffprobe_calls(&self) -> Vec<Vec<String>> {
        self.calls_to("ffprobe")
    }

    fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| tool_name(c) == program)
            .map(|c| c.args.iter().map(|a| a.to_string_lossy().into_owned()).collect())
            .collect()
    }

    fn lookup(&self, path: Option<&Path>) -> Option<FakeVideo> {
        let name = path?.file_name()?.to_string_lossy().into_owned();
        self.videos.get(&name).cloned()
    }

    fn ffmpeg(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError> {
        let Some(video) = self.lookup(command.value_of("-i")) else {
            return Ok(failure("No such file or directory"));
        };
        let Some(red) = video.red else {
            return Ok(failure("Invalid data found when processing input"));
        };

        if command.has_arg("rawvideo") {
            let pixels = (FALLBACK_WIDTH * FALLBACK_HEIGHT) as usize;
            let pixels = if video.truncated_raw { pixels / 2 } else { pixels };
            let stdout = std::iter::repeat_n([red, 0, 0], pixels).flatten().collect();
            return Ok(ToolOutput {
                success: true,
                code: Some(0),
                stdout,
                stderr: Vec::new(),
            });
        }

        if video.raw_only {
            return Ok(failure("Could not find codec parameters"));
        }

        let offset = command
            .value_of("-ss")
            .map(|ts| seconds(&ts.to_string_lossy()))
            .unwrap_or(0);
        if video.timeout_at.contains(&offset) {
            return Err(ToolError::TimedOut {
                program: "ffmpeg".to_string(),
                timeout: command.timeout,
            });
        }
        if video.offsets.as_ref().is_some_and(|o| !o.contains(&offset)) {
            return Ok(success(Vec::new()));
        }

        let output = command.last_arg().ok_or_else(|| {
            ToolError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "no output"))
        })?;
        if video.empty_at.contains(&offset) {
            std::fs::write(output, [])?;
        } else {
            RgbImage::from_pixel(16, 16, Rgb([red, 0, 0]))
                .save_with_format(output, image::ImageFormat::Jpeg)
                .map_err(|e| ToolError::Io(std::io::Error::other(e)))?;
        }
        Ok(success(Vec::new()))
    }

    fn ffprobe(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError> {
        if let Some(token) = &self.cancel_on_probe {
            token.store(true, Ordering::SeqCst);
        }

        let Some(video) = self.lookup(command.last_arg()) else {
            return Ok(failure("No such file or directory"));
        };
        let answer = if command.has_arg("format=duration") {
            video.duration
        } else {
            video.stream
        };
        match answer {
            Some(text) => Ok(success(format!("{text}\n").into_bytes())),
            None => Ok(failure("Invalid data found when processing input")),
        }
    }

    fn delay_for(&self, command: &ToolCommand) -> Duration {
        self.lookup(command.value_of("-i").or(command.last_arg()))
            .map(|v| v.delay)
            .unwrap_or_default()
    }
}

impl ToolRunner for FakeRunner {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError> {
        self.calls.lock().unwrap().push(command.clone());

        let delay = self.delay_for(command);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match tool_name(command).as_str() {
            "ffprobe" => self.ffprobe(command),
            _ => self.ffmpeg(command),
        }
    }
}

fn tool_name(command: &ToolCommand) -> String {
    command
        .program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn success(stdout: Vec<u8>) -> ToolOutput {
    ToolOutput {
        success: true,
        code: Some(0),
        stdout,
        stderr: Vec::new(),
    }
}

fn failure(stderr: &str) -> ToolOutput {
    ToolOutput {
        success: false,
        code: Some(1),
        stdout: Vec::new(),
        stderr: format!("{stderr}\n").into_bytes(),
    }
}

fn seconds(timestamp: &str) -> u64 {
    timestamp
        .split(':')
        .filter_map(|part| part.parse::<u64>().ok())
        .fold(0, |acc, part| acc * 60 + part)
}

/// Solid image whose red channel identifies it to [`FakeEmbedder`].
pub fn solid_image(red: u8, width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([red, 0, 0])))
}

/// Embeds an image as the vector registered for the closest red value at its centre,
/// which tolerates JPEG round trips.
pub struct FakeEmbedder {
    vectors: Vec<(u8, EmbeddingVector)>,
    failing: Vec<u8>,
    delay: Duration,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl FakeEmbedder {
    pub fn new(vectors: Vec<(u8, EmbeddingVector)>) -> Self {
        Self {
            vectors,
            failing: Vec::new(),
            delay: Duration::ZERO,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_on(mut self, reds: &[u8]) -> Self {
        self.failing = reds.to_vec();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Highest number of overlapping `embed` calls seen.
    pub fn max_active(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.max_active)
    }
}

impl ImageEmbedder for FakeEmbedder {
    fn embed(&mut self, image: &DynamicImage) -> Result<EmbeddingVector, EmbeddingError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let (w, h) = image.dimensions();
        let red = image.get_pixel(w / 2, h / 2)[0];
        let result = match self
            .vectors
            .iter()
            .min_by_key(|(key, _)| (*key as i16 - red as i16).abs())
        {
            Some((key, _)) if self.failing.contains(key) => {
                Err(EmbeddingError::Worker(format!("inference failed for red={key}")))
            }
            Some((_, vector)) => Ok(vector.clone()),
            None => Err(EmbeddingError::EmptyOutput),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
