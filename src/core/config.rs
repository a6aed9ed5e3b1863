use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::duplicate::GroupingStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No source directories configured")]
    NoSources,

    #[error("Source directory does not exist: {path}")]
    MissingSource { path: String },

    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    #[error("Quarantine directory could not be created at {path}: {source}")]
    Quarantine {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Frame directory could not be created at {path}: {source}")]
    FrameDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Similarity threshold must be within [-1, 1], got {0}")]
    Threshold(f32),

    #[error("Extension allow-list is empty")]
    NoExtensions,

    #[error("Worker count must be at least 1")]
    NoWorkers,

    #[error("{0} must be at least 1 second")]
    ZeroTimeout(&'static str),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Embedding model could not be loaded: {0}")]
    Model(String),
}

/// Everything a deduplication run needs to know. Loadable from JSON; every field has a
/// default so partial files are fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source_dirs: Vec<PathBuf>,
    pub quarantine_dir: PathBuf,
    pub model_path: PathBuf,
    pub similarity_threshold: f32,
    pub keep_best: bool,
    pub extensions: Vec<String>,
    pub frame_dir: PathBuf,
    pub keep_frames: bool,
    pub workers: usize,
    pub grouping: GroupingStrategy,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub extraction_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dirs: Vec::new(),
            quarantine_dir: PathBuf::from("vid-duplicated"),
            model_path: default_model_path(),
            similarity_threshold: 0.95,
            keep_best: true,
            extensions: vec!["mp4".to_string(), "ts".to_string()],
            frame_dir: default_frame_dir(),
            keep_frames: false,
            workers: num_cpus::get(),
            grouping: GroupingStrategy::Greedy,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            extraction_timeout_secs: 10,
            probe_timeout_secs: 30,
        }
    }
}

fn default_model_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vidcull")
        .join("models")
        .join("clip-vit-b32-visual.onnx")
}

fn default_frame_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vidcull")
        .join("frames")
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Check the configuration before any processing begins. Creates the quarantine
    /// directory when relocation is enabled, and the frame directory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_dirs.is_empty() {
            return Err(ConfigError::NoSources);
        }

        for dir in &self.source_dirs {
            if !dir.exists() {
                return Err(ConfigError::MissingSource {
                    path: dir.display().to_string(),
                });
            }
            if !dir.is_dir() {
                return Err(ConfigError::NotADirectory {
                    path: dir.display().to_string(),
                });
            }
        }

        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Threshold(self.similarity_threshold));
        }

        if self.extensions.iter().all(|ext| ext.trim().is_empty()) {
            return Err(ConfigError::NoExtensions);
        }

        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        if self.extraction_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("extraction_timeout_secs"));
        }
        if self.probe_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("probe_timeout_secs"));
        }

        if self.keep_best {
            fs::create_dir_all(&self.quarantine_dir).map_err(|source| {
                ConfigError::Quarantine {
                    path: self.quarantine_dir.display().to_string(),
                    source,
                }
            })?;
            if !self.quarantine_dir.is_dir() {
                return Err(ConfigError::NotADirectory {
                    path: self.quarantine_dir.display().to_string(),
                });
            }
        }

        fs::create_dir_all(&self.frame_dir).map_err(|source| ConfigError::FrameDir {
            path: self.frame_dir.display().to_string(),
            source,
        })?;

        Ok(())
    }

    /// Lower-cased extensions without a leading dot.
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect()
    }
}
