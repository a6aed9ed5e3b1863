use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// A discovered video, identified by its canonical path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoFile {
    pub path: PathBuf,
    pub size: u64,
    pub extension: String,
}

impl VideoFile {
    pub fn from_path(path: &Path) -> Result<Self, ScanError> {
        let path = fs::canonicalize(path)?;
        let metadata = fs::metadata(&path)?;
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        Ok(Self {
            path,
            size: metadata.len(),
            extension,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned()
    }
}

/// Recursive discovery of video files. Enumeration order is deterministic: source
/// directories in configured order, entries sorted by file name within each directory.
pub struct VideoScanner {
    extensions: HashSet<String>,
    excluded: Vec<PathBuf>,
    cancellation_token: Arc<AtomicBool>,
}

impl VideoScanner {
    pub fn new(extensions: &[String]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            excluded: Vec::new(),
            cancellation_token: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Never descend into `dir`. Used for the quarantine directory so relocated files
    /// are not picked up again on the next run.
    pub fn exclude(mut self, dir: &Path) -> Self {
        let dir = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        self.excluded.push(dir);
        self
    }

    pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn is_supported_format(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| self.extensions.contains(&ext.to_string_lossy().to_lowercase()))
            .unwrap_or(false)
    }

    pub fn discover(&self, roots: &[PathBuf]) -> Result<Vec<VideoFile>, ScanError> {
        let mut seen = HashSet::new();
        let mut videos = Vec::new();

        for root in roots {
            if self.cancellation_token.load(Ordering::Relaxed) {
                return Err(ScanError::Cancelled);
            }

            if !root.is_dir() {
                return Err(ScanError::InvalidPath {
                    path: root.to_string_lossy().to_string(),
                });
            }
            let root = fs::canonicalize(root)?;

            let walker = WalkDir::new(&root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| !self.is_excluded(entry.path()));

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                        continue;
                    }
                };

                if !entry.file_type().is_file() || !self.is_supported_format(entry.path()) {
                    continue;
                }

                match VideoFile::from_path(entry.path()) {
                    Ok(video) => {
                        if seen.insert(video.path.clone()) {
                            videos.push(video);
                        }
                    }
                    Err(e) => {
                        log::warn!("Failed to read {}: {}", entry.path().display(), e);
                    }
                }
            }
        }

        log::info!("Discovered {} video(s) in {} source dir(s)", videos.len(), roots.len());
        Ok(videos)
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.excluded.iter().any(|dir| path.starts_with(dir))
    }
}
