use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use crate::core::config::{Config, ConfigError};
use crate::core::duplicate::{DuplicateDetector, DuplicateGroup};
use crate::core::embedding::{EmbeddingError, EmbeddingGenerator, EmbeddingVector};
use crate::core::frame::FrameExtractor;
use crate::core::history::History;
use crate::core::quality::QualityScorer;
use crate::core::report::ReportRow;
use crate::core::resolver::{DuplicateResolver, Relocation, ResolvedGroup};
use crate::core::scanner::{ScanError, VideoFile, VideoScanner};
use crate::core::tool::ToolRunner;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Discovery failed: {0}")]
    Scan(ScanError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProgress {
    pub processed: usize,
    pub total: usize,
    pub current_file: String,
    pub phase: RunPhase,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunPhase {
    Discovery,
    Embedding,
    Grouping,
    Resolving,
    Complete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureStage {
    Extraction,
    Embedding,
    Probe,
    Move,
}

/// A video that dropped out of (or was left alone by) the run, and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoFailure {
    pub path: PathBuf,
    pub stage: FailureStage,
    pub reason: String,
}

/// A duplicate group and, once the resolver reached it, what was done with it.
#[derive(Debug)]
pub struct GroupOutcome {
    pub group: DuplicateGroup,
    pub resolution: Option<ResolvedGroup>,
}

impl GroupOutcome {
    pub fn keeper(&self) -> Option<&Path> {
        self.resolution
            .as_ref()
            .and_then(|r| r.keeper.as_deref())
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub discovered: usize,
    /// Videos that produced an embedding, in enumeration order.
    pub embedded: Vec<PathBuf>,
    /// Groups with more than one member, in grouping order.
    pub groups: Vec<GroupOutcome>,
    pub failures: Vec<VideoFailure>,
    /// False when moves were only planned.
    pub relocated: bool,
    /// False when the run was cancelled before it finished.
    pub completed: bool,
}

impl RunReport {
    pub fn moved(&self) -> impl Iterator<Item = &Relocation> {
        self.groups
            .iter()
            .filter_map(|g| g.resolution.as_ref())
            .flat_map(|r| r.relocations.iter())
    }

    pub fn move_count(&self) -> usize {
        self.moved().count()
    }

    pub fn failure_count(&self, stage: FailureStage) -> usize {
        self.failures.iter().filter(|f| f.stage == stage).count()
    }

    pub fn report_rows(&self) -> impl Iterator<Item = ReportRow<'_>> {
        self.groups.iter().enumerate().map(|(i, g)| ReportRow {
            group: i + 1,
            keeper: g.keeper(),
            members: &g.group.members,
        })
    }
}

enum VideoOutcome {
    Embedded(EmbeddingVector),
    Failed(FailureStage, String),
    Skipped,
}

/// Runs discovery, embedding, grouping and resolution over the configured directories.
pub struct Deduplicator<R: ToolRunner> {
    config: Config,
    runner: Arc<R>,
    generator: Arc<EmbeddingGenerator>,
    progress_sender: Option<mpsc::UnboundedSender<RunProgress>>,
    cancellation_token: Arc<AtomicBool>,
}

impl<R: ToolRunner> Deduplicator<R> {
    pub fn new(config: Config, runner: Arc<R>, generator: Arc<EmbeddingGenerator>) -> Self {
        Self {
            config,
            runner,
            generator,
            progress_sender: None,
            cancellation_token: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_progress_sender(mut self, sender: mpsc::UnboundedSender<RunProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn get_cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    pub async fn run(&self) -> Result<RunReport, RunError> {
        self.config.validate()?;

        let mut report = RunReport {
            relocated: self.config.keep_best,
            ..RunReport::default()
        };

        let scanner = VideoScanner::new(&self.config.normalized_extensions())
            .exclude(&self.config.quarantine_dir)
            .exclude(&self.config.frame_dir)
            .with_cancellation_token(self.cancellation_token.clone());
        let videos = match scanner.discover(&self.config.source_dirs) {
            Ok(videos) => videos,
            Err(ScanError::Cancelled) => return Ok(report),
            Err(e) => return Err(RunError::Scan(e)),
        };
        report.discovered = videos.len();
        self.send_progress(RunPhase::Discovery, videos.len(), videos.len(), "");

        let embeddings = self.embed_all(&videos, &mut report).await;
        if self.is_cancelled() {
            log::info!("Run cancelled during embedding");
            return Ok(report);
        }

        self.send_progress(RunPhase::Grouping, 0, embeddings.len(), "");
        let groups = DuplicateDetector::new(self.config.similarity_threshold)
            .with_strategy(self.config.grouping)
            .group(&embeddings);
        report.groups = groups
            .into_iter()
            .filter(DuplicateGroup::is_duplicate)
            .map(|group| GroupOutcome {
                group,
                resolution: None,
            })
            .collect();
        log::info!(
            "{} duplicate group(s) among {} embedded video(s)",
            report.groups.len(),
            embeddings.len()
        );

        if self.resolve_all(&mut report).await {
            report.completed = true;
            self.send_progress(RunPhase::Complete, report.discovered, report.discovered, "");
        }
        Ok(report)
    }

    /// Extract and embed every video on a bounded pool. Returns `(path, vector)` pairs in
    /// enumeration order no matter which task finishes first.
    async fn embed_all(
        &self,
        videos: &[VideoFile],
        report: &mut RunReport,
    ) -> Vec<(PathBuf, EmbeddingVector)> {
        let total = videos.len();
        let extractor = Arc::new(FrameExtractor::new(
            self.runner.clone(),
            &self.config.ffmpeg_path,
            self.config.extraction_timeout(),
        ));
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();

        for (index, video) in videos.iter().enumerate() {
            let extractor = extractor.clone();
            let generator = self.generator.clone();
            let semaphore = semaphore.clone();
            let token = self.cancellation_token.clone();
            let video_path = video.path.clone();
            let frame_path =
                FrameExtractor::<R>::frame_path(&self.config.frame_dir, &video.path);
            let keep_frame = self.config.keep_frames;

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, VideoOutcome::Skipped);
                };
                let outcome = process_video(
                    &extractor,
                    generator,
                    &token,
                    &video_path,
                    &frame_path,
                    keep_frame,
                )
                .await;
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<VideoOutcome>> = (0..total).map(|_| None).collect();
        let mut processed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    processed += 1;
                    self.send_progress(
                        RunPhase::Embedding,
                        processed,
                        total,
                        &videos[index].file_name(),
                    );
                    slots[index] = Some(outcome);
                }
                Err(e) => log::error!("Video worker failed: {}", e),
            }
        }

        let mut embeddings = Vec::with_capacity(total);
        for (video, slot) in videos.iter().zip(slots) {
            match slot {
                Some(VideoOutcome::Embedded(vector)) => {
                    report.embedded.push(video.path.clone());
                    embeddings.push((video.path.clone(), vector));
                }
                Some(VideoOutcome::Failed(stage, reason)) => report.failures.push(VideoFailure {
                    path: video.path.clone(),
                    stage,
                    reason,
                }),
                Some(VideoOutcome::Skipped) => {}
                None => report.failures.push(VideoFailure {
                    path: video.path.clone(),
                    stage: FailureStage::Embedding,
                    reason: "worker task aborted".to_string(),
                }),
            }
        }
        embeddings
    }

    /// Returns false when cancelled before every group was handled.
    async fn resolve_all(&self, report: &mut RunReport) -> bool {
        let scorer = QualityScorer::new(
            self.runner.clone(),
            &self.config.ffprobe_path,
            self.config.probe_timeout(),
        );
        let mut resolver = DuplicateResolver::new(scorer, &self.config.quarantine_dir)
            .relocating(self.config.keep_best);
        if self.config.keep_best {
            resolver = resolver.with_history(History::new(&self.config.quarantine_dir));
        }

        let total = report.groups.len();
        for i in 0..total {
            if self.is_cancelled() {
                log::info!("Run cancelled after resolving {} of {} group(s)", i, total);
                return false;
            }

            let outcome = &mut report.groups[i];
            let resolved = resolver.resolve_group(&outcome.group).await;

            for member in &resolved.ranked {
                if let Some(reason) = &member.probe_error {
                    report.failures.push(VideoFailure {
                        path: member.path.clone(),
                        stage: FailureStage::Probe,
                        reason: reason.clone(),
                    });
                }
            }
            for failure in &resolved.failures {
                report.failures.push(VideoFailure {
                    path: failure.path.clone(),
                    stage: FailureStage::Move,
                    reason: failure.error.to_string(),
                });
            }

            let current = outcome.group.representative().display().to_string();
            outcome.resolution = Some(resolved);
            self.send_progress(RunPhase::Resolving, i + 1, total, &current);
        }
        true
    }

    fn send_progress(&self, phase: RunPhase, processed: usize, total: usize, current_file: &str) {
        if let Some(sender) = &self.progress_sender {
            let _ = sender.send(RunProgress {
                processed,
                total,
                current_file: current_file.to_string(),
                phase,
            });
        }
    }
}

async fn process_video<R: ToolRunner>(
    extractor: &FrameExtractor<R>,
    generator: Arc<EmbeddingGenerator>,
    token: &AtomicBool,
    video: &Path,
    frame_path: &Path,
    keep_frame: bool,
) -> VideoOutcome {
    if token.load(Ordering::Relaxed) {
        return VideoOutcome::Skipped;
    }

    let frame = match extractor.extract(video, frame_path).await {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("{}", e);
            return VideoOutcome::Failed(FailureStage::Extraction, e.to_string());
        }
    };

    let outcome = if token.load(Ordering::Relaxed) {
        VideoOutcome::Skipped
    } else {
        let image_path = frame.path.clone();
        let embedded = tokio::task::spawn_blocking(move || generator.embed_file(&image_path))
            .await
            .unwrap_or_else(|e| Err(EmbeddingError::Worker(e.to_string())));
        match embedded {
            Ok(vector) => VideoOutcome::Embedded(vector),
            Err(e) => {
                log::warn!("Failed to embed {}: {}", video.display(), e);
                VideoOutcome::Failed(FailureStage::Embedding, e.to_string())
            }
        }
    };

    if !keep_frame {
        if let Err(e) = fs::remove_file(&frame.path) {
            log::debug!("Could not remove frame {}: {}", frame.path.display(), e);
        }
    }
    outcome
}
