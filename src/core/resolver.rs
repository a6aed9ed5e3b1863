use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::duplicate::DuplicateGroup;
use crate::core::history::{History, HistoryRecord};
use crate::core::quality::QualityScorer;
use crate::core::tool::ToolRunner;

#[derive(Debug, Error)]
pub enum MoveError {
    #[error("Destination already exists: {}", .path.display())]
    DestinationExists { path: PathBuf },

    #[error("Source no longer exists: {}", .path.display())]
    SourceMissing { path: PathBuf },

    #[error("Path has no file name: {}", .path.display())]
    NoFileName { path: PathBuf },

    #[error("Failed to move {} to {}: {source}", .from.display(), .to.display())]
    Io {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Move `from` to `to` without ever replacing an existing file. Falls back to copy and
/// remove when the two paths are on different filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<(), MoveError> {
    if !from.exists() {
        return Err(MoveError::SourceMissing {
            path: from.to_path_buf(),
        });
    }
    if to.exists() {
        return Err(MoveError::DestinationExists {
            path: to.to_path_buf(),
        });
    }

    let io_error = |source: std::io::Error| MoveError::Io {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            log::debug!("{} is on another device, copying", to.display());
            fs::copy(from, to).map_err(io_error)?;
            fs::remove_file(from).map_err(io_error)
        }
        Err(e) => Err(io_error(e)),
    }
}

/// One member of a group with its rank inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMember {
    pub path: PathBuf,
    pub score: f64,
    /// Why metadata could not be read; such a member scores 0.
    pub probe_error: Option<String>,
}

impl ScoredMember {
    pub fn probed(&self) -> bool {
        self.probe_error.is_none()
    }
}

/// A file that left (or would leave) its source directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relocation {
    pub from: PathBuf,
    pub to: PathBuf,
    pub score: f64,
}

#[derive(Debug)]
pub struct MoveFailure {
    pub path: PathBuf,
    pub error: MoveError,
}

/// What happened to one duplicate group.
#[derive(Debug, Default)]
pub struct ResolvedGroup {
    /// Members ranked best first.
    pub ranked: Vec<ScoredMember>,
    /// `None` when no member could be probed; nothing is moved then.
    pub keeper: Option<PathBuf>,
    /// Performed moves, or planned ones when relocation is off.
    pub relocations: Vec<Relocation>,
    pub failures: Vec<MoveFailure>,
}

impl ResolvedGroup {
    pub fn is_resolved(&self) -> bool {
        self.keeper.is_some()
    }
}

/// Keeps the best copy of each duplicate group and moves the rest into quarantine.
pub struct DuplicateResolver<R: ToolRunner> {
    scorer: QualityScorer<R>,
    quarantine_dir: PathBuf,
    relocate: bool,
    history: Option<History>,
}

impl<R: ToolRunner> DuplicateResolver<R> {
    pub fn new(scorer: QualityScorer<R>, quarantine_dir: impl Into<PathBuf>) -> Self {
        Self {
            scorer,
            quarantine_dir: quarantine_dir.into(),
            relocate: true,
            history: None,
        }
    }

    /// With `false`, groups are ranked and moves are planned but no file is touched.
    pub fn relocating(mut self, relocate: bool) -> Self {
        self.relocate = relocate;
        self
    }

    pub fn with_history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }

    /// Score every member, keep the best and move the others. Singleton groups come back
    /// untouched with their only member as keeper.
    pub async fn resolve_group(&self, group: &DuplicateGroup) -> ResolvedGroup {
        if !group.is_duplicate() {
            return ResolvedGroup {
                keeper: group.members.first().cloned(),
                ..ResolvedGroup::default()
            };
        }

        let mut ranked = Vec::with_capacity(group.len());
        for path in &group.members {
            let member = match self.scorer.probe(path).await {
                Ok(quality) => ScoredMember {
                    path: path.clone(),
                    score: quality.score(),
                    probe_error: None,
                },
                Err(e) => {
                    log::warn!("Failed to probe {}: {}", path.display(), e);
                    ScoredMember {
                        path: path.clone(),
                        score: 0.0,
                        probe_error: Some(e.to_string()),
                    }
                }
            };
            ranked.push(member);
        }
        rank(&mut ranked);

        if !ranked[0].probed() {
            log::warn!(
                "No member of the group led by {} could be probed; leaving it in place",
                group.representative().display()
            );
            return ResolvedGroup {
                ranked,
                ..ResolvedGroup::default()
            };
        }

        let keeper = ranked[0].path.clone();
        let mut resolved = ResolvedGroup {
            keeper: Some(keeper.clone()),
            ..ResolvedGroup::default()
        };

        for member in &ranked[1..] {
            let Some(file_name) = member.path.file_name() else {
                resolved.failures.push(MoveFailure {
                    path: member.path.clone(),
                    error: MoveError::NoFileName {
                        path: member.path.clone(),
                    },
                });
                continue;
            };
            let destination = self.quarantine_dir.join(file_name);

            if self.relocate {
                if let Err(error) = move_file(&member.path, &destination) {
                    log::warn!("{}", error);
                    resolved.failures.push(MoveFailure {
                        path: member.path.clone(),
                        error,
                    });
                    continue;
                }
                log::info!("Moved {} → {}", member.path.display(), destination.display());
            }

            resolved.relocations.push(Relocation {
                from: member.path.clone(),
                to: destination,
                score: member.score,
            });
        }

        if self.relocate && !resolved.relocations.is_empty() {
            if let Some(history) = &self.history {
                let record = HistoryRecord::new(&keeper, &resolved.relocations);
                if let Err(e) = history.append(&record) {
                    log::warn!("Failed to record history for {}: {}", keeper.display(), e);
                }
            }
        }

        resolved.ranked = ranked;
        resolved
    }
}

/// Probed members first, then score descending. Stable, so ties keep enumeration order.
fn rank(members: &mut [ScoredMember]) {
    members.sort_by(|a, b| {
        b.probed()
            .cmp(&a.probed())
            .then_with(|| b.score.total_cmp(&a.score))
    });
}
