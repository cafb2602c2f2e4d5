//! Discovery and ownership of every task in a run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::PipelineConfig;
use crate::error::DiscoveryError;
use crate::task::{Task, TaskStatus};
use crate::toolchain::Toolchain;

pub type SharedTask = Arc<Mutex<Task>>;

const ARTIFACT_EXT: &str = "far";
const PROBE_CONCURRENCY: usize = 16;

/// A source file and the artifact it should produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub source: PathBuf,
    pub artifact: PathBuf,
}

/// Initial queue contents for both stages, largest sources first.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Seeds {
    pub compress: Vec<usize>,
    pub fingerprint: Vec<usize>,
}

/// Owns every task of the run; schedulers refer to entries by index.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<SharedTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|t| Arc::new(Mutex::new(t))).collect(),
        }
    }

    pub fn push(&mut self, task: Task) -> usize {
        self.tasks.push(Arc::new(Mutex::new(task)));
        self.tasks.len() - 1
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SharedTask> {
        self.tasks.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedTask> {
        self.tasks.iter()
    }

    /// Clone of the task at `index`, taken under its lock.
    pub async fn snapshot(&self, index: usize) -> Option<Task> {
        Some(self.tasks.get(index)?.lock().await.clone())
    }

    pub async fn status(&self, index: usize) -> Option<TaskStatus> {
        Some(self.tasks.get(index)?.lock().await.status)
    }

    /// Build the registry from a directory tree or a manifest file.
    pub async fn discover(
        input: &Path,
        output_dir: &Path,
        config: &PipelineConfig,
        tools: &dyn Toolchain,
    ) -> Result<Self, DiscoveryError> {
        let candidates = if input.is_file() {
            read_manifest(input, output_dir).await?
        } else if input.is_dir() {
            let input = input.to_path_buf();
            let output_dir = output_dir.to_path_buf();
            tokio::task::spawn_blocking(move || walk_sources(&input, &output_dir))
                .await
                .map_err(|e| DiscoveryError::Walk(e.to_string()))?
        } else {
            return Err(DiscoveryError::Input(input.to_path_buf()));
        };
        info!("Found {} candidate media files", candidates.len());

        for candidate in &candidates {
            if let Some(parent) = candidate.artifact.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| DiscoveryError::OutputDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let tasks: Vec<Task> = stream::iter(candidates)
            .map(|candidate| task_from_candidate(candidate, config, tools))
            .buffered(PROBE_CONCURRENCY)
            .filter_map(futures::future::ready)
            .collect()
            .await;

        Ok(Self::from_tasks(tasks))
    }

    /// Split probed tasks between the two stages and order each by size.
    pub async fn partition(&self, config: &PipelineConfig) -> Seeds {
        let mut compress = Vec::new();
        let mut fingerprint = Vec::new();

        for (index, shared) in self.tasks.iter().enumerate() {
            let mut task = shared.lock().await;
            if task.status != TaskStatus::Created {
                continue;
            }
            let (next, queue) = if config.needs_compression(task.width(), task.height()) {
                (TaskStatus::NeedCompress, &mut compress)
            } else {
                (TaskStatus::NoNeedCompress, &mut fingerprint)
            };
            if let Err(e) = task.advance(next) {
                warn!(source = %task.source.display(), "{e}");
                continue;
            }
            queue.push((index, task.source_size));
        }

        Seeds {
            compress: by_size_descending(compress),
            fingerprint: by_size_descending(fingerprint),
        }
    }
}

fn by_size_descending(mut entries: Vec<(usize, u64)>) -> Vec<usize> {
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries.into_iter().map(|(index, _)| index).collect()
}

async fn task_from_candidate(
    candidate: Candidate,
    config: &PipelineConfig,
    tools: &dyn Toolchain,
) -> Option<Task> {
    let Candidate { source, artifact } = candidate;
    let metadata = match tokio::fs::metadata(&source).await {
        Ok(md) if md.is_file() => md,
        _ => {
            warn!(source = %source.display(), "source does not exist, skipping");
            return None;
        }
    };
    if !config.fingerprint_rebuild && tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
        info!(
            source = %source.display(),
            artifact = %artifact.display(),
            "artifact already exists, skipping"
        );
        return None;
    }

    let mut task = Task::new(source, artifact, metadata.len());
    match tools.probe(&task.source).await {
        Ok(media) => {
            debug!(source = %task.source.display(), ?media, "task added");
            task.media = Some(media);
        }
        Err(e) => {
            warn!(source = %task.source.display(), "failed to probe media: {e}");
            task.status = TaskStatus::ParseError;
        }
    }
    Some(task)
}

/// Recursively list sources under `media_dir`, mirroring the tree under `output_dir`.
pub fn walk_sources(media_dir: &Path, output_dir: &Path) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for entry in WalkDir::new(media_dir).follow_links(true).sort_by_file_name() {
        let Ok(entry) = entry else {
            warn!("skipping entry: {entry:?}");
            continue;
        };
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if path.extension().is_some_and(|ext| ext == ARTIFACT_EXT) {
            debug!("skipping artifact '{}'", path.display());
            continue;
        }
        let Ok(relative) = path.strip_prefix(media_dir) else {
            continue;
        };
        let artifact = output_dir.join(relative).with_extension(ARTIFACT_EXT);
        candidates.push(Candidate {
            source: path.to_path_buf(),
            artifact,
        });
    }
    candidates
}

/// Read one source path per line; artifacts are numbered by line.
pub async fn read_manifest(
    manifest: &Path,
    output_dir: &Path,
) -> Result<Vec<Candidate>, DiscoveryError> {
    let contents = tokio::fs::read_to_string(manifest)
        .await
        .map_err(|source| DiscoveryError::Manifest {
            path: manifest.to_path_buf(),
            source,
        })?;
    Ok(manifest_candidates(&contents, output_dir))
}

fn manifest_candidates(contents: &str, output_dir: &Path) -> Vec<Candidate> {
    contents
        .lines()
        .enumerate()
        .filter_map(|(line, raw)| {
            let raw = raw.trim();
            if raw.is_empty() {
                return None;
            }
            let source = PathBuf::from(raw);
            let stem = source.file_stem()?.to_string_lossy().into_owned();
            let artifact = output_dir.join(format!("{}-{stem}.{ARTIFACT_EXT}", line + 1));
            Some(Candidate { source, artifact })
        })
        .collect()
}
