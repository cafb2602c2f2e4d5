//! Fingerprint generation stage: one pool, fixed size, terminal.

use std::sync::Arc;

use chrono::Local;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::registry::{SharedTask, TaskRegistry};
use crate::stage::{self, StageQueues};
use crate::task::TaskStatus;
use crate::toolchain::{display_command, Toolchain};

pub struct FingerprintScheduler {
    config: Arc<PipelineConfig>,
    tools: Arc<dyn Toolchain>,
    queues: StageQueues,
}

impl FingerprintScheduler {
    pub fn new(
        config: Arc<PipelineConfig>,
        tools: Arc<dyn Toolchain>,
        seeds: Vec<usize>,
    ) -> Self {
        Self {
            config,
            tools,
            queues: StageQueues::seeded(seeds),
        }
    }

    pub fn queues(&self) -> &StageQueues {
        &self.queues
    }

    pub fn is_idle(&self) -> bool {
        self.queues.is_idle()
    }

    /// Queue a task that finished compression.
    pub fn enqueue(&mut self, index: usize) {
        self.queues.enqueue(index);
    }

    pub async fn tick(&mut self, registry: &TaskRegistry) {
        self.queues
            .reclaim(registry, TaskStatus::DnagenDone, TaskStatus::DnagenError)
            .await;

        while self.queues.in_flight() < self.config.workers {
            let Some(index) = self.queues.pop_wait() else {
                break;
            };
            let Some(shared) = registry.get(index) else {
                warn!(index, "fingerprint queue refers to an unknown task");
                self.queues.reject(index);
                continue;
            };

            {
                let mut task = shared.lock().await;
                if let Err(e) = task.advance(TaskStatus::NeedDnagen) {
                    warn!(source = %task.source.display(), "not fingerprinting: {e}");
                    task.status = TaskStatus::DnagenError;
                    self.queues.reject(index);
                    continue;
                }
            }
            debug!(index, "admitting fingerprint job");

            let handle = tokio::spawn(run_fingerprint(
                index,
                Arc::clone(shared),
                Arc::clone(&self.config),
                Arc::clone(&self.tools),
            ));
            self.queues.start(index, 0, handle);
        }
    }
}

#[tracing::instrument(skip_all, fields(index = index))]
async fn run_fingerprint(
    index: usize,
    shared: SharedTask,
    config: Arc<PipelineConfig>,
    tools: Arc<dyn Toolchain>,
) {
    let (compressed, original, artifact) = {
        let mut task = shared.lock().await;
        if let Err(e) = task.advance(TaskStatus::DnagenRunning) {
            warn!(source = %task.source.display(), "refusing to fingerprint: {e}");
            task.status = TaskStatus::DnagenError;
            return;
        }
        (
            task.compressed_path.clone(),
            task.source.clone(),
            task.artifact.clone(),
        )
    };

    // Prefer the compressed copy when the first stage produced one.
    let source = match compressed {
        Some(path) if stage::file_size(&path).await.is_some() => path,
        _ => original,
    };
    shared.lock().await.fingerprint.command =
        display_command(&tools.fingerprint_command(&source, &artifact));

    if config.fingerprint_rebuild && stage::file_size(&artifact).await.is_some() {
        debug!(artifact = %artifact.display(), "removing stale artifact");
        if let Err(e) = tokio::fs::remove_file(&artifact).await {
            warn!(artifact = %artifact.display(), "failed to remove stale artifact: {e}");
        }
    }

    let started_at = Local::now();
    let run = if stage::file_size(&artifact).await.is_none() {
        info!(source = %source.display(), "Generating fingerprint");
        Some(tools.fingerprint(&source, &artifact).await)
    } else {
        debug!(artifact = %artifact.display(), "artifact already present");
        None
    };
    let finished_at = Local::now();
    let artifact_size = stage::file_size(&artifact).await;

    let mut task = shared.lock().await;
    task.fingerprint.started_at = Some(started_at);
    task.fingerprint.finished_at = Some(finished_at);
    task.fingerprint.elapsed_secs = run.as_ref().map_or(Some(0), |r| r.elapsed_secs);
    task.artifact_size = artifact_size;

    let exited_ok = run.as_ref().map_or(true, |r| r.success());
    let next = if exited_ok && artifact_size.is_some() {
        TaskStatus::DnagenDone
    } else {
        TaskStatus::DnagenError
    };
    if let Err(e) = task.advance(next) {
        warn!("{e}");
        task.status = TaskStatus::DnagenError;
    }
}
