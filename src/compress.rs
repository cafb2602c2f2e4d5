//! Device-bounded compression stage.
//!
//! Each configured device (the CPU, or a GPU by index) runs at most its
//! configured number of jobs. Every tick the scheduler reclaims finished jobs,
//! hands the successful ones to the fingerprint stage, and fills free device
//! capacity from its wait queue in FIFO order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use md5::{Digest, Md5};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::fingerprint::FingerprintScheduler;
use crate::registry::{SharedTask, TaskRegistry};
use crate::stage::{self, StageQueues};
use crate::task::{Device, TaskStatus};
use crate::toolchain::{display_command, CompressJob, Toolchain};

pub struct CompressionScheduler {
    config: Arc<PipelineConfig>,
    tools: Arc<dyn Toolchain>,
    queues: StageQueues,
}

impl CompressionScheduler {
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

    /// Jobs currently running on the device at `slot` in the device list.
    pub fn in_flight_on(&self, slot: usize) -> usize {
        self.queues.in_flight_on(slot)
    }

    /// Capacity still free on each configured device.
    fn remaining_capacity(&self) -> Vec<usize> {
        self.config
            .devices
            .iter()
            .enumerate()
            .map(|(slot, spec)| spec.capacity.saturating_sub(self.queues.in_flight_on(slot)))
            .collect()
    }

    /// One driver tick: reclaim, hand off, admit.
    pub async fn tick(&mut self, registry: &TaskRegistry, downstream: &mut FingerprintScheduler) {
        let done = self
            .queues
            .reclaim(registry, TaskStatus::CompressDone, TaskStatus::CompressError)
            .await;
        for index in done {
            downstream.enqueue(index);
        }

        let mut remaining = self.remaining_capacity();
        let budget: usize = remaining.iter().sum();

        for _ in 0..budget {
            let Some(slot) = remaining.iter().position(|&free| free > 0) else {
                break;
            };
            let Some(index) = self.queues.pop_wait() else {
                break;
            };
            let Some(shared) = registry.get(index) else {
                warn!(index, "compression queue refers to an unknown task");
                self.queues.reject(index);
                continue;
            };
            remaining[slot] -= 1;

            let device = self.config.devices[slot].device;
            shared.lock().await.device = Some(device);
            debug!(index, %device, "admitting compression job");

            let handle = tokio::spawn(run_compression(
                index,
                Arc::clone(shared),
                device,
                Arc::clone(&self.config),
                Arc::clone(&self.tools),
            ));
            self.queues.start(index, slot, handle);
        }
    }
}

/// Where the compressed copy of `source` lives: one directory per source,
/// keyed by the MD5 of its path.
pub fn compressed_output_path(cache: &Path, source: &Path) -> PathBuf {
    let digest = Md5::digest(source.to_string_lossy().as_bytes());
    let name = source.file_name().map(PathBuf::from).unwrap_or_default();
    cache.join(hex::encode(digest)).join(name)
}

#[tracing::instrument(skip_all, fields(index = index, device = %device))]
async fn run_compression(
    index: usize,
    shared: SharedTask,
    device: Device,
    config: Arc<PipelineConfig>,
    tools: Arc<dyn Toolchain>,
) {
    let job = {
        let mut task = shared.lock().await;
        if let Err(e) = task.advance(TaskStatus::CompressRunning) {
            warn!(source = %task.source.display(), "refusing to compress: {e}");
            task.status = TaskStatus::CompressError;
            return;
        }
        let job = CompressJob {
            source: task.source.clone(),
            output: compressed_output_path(&config.compress_cache(), &task.source),
            device,
            codec: task.codec().to_string(),
        };
        task.compressed_path = Some(job.output.clone());
        task.compress.command = display_command(&tools.compress_command(&job));
        job
    };

    if let Some(parent) = job.output.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(dir = %parent.display(), "failed to create compression cache: {e}");
        }
    }
    if config.compress_rebuild && stage::file_size(&job.output).await.is_some() {
        debug!(output = %job.output.display(), "removing stale compressed output");
        if let Err(e) = tokio::fs::remove_file(&job.output).await {
            warn!(output = %job.output.display(), "failed to remove stale output: {e}");
        }
    }

    let started_at = Local::now();
    let run = if stage::file_size(&job.output).await.is_none() {
        info!(source = %job.source.display(), "Compressing");
        Some(tools.compress(&job).await)
    } else {
        debug!(output = %job.output.display(), "compressed output already present");
        None
    };
    let finished_at = Local::now();
    let output_size = stage::file_size(&job.output).await;

    let mut task = shared.lock().await;
    task.compress.started_at = Some(started_at);
    task.compress.finished_at = Some(finished_at);
    task.compress.elapsed_secs = run.as_ref().map_or(Some(0), |r| r.elapsed_secs);
    task.compressed_size = output_size;

    let exited_ok = run.as_ref().map_or(true, |r| r.success());
    let next = if exited_ok && output_size.is_some() {
        TaskStatus::CompressDone
    } else {
        TaskStatus::CompressError
    };
    if let Err(e) = task.advance(next) {
        warn!("{e}");
        task.status = TaskStatus::CompressError;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSpec;
    use crate::test_utils::{probed_task, FakeToolchain};
    use std::time::Duration;

    fn config(cache: &Path, devices: Vec<DeviceSpec>) -> Arc<PipelineConfig> {
        Arc::new(
            PipelineConfig::new(cache)
                .with_devices(devices)
                .with_workers(4)
                .with_poll_interval(Duration::from_millis(5)),
        )
    }

    async fn seeded(registry: &TaskRegistry, config: &PipelineConfig) -> Vec<usize> {
        registry.partition(config).await.compress
    }

    #[test]
    fn compressed_output_is_keyed_by_source_digest() {
        let path = compressed_output_path(Path::new("/cache"), Path::new("/media/a.mp4"));
        assert_eq!(path.file_name().unwrap(), "a.mp4");
        let dir = path.parent().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(dir.len(), 32);
        assert_ne!(
            path,
            compressed_output_path(Path::new("/cache"), Path::new("/other/a.mp4"))
        );
    }

    #[tokio::test]
    async fn admission_respects_device_capacity_in_order() {
        let cache = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let config = config(
            cache.path(),
            vec![
                DeviceSpec { device: Device::Gpu(0), capacity: 1 },
                DeviceSpec { device: Device::Cpu, capacity: 2 },
            ],
        );
        let registry = TaskRegistry::from_tasks(
            (0..5).map(|i| probed_task(media.path(), &format!("clip{i}"), 100 - i, 3840, 2160)),
        );
        let seeds = seeded(&registry, &config).await;
        let tools = Arc::new(FakeToolchain::new().with_delay(Duration::from_millis(200)));
        let mut fingerprint = FingerprintScheduler::new(config.clone(), tools.clone(), Vec::new());
        let mut scheduler = CompressionScheduler::new(config.clone(), tools, seeds);

        scheduler.tick(&registry, &mut fingerprint).await;

        assert_eq!(scheduler.in_flight_on(0), 1);
        assert_eq!(scheduler.in_flight_on(1), 2);
        assert_eq!(scheduler.queues().wait().len(), 2);
        let running: Vec<usize> = scheduler.queues().running().map(|j| j.index).collect();
        assert_eq!(running, vec![0, 1, 2]);
        assert_eq!(registry.snapshot(0).await.unwrap().device, Some(Device::Gpu(0)));
        assert_eq!(registry.snapshot(1).await.unwrap().device, Some(Device::Cpu));

        // A second tick while everything is busy admits nothing.
        scheduler.tick(&registry, &mut fingerprint).await;
        assert_eq!(scheduler.queues().in_flight(), 3);
    }

    #[tokio::test]
    async fn successes_are_handed_to_fingerprinting_and_failures_are_not() {
        let cache = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let config = config(cache.path(), vec![DeviceSpec { device: Device::Cpu, capacity: 2 }]);
        let registry = TaskRegistry::from_tasks([
            probed_task(media.path(), "good", 500, 3840, 2160),
            probed_task(media.path(), "bad", 100, 3840, 2160),
        ]);
        let seeds = seeded(&registry, &config).await;
        let bad_source = registry.snapshot(1).await.unwrap().source;
        let tools = Arc::new(FakeToolchain::new().failing_compression(&bad_source));
        let mut fingerprint = FingerprintScheduler::new(config.clone(), tools.clone(), Vec::new());
        let mut scheduler = CompressionScheduler::new(config.clone(), tools, seeds);

        while !scheduler.is_idle() {
            scheduler.tick(&registry, &mut fingerprint).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(scheduler.queues().done(), &[0]);
        assert_eq!(scheduler.queues().error(), &[1]);
        assert_eq!(fingerprint.queues().wait().iter().copied().collect::<Vec<_>>(), vec![0]);
        let good = registry.snapshot(0).await.unwrap();
        assert_eq!(good.status, TaskStatus::CompressDone);
        assert!(good.compressed_size.is_some());
        assert_eq!(registry.status(1).await, Some(TaskStatus::CompressError));
    }

    #[tokio::test]
    async fn worker_refuses_tasks_in_the_wrong_state() {
        let cache = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let config = config(cache.path(), vec![DeviceSpec { device: Device::Cpu, capacity: 1 }]);
        let registry = TaskRegistry::from_tasks([probed_task(media.path(), "x", 1, 3840, 2160)]);
        let tools: Arc<dyn Toolchain> = Arc::new(FakeToolchain::new());

        // Never partitioned, so still `Created`.
        run_compression(0, Arc::clone(registry.get(0).unwrap()), Device::Cpu, config, tools).await;
        assert_eq!(registry.status(0).await, Some(TaskStatus::CompressError));
    }
}
