//! Helpers for exercising the schedulers without the real binaries.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProbeError;
use crate::probe::MediaInfo;
use crate::task::Task;
use crate::toolchain::{display_command, CompressJob, ToolRun, Toolchain};

/// Initialize tracing for tests.
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A probed task whose source file exists under `dir`.
pub fn probed_task(dir: &Path, name: &str, size: u64, width: i64, height: i64) -> Task {
    let source = dir.join(format!("{name}.mp4"));
    let artifact = dir.join("far").join(format!("{name}.far"));
    std::fs::create_dir_all(dir.join("far")).ok();
    std::fs::write(&source, name.as_bytes()).ok();

    let mut task = Task::new(source, artifact, size);
    task.media = Some(MediaInfo {
        duration_secs: Some(60),
        width,
        height,
        codec: "h264".to_string(),
    });
    task
}

/// Stands in for ffprobe, ffmpeg and VDNAGen.
///
/// Successful runs write a small output file; failing sources exit 1 and
/// write nothing. Probes answer from a fixed table.
#[derive(Debug, Default)]
pub struct FakeToolchain {
    delay: Duration,
    probes: Vec<(PathBuf, MediaInfo)>,
    failing_compression: HashSet<PathBuf>,
    panicking_compression: HashSet<PathBuf>,
    failing_fingerprint: HashSet<PathBuf>,
    compressed: Mutex<Vec<PathBuf>>,
    fingerprinted: Mutex<Vec<PathBuf>>,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_probe(mut self, path: &Path, width: i64, height: i64) -> Self {
        self.probes.push((
            path.to_path_buf(),
            MediaInfo {
                duration_secs: Some(60),
                width,
                height,
                codec: "h264".to_string(),
            },
        ));
        self
    }

    pub fn failing_compression(mut self, source: &Path) -> Self {
        self.failing_compression.insert(source.to_path_buf());
        self
    }

    /// Compression of `source` panics inside the worker.
    pub fn panicking_compression(mut self, source: &Path) -> Self {
        self.panicking_compression.insert(source.to_path_buf());
        self
    }

    pub fn failing_fingerprint(mut self, source: &Path) -> Self {
        self.failing_fingerprint.insert(source.to_path_buf());
        self
    }

    /// Sources compression was invoked on, in call order.
    pub fn compressed(&self) -> Vec<PathBuf> {
        self.compressed.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Sources fingerprinting was invoked on, in call order.
    pub fn fingerprinted(&self) -> Vec<PathBuf> {
        self.fingerprinted.lock().map(|v| v.clone()).unwrap_or_default()
    }

    async fn produce(&self, fails: bool, output: &Path, command: String) -> ToolRun {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if fails {
            return ToolRun {
                exit_code: Some(1),
                elapsed_secs: Some(0),
                command,
            };
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let written = tokio::fs::write(output, b"output").await.is_ok();
        ToolRun {
            exit_code: Some(if written { 0 } else { 1 }),
            elapsed_secs: Some(self.delay.as_secs()),
            command,
        }
    }
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        self.probes
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, info)| info.clone())
            .ok_or(ProbeError::NoPayload)
    }

    fn compress_command(&self, job: &CompressJob) -> Vec<String> {
        vec![
            "fake-ffmpeg".to_string(),
            job.device.to_string(),
            job.source.to_string_lossy().into_owned(),
            job.output.to_string_lossy().into_owned(),
        ]
    }

    async fn compress(&self, job: &CompressJob) -> ToolRun {
        if let Ok(mut calls) = self.compressed.lock() {
            calls.push(job.source.clone());
        }
        if self.panicking_compression.contains(&job.source) {
            panic!("compressor crashed on {}", job.source.display());
        }
        let fails = self.failing_compression.contains(&job.source);
        self.produce(fails, &job.output, display_command(&self.compress_command(job)))
            .await
    }

    fn fingerprint_command(&self, source: &Path, artifact: &Path) -> Vec<String> {
        vec![
            "fake-vdnagen".to_string(),
            source.to_string_lossy().into_owned(),
            artifact.to_string_lossy().into_owned(),
        ]
    }

    async fn fingerprint(&self, source: &Path, artifact: &Path) -> ToolRun {
        if let Ok(mut calls) = self.fingerprinted.lock() {
            calls.push(source.to_path_buf());
        }
        // A compressed copy counts as its original for failure injection.
        let fails = self.failing_fingerprint.contains(source)
            || self
                .failing_fingerprint
                .iter()
                .any(|f| f.file_name() == source.file_name());
        let command = display_command(&self.fingerprint_command(source, artifact));
        self.produce(fails, artifact, command).await
    }
}
