//! Incremental progress logging and the end-of-run report.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytesize::ByteSize;
use chrono::{DateTime, Local};
use serde::Serialize;
use strum::Display;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::registry::TaskRegistry;
use crate::stage::StageQueues;
use crate::task::{StageRun, Task, TaskStatus};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Stage {
    #[strum(to_string = "compression")]
    Compression,
    #[strum(to_string = "fingerprint")]
    Fingerprint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Error,
}

/// One task newly observed in a stage's done or error list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportEvent {
    pub stage: Stage,
    pub outcome: Outcome,
    /// 1-based position in the list it was read from.
    pub ordinal: usize,
    pub index: usize,
}

impl ReportEvent {
    /// Whether the task will not move any further.
    pub fn is_final(&self) -> bool {
        self.stage == Stage::Fingerprint || self.outcome == Outcome::Error
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    done: usize,
    error: usize,
}

impl Cursor {
    fn advance(&mut self, stage: Stage, queues: &StageQueues) -> Vec<ReportEvent> {
        let mut events = Vec::new();
        for (ordinal, &index) in queues.done().iter().enumerate().skip(self.done) {
            events.push(ReportEvent {
                stage,
                outcome: Outcome::Done,
                ordinal: ordinal + 1,
                index,
            });
        }
        self.done = queues.done().len();
        for (ordinal, &index) in queues.error().iter().enumerate().skip(self.error) {
            events.push(ReportEvent {
                stage,
                outcome: Outcome::Error,
                ordinal: ordinal + 1,
                index,
            });
        }
        self.error = queues.error().len();
        events
    }
}

/// Files a run leaves behind: a current copy and a timestamped backup of each.
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub manifest: PathBuf,
    pub manifest_backup: PathBuf,
    pub table: PathBuf,
    pub table_backup: PathBuf,
}

impl ReportPaths {
    pub fn new(dir: &Path, prefix: &str) -> Self {
        let stamp = Local::now().format("%Y%m%d%H%M%S").to_string();
        let backup = dir.join("backup");
        let manifest = format!("{prefix}_path_report.txt");
        let table = format!("{prefix}_report.csv");
        Self {
            manifest: dir.join(&manifest),
            manifest_backup: backup.join(format!("{stamp}-{manifest}")),
            table: dir.join(&table),
            table_backup: backup.join(format!("{stamp}-{table}")),
        }
    }

    /// Create the directories and start a fresh manifest.
    pub async fn prepare(&self) -> Result<()> {
        for path in [&self.manifest, &self.manifest_backup, &self.table, &self.table_backup] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create report directory '{}'", parent.display()))?;
            }
        }
        if tokio::fs::try_exists(&self.manifest).await.unwrap_or(false) {
            tokio::fs::remove_file(&self.manifest)
                .await
                .with_context(|| format!("remove old manifest '{}'", self.manifest.display()))?;
        }
        Ok(())
    }

    async fn append_manifest(&self, artifact: &Path) -> Result<()> {
        let line = format!("{}\n", artifact.display());
        for path in [&self.manifest, &self.manifest_backup] {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("open manifest '{}'", path.display()))?;
            file.write_all(line.as_bytes())
                .await
                .with_context(|| format!("append to manifest '{}'", path.display()))?;
        }
        Ok(())
    }
}

/// Watches both stages and logs every finished task exactly once.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    compression: Cursor,
    fingerprint: Cursor,
    paths: Option<ReportPaths>,
}

impl ProgressReporter {
    pub fn new(paths: Option<ReportPaths>) -> Self {
        Self {
            paths,
            ..Default::default()
        }
    }

    pub fn paths(&self) -> Option<&ReportPaths> {
        self.paths.as_ref()
    }

    /// Log everything that finished since the last flush.
    pub async fn flush(
        &mut self,
        registry: &TaskRegistry,
        compression: &StageQueues,
        fingerprint: &StageQueues,
    ) -> Result<Vec<ReportEvent>> {
        let mut events = self.compression.advance(Stage::Compression, compression);
        events.extend(self.fingerprint.advance(Stage::Fingerprint, fingerprint));

        for event in &events {
            let Some(task) = registry.snapshot(event.index).await else {
                continue;
            };
            log_event(event, &task);
            if event.stage == Stage::Fingerprint && event.outcome == Outcome::Done {
                if let Some(paths) = &self.paths {
                    paths.append_manifest(&task.artifact).await?;
                }
            }
        }
        Ok(events)
    }

    /// Log one summary record per task and write the report table.
    pub async fn finish(&self, registry: &TaskRegistry) -> Result<Vec<ReportRow>> {
        let mut rows = Vec::with_capacity(registry.len());
        for shared in registry.iter() {
            let task = shared.lock().await;
            let row = ReportRow::from_task(&task);
            info!(
                source = %row.media_path,
                size = %row.media_size,
                status = %row.status,
                compress_secs = ?task.compress.elapsed_secs,
                fingerprint_secs = ?task.fingerprint.elapsed_secs,
                "task summary"
            );
            rows.push(row);
        }

        if let Some(paths) = &self.paths {
            write_table(&rows, &paths.table)?;
            write_table(&rows, &paths.table_backup)?;
            info!(report = %paths.table.display(), "report written");
        }
        Ok(rows)
    }
}

fn log_event(event: &ReportEvent, task: &Task) {
    let source = task.source.display();
    let size = ByteSize(task.source_size);
    let shape = task.shape();
    let codec = task.codec();
    let duration = task.duration_secs();
    let compressed = task
        .compressed_path
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let compressed_size = task.compressed_size.map(ByteSize);

    match (event.stage, event.outcome) {
        (Stage::Compression, outcome) => {
            let device = task.device.map(|d| d.to_string()).unwrap_or_else(|| "none".to_string());
            let run = &task.compress;
            if outcome == Outcome::Done {
                info!(
                    ordinal = event.ordinal, %source, %size, %shape, codec, ?duration,
                    %compressed, compressed_size = ?compressed_size,
                    command = %run.command,
                    started = %fmt_time(run.started_at),
                    finished = %fmt_time(run.finished_at),
                    elapsed_secs = ?run.elapsed_secs, %device,
                    "compression task succeeded"
                );
            } else {
                warn!(
                    ordinal = event.ordinal, %source, %size, %shape, codec, ?duration,
                    %compressed, compressed_size = ?compressed_size,
                    command = %run.command,
                    started = %fmt_time(run.started_at),
                    finished = %fmt_time(run.finished_at),
                    elapsed_secs = ?run.elapsed_secs, %device,
                    "compression task failed"
                );
            }
        }
        (Stage::Fingerprint, outcome) => {
            let run = &task.fingerprint;
            let artifact = task.artifact.display();
            let artifact_size = task.artifact_size.map(ByteSize);
            if outcome == Outcome::Done {
                info!(
                    ordinal = event.ordinal, %source, %size, %shape, codec, ?duration,
                    %compressed, compressed_size = ?compressed_size,
                    %artifact, artifact_size = ?artifact_size,
                    command = %run.command,
                    started = %fmt_time(run.started_at),
                    finished = %fmt_time(run.finished_at),
                    elapsed_secs = ?run.elapsed_secs,
                    "fingerprint task succeeded"
                );
            } else {
                warn!(
                    ordinal = event.ordinal, %source, %size, %shape, codec, ?duration,
                    %compressed, compressed_size = ?compressed_size,
                    %artifact, artifact_size = ?artifact_size,
                    command = %run.command,
                    started = %fmt_time(run.started_at),
                    finished = %fmt_time(run.finished_at),
                    elapsed_secs = ?run.elapsed_secs,
                    "fingerprint task failed"
                );
            }
        }
    }
}

fn fmt_time(time: Option<DateTime<Local>>) -> String {
    time.map(|t| t.format(TIME_FORMAT).to_string()).unwrap_or_default()
}

/// Final classification of a task in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum RunStatus {
    #[strum(to_string = "parse error")]
    #[serde(rename = "parse error")]
    ParseError,
    #[strum(to_string = "compression error")]
    #[serde(rename = "compression error")]
    CompressionError,
    #[strum(to_string = "fingerprint error")]
    #[serde(rename = "fingerprint error")]
    FingerprintError,
    #[strum(to_string = "success")]
    #[serde(rename = "success")]
    Success,
}

impl RunStatus {
    /// `None` for tasks that never reached a terminal state.
    pub fn of(status: TaskStatus) -> Option<Self> {
        match status {
            TaskStatus::Created | TaskStatus::ParseError => Some(Self::ParseError),
            TaskStatus::CompressError => Some(Self::CompressionError),
            TaskStatus::DnagenError => Some(Self::FingerprintError),
            TaskStatus::DnagenDone => Some(Self::Success),
            TaskStatus::NoNeedCompress
            | TaskStatus::NeedCompress
            | TaskStatus::CompressRunning
            | TaskStatus::CompressDone
            | TaskStatus::NeedDnagen
            | TaskStatus::DnagenRunning => None,
        }
    }
}

/// One line of the end-of-run table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub media_path: String,
    pub media_size: String,
    pub media_codec: String,
    pub media_shape: String,
    #[serde(rename = "media_duration(s)")]
    pub media_duration: Option<u64>,
    pub far_path: String,
    pub far_size: String,
    /// A [`RunStatus`] label, or the raw status of an unfinished task.
    pub status: String,
    pub compress_device: String,
    pub compress_path: String,
    pub compress_size: String,
    pub compress_start_time: String,
    pub compress_end_time: String,
    #[serde(rename = "compress_time_used(s)")]
    pub compress_time_used: Option<u64>,
    pub vdnagen_start_time: String,
    pub vdnagen_end_time: String,
    #[serde(rename = "vdnagen_time_used(s)")]
    pub vdnagen_time_used: Option<u64>,
}

impl ReportRow {
    pub fn from_task(task: &Task) -> Self {
        let status = RunStatus::of(task.status);
        let mut row = Self {
            media_path: task.source.display().to_string(),
            media_size: ByteSize(task.source_size).to_string(),
            media_codec: String::new(),
            media_shape: String::new(),
            media_duration: task.duration_secs(),
            far_path: task.artifact.display().to_string(),
            far_size: String::new(),
            status: status.map_or_else(|| task.status.to_string(), |s| s.to_string()),
            compress_device: String::new(),
            compress_path: String::new(),
            compress_size: String::new(),
            compress_start_time: String::new(),
            compress_end_time: String::new(),
            compress_time_used: None,
            vdnagen_start_time: String::new(),
            vdnagen_end_time: String::new(),
            vdnagen_time_used: None,
        };
        if status == Some(RunStatus::ParseError) {
            return row;
        }

        row.media_codec = task.codec().to_string();
        row.media_shape = task.shape();

        if let Some(device) = task.device {
            row.compress_device = device.to_string();
            row.compress_path = task
                .compressed_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            row.compress_size = task
                .compressed_size
                .map(|s| ByteSize(s).to_string())
                .unwrap_or_default();
            fill_times(&task.compress, &mut row.compress_start_time, &mut row.compress_end_time);
            row.compress_time_used = task.compress.elapsed_secs;
            if status == Some(RunStatus::CompressionError) {
                return row;
            }
        }

        fill_times(&task.fingerprint, &mut row.vdnagen_start_time, &mut row.vdnagen_end_time);
        row.vdnagen_time_used = task.fingerprint.elapsed_secs;
        row.far_size = task.artifact_size.map(|s| ByteSize(s).to_string()).unwrap_or_default();
        row
    }
}

fn fill_times(run: &StageRun, start: &mut String, end: &mut String) {
    *start = fmt_time(run.started_at);
    *end = fmt_time(run.finished_at);
}

/// Write rows as CSV with a header line.
pub fn write_table(rows: &[ReportRow], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("create report '{}'", path.display()))?;
    for row in rows {
        writer.serialize(row).context("write report row")?;
    }
    writer.flush().context("flush report")?;
    Ok(())
}
