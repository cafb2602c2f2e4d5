//! The external binaries the pipeline drives.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::{CommandTemplates, TemplateVars};
use crate::error::ProbeError;
use crate::probe::{self, MediaInfo};
use crate::task::Device;

/// Result of running an external tool to completion.
#[derive(Debug, Clone, Default)]
pub struct ToolRun {
    /// `None` when the process could not be started or was killed by a signal.
    pub exit_code: Option<i32>,
    pub elapsed_secs: Option<u64>,
    pub command: String,
}

impl ToolRun {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct CompressJob {
    pub source: PathBuf,
    pub output: PathBuf,
    pub device: Device,
    pub codec: String,
}

/// Which line of the shell `time` report to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeField {
    Real,
    User,
}

#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError>;

    /// The command line `compress` would run, for the record.
    fn compress_command(&self, job: &CompressJob) -> Vec<String>;

    async fn compress(&self, job: &CompressJob) -> ToolRun;

    fn fingerprint_command(&self, source: &Path, artifact: &Path) -> Vec<String>;

    async fn fingerprint(&self, source: &Path, artifact: &Path) -> ToolRun;
}

/// Runs the real binaries through `bash`'s `time` keyword.
#[derive(Debug, Clone)]
pub struct ShellToolchain {
    templates: CommandTemplates,
}

impl ShellToolchain {
    pub fn new(templates: CommandTemplates) -> Self {
        Self { templates }
    }

    async fn timed(&self, argv: Vec<String>, field: TimeField) -> ToolRun {
        let command = display_command(&argv);
        let Some((program, args)) = argv.split_first() else {
            return ToolRun { command, ..Default::default() };
        };

        // Arguments travel as positional parameters, so nothing needs quoting.
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(r#"time "$0" "$@""#)
            .arg(program)
            .args(args)
            .stdin(Stdio::null());

        debug!(%command, "running");
        match cmd.output().await {
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                ToolRun {
                    exit_code: output.status.code(),
                    elapsed_secs: parse_time_report(&stderr, field),
                    command,
                }
            }
            Err(e) => {
                debug!(%command, "failed to start: {e}");
                ToolRun { command, ..Default::default() }
            }
        }
    }

    async fn format_duration(&self, path: &Path) -> Option<u64> {
        let output = Command::new(&self.templates.probe_program)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        probe::parse_format_duration(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl Toolchain for ShellToolchain {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(ProbeError::Missing(path.to_path_buf()));
        }

        let output = Command::new(&self.templates.probe_program)
            .arg(path)
            .args(["-show_streams", "-select_streams", "v", "-print_format", "json"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(ProbeError::ToolFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let mut info = probe::parse_probe_output(&String::from_utf8_lossy(&output.stdout))?;
        if info.duration_secs.is_none() {
            info.duration_secs = self.format_duration(path).await;
        }
        Ok(info)
    }

    fn compress_command(&self, job: &CompressJob) -> Vec<String> {
        let src = job.source.to_string_lossy();
        let dst = job.output.to_string_lossy();
        let (template, gpu_id) = match job.device {
            Device::Cpu => (&self.templates.cpu_compress, None),
            Device::Gpu(id) => (&self.templates.gpu_compress, Some(id)),
        };
        template.render(&TemplateVars {
            src: &src,
            dst: &dst,
            gpu_id,
            codec: &job.codec,
        })
    }

    async fn compress(&self, job: &CompressJob) -> ToolRun {
        self.timed(self.compress_command(job), TimeField::Real).await
    }

    fn fingerprint_command(&self, source: &Path, artifact: &Path) -> Vec<String> {
        self.templates.fingerprint.render(&TemplateVars {
            src: &source.to_string_lossy(),
            dst: &artifact.to_string_lossy(),
            ..Default::default()
        })
    }

    async fn fingerprint(&self, source: &Path, artifact: &Path) -> ToolRun {
        self.timed(self.fingerprint_command(source, artifact), TimeField::User)
            .await
    }
}

/// Read whole seconds out of a bash `time` report (`real\t1m2.345s`).
pub fn parse_time_report(output: &str, field: TimeField) -> Option<u64> {
    let label = match field {
        TimeField::Real => "real",
        TimeField::User => "user",
    };
    let value = output
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(label))?
        .trim();
    let (minutes, seconds) = value.strip_suffix('s')?.split_once('m')?;
    let minutes: u64 = minutes.parse().ok()?;
    let seconds: f64 = seconds.parse().ok()?;
    Some(minutes * 60 + seconds as u64)
}

/// Join an argv for logging, quoting arguments that contain whitespace.
pub fn display_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
