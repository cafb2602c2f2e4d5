use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use strum::Display;

use crate::error::TransitionError;
use crate::probe::MediaInfo;

#[cfg_attr(doc, aquamarine::aquamarine)]
/// Position of a task in the two-stage pipeline.
///
/// ```mermaid
/// stateDiagram-v2
///     Created --> ParseError
///     Created --> NoNeedCompress
///     Created --> NeedCompress
///     NeedCompress --> CompressRunning
///     CompressRunning --> CompressDone
///     CompressRunning --> CompressError
///     CompressDone --> NeedDnagen
///     NoNeedCompress --> NeedDnagen
///     NeedDnagen --> DnagenRunning
///     DnagenRunning --> DnagenDone
///     DnagenRunning --> DnagenError
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Created,
    ParseError,
    NoNeedCompress,
    NeedCompress,
    CompressRunning,
    CompressDone,
    CompressError,
    NeedDnagen,
    DnagenRunning,
    DnagenDone,
    DnagenError,
}

impl TaskStatus {
    /// Move to `next`, rejecting anything the state machine does not allow.
    pub fn transition(self, next: TaskStatus) -> Result<TaskStatus, TransitionError> {
        use TaskStatus::*;
        let allowed = match self {
            Created => matches!(next, ParseError | NoNeedCompress | NeedCompress),
            NeedCompress => matches!(next, CompressRunning),
            CompressRunning => matches!(next, CompressDone | CompressError),
            CompressDone | NoNeedCompress => matches!(next, NeedDnagen),
            NeedDnagen => matches!(next, DnagenRunning),
            DnagenRunning => matches!(next, DnagenDone | DnagenError),
            ParseError | CompressError | DnagenDone | DnagenError => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(TransitionError { from: self, to: next })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::ParseError
                | TaskStatus::CompressError
                | TaskStatus::DnagenDone
                | TaskStatus::DnagenError
        )
    }
}

/// Execution slot a compression job runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl Device {
    /// Numeric id as used on the command line: `-1` for the CPU.
    pub fn id(self) -> i64 {
        match self {
            Device::Cpu => -1,
            Device::Gpu(id) => i64::from(id),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Gpu(id) => write!(f, "GPU:{id}"),
        }
    }
}

/// Bookkeeping for one run of an external tool.
#[derive(Debug, Clone, Default)]
pub struct StageRun {
    pub command: String,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
    /// Seconds as reported by the tool's timing output.
    pub elapsed_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub source: PathBuf,
    pub artifact: PathBuf,
    pub source_size: u64,
    pub media: Option<MediaInfo>,
    pub status: TaskStatus,

    /// `None` until the compression scheduler hands the task to a device.
    pub device: Option<Device>,
    pub compress: StageRun,
    pub compressed_path: Option<PathBuf>,
    pub compressed_size: Option<u64>,

    pub fingerprint: StageRun,
    pub artifact_size: Option<u64>,
}

impl Task {
    pub fn new(source: PathBuf, artifact: PathBuf, source_size: u64) -> Self {
        Self {
            source,
            artifact,
            source_size,
            media: None,
            status: TaskStatus::Created,
            device: None,
            compress: StageRun::default(),
            compressed_path: None,
            compressed_size: None,
            fingerprint: StageRun::default(),
            artifact_size: None,
        }
    }

    pub fn advance(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        self.status = self.status.transition(next)?;
        Ok(())
    }

    pub fn width(&self) -> i64 {
        self.media.as_ref().map_or(-1, |m| m.width)
    }

    pub fn height(&self) -> i64 {
        self.media.as_ref().map_or(-1, |m| m.height)
    }

    pub fn codec(&self) -> &str {
        self.media.as_ref().map_or("", |m| m.codec.as_str())
    }

    pub fn duration_secs(&self) -> Option<u64> {
        self.media.as_ref().and_then(|m| m.duration_secs)
    }

    pub fn shape(&self) -> String {
        format!("{}x{}", self.width(), self.height())
    }
}
