use serde::{Deserialize, Serialize};

pub type TaskId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Downloading => "DOWNLOADING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Error => "ERROR",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(TaskStatus::Pending),
            "DOWNLOADING" => Some(TaskStatus::Downloading),
            "COMPLETED" => Some(TaskStatus::Completed),
            "ERROR" => Some(TaskStatus::Error),
            "CANCELLED" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal rows only change through an explicit reset or delete.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Downloading)
    }
}

/// Where a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    Clipboard,
    Gui,
    File,
    Ext,
    Mobile,
    Api,
    System,
    Unknown,
}

impl Source {
    pub const ALL: [Source; 8] = [
        Source::Clipboard,
        Source::Gui,
        Source::File,
        Source::Ext,
        Source::Mobile,
        Source::Api,
        Source::System,
        Source::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Clipboard => "CLIPBOARD",
            Source::Gui => "GUI",
            Source::File => "FILE",
            Source::Ext => "EXT",
            Source::Mobile => "MOBILE",
            Source::Api => "API",
            Source::System => "SYSTEM",
            Source::Unknown => "UNKNOWN",
        }
    }

    /// Case-insensitive; anything unrecognised (including empty) is `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "CLIPBOARD" => Source::Clipboard,
            "GUI" => Source::Gui,
            "FILE" => Source::File,
            "EXT" => Source::Ext,
            "MOBILE" => Source::Mobile,
            "API" => Source::Api,
            "SYSTEM" => Source::System,
            _ => Source::Unknown,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Source::Clipboard => "C",
            Source::Gui => "G",
            Source::File => "F",
            Source::Ext => "E",
            Source::Mobile => "M",
            Source::Api => "A",
            Source::System => "S",
            Source::Unknown => "?",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Video,
    Playlist,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Video => "VIDEO",
            Mode::Playlist => "PLAYLIST",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "VIDEO" => Some(Mode::Video),
            "PLAYLIST" => Some(Mode::Playlist),
            _ => None,
        }
    }

    /// Unknown modes fall back to `Video` instead of being rejected.
    pub fn normalize(value: Option<&str>) -> Self {
        value.and_then(Self::parse).unwrap_or(Mode::Video)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub url: String,
    pub source: Source,
    pub local_id: i64,
    pub source_prefix: String,
    pub mode: Mode,
    pub status: TaskStatus,
    pub progress: f64,
    pub retry_count: i64,
    pub filename: Option<String>,
    pub filepath: Option<String>,
    pub error_msg: Option<String>,
    pub added_at: String,
    pub completed_at: Option<String>,
}

impl Task {
    /// Compact per-origin label such as `G7`.
    pub fn display_id(&self) -> String {
        format!("{}{}", self.source_prefix, self.local_id)
    }
}

/// Partial update applied by [`crate::core::store::TaskStore::update`]; `None` leaves a column as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub error_msg: Option<String>,
    pub filename: Option<String>,
    pub filepath: Option<String>,
    pub completed_at: Option<String>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(TaskId),
    /// The same URL is already PENDING or DOWNLOADING.
    Duplicate,
}

/// Result of sending a finished task back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued,
    NotFound,
    /// Still PENDING or DOWNLOADING.
    Busy(TaskStatus),
    /// Another row with the same URL is already active.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounter {
    pub source: String,
    pub last_local_id: i64,
}
