use crate::core::config::AppConfig;
use crate::core::error::StoreResult;
use crate::core::model::{Task, TaskId, TaskPatch, TaskStatus};
use crate::core::store::{now_timestamp, TaskStore};
use crate::plugins::postprocess::{self, PostProcessor};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const NO_DRIVER_MSG: &str = "No downloader available for this URL.";
pub const CANCELLED_MSG: &str = "Cancelled by user";
pub const NO_RESULT_MSG: &str = "driver finished without reporting a result";

const PROGRESS_WRITE_INTERVAL: Duration = Duration::from_secs(1);

/// Settings every driver needs while running a task.
#[derive(Clone)]
pub struct DriverContext {
    pub downloads_dir: PathBuf,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub ytdlp_bin: PathBuf,
    pub quality: String,
    pub extra_args: Vec<String>,
    pub overwrite_existing: bool,
    pub post_processor: Arc<dyn PostProcessor>,
}

impl DriverContext {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            downloads_dir: cfg.paths.downloads_dir.clone(),
            user_agent: cfg.downloads.user_agent.clone(),
            timeout_secs: cfg.downloads.timeout_secs,
            retries: cfg.downloads.retries,
            retry_backoff_ms: cfg.downloads.retry_backoff_ms,
            ytdlp_bin: cfg.downloads.ytdlp_bin.clone(),
            quality: cfg.downloads.quality.clone(),
            extra_args: cfg.downloads.extra_args.split_whitespace().map(str::to_string).collect(),
            overwrite_existing: cfg.downloads.overwrite_existing,
            post_processor: postprocess::from_config(&cfg.postprocess),
        }
    }

    /// `<downloads>/<SOURCE>`, created on demand.
    pub async fn task_dir(&self, task: &Task) -> anyhow::Result<PathBuf> {
        let label = sanitize_filename::sanitize(task.source.as_str());
        let label = if label.is_empty() { "OTHER".to_string() } else { label };
        let dir = self.downloads_dir.join(label);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

/// Writes a running task's progress and outcome back to the store.
///
/// Every write is conditional on the row still being DOWNLOADING: a task that
/// was reset, deleted or wiped while its driver was winding down stays as the
/// control plane left it.
pub struct TaskReporter {
    store: TaskStore,
    task_id: TaskId,
    last_progress: Mutex<Option<Instant>>,
}

impl TaskReporter {
    pub fn new(store: TaskStore, task_id: TaskId) -> Self {
        Self { store, task_id, last_progress: Mutex::new(None) }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Throttled to one write per second.
    pub async fn progress(&self, pct: f64) -> StoreResult<()> {
        {
            let mut last = self.last_progress.lock().unwrap_or_else(|p| p.into_inner());
            if matches!(*last, Some(t) if t.elapsed() < PROGRESS_WRITE_INTERVAL) {
                return Ok(());
            }
            *last = Some(Instant::now());
        }
        self.write(TaskPatch::status(TaskStatus::Downloading).with_progress(pct)).await?;
        Ok(())
    }

    pub async fn completed(&self, final_path: &Path) -> StoreResult<bool> {
        let patch = TaskPatch {
            status: Some(TaskStatus::Completed),
            progress: Some(100.0),
            filename: final_path.file_name().map(|n| n.to_string_lossy().into_owned()),
            filepath: Some(final_path.to_string_lossy().into_owned()),
            completed_at: Some(now_timestamp()),
            ..TaskPatch::default()
        };
        self.write(patch).await
    }

    pub async fn cancelled(&self) -> StoreResult<bool> {
        self.write(TaskPatch::status(TaskStatus::Cancelled).with_error(CANCELLED_MSG)).await
    }

    pub async fn failed(&self, msg: impl Into<String>) -> StoreResult<bool> {
        self.write(TaskPatch::status(TaskStatus::Error).with_error(msg)).await
    }

    async fn write(&self, patch: TaskPatch) -> StoreResult<bool> {
        self.store.update_if(self.task_id, TaskStatus::Downloading, &patch).await
    }
}

/// A backend able to fetch some family of URLs.
///
/// `run` reports progress and the terminal status through the reporter and is
/// expected to check `cancel` at least once per chunk of work. Returning `Err`
/// marks the task ERROR with the error chain as message.
#[async_trait]
pub trait MediaDriver: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, url: &str) -> bool;
    async fn run(&self, task: &Task, cancel: &CancellationToken, reporter: &TaskReporter) -> anyhow::Result<()>;
}

/// Ordered, first-match-wins list of drivers.
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn MediaDriver>>,
}

impl DriverRegistry {
    /// Narrow drivers first, the yt-dlp catch-all last.
    pub fn with_defaults(ctx: Arc<DriverContext>) -> Self {
        Self::new(vec![
            Arc::new(crate::plugins::http::driver::DirectHttpDriver::new(ctx.clone())),
            Arc::new(crate::plugins::ytdlp::driver::YtDlpDriver::new(ctx)),
        ])
    }

    pub fn new(drivers: Vec<Arc<dyn MediaDriver>>) -> Self {
        Self { drivers }
    }

    pub fn driver_for(&self, url: &str) -> Option<Arc<dyn MediaDriver>> {
        self.drivers.iter().find(|d| d.supports(url)).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    /// Runs `task` (already claimed as DOWNLOADING) to a terminal status.
    pub async fn dispatch(&self, task: &Task, cancel: &CancellationToken, store: &TaskStore) -> StoreResult<()> {
        let reporter = TaskReporter::new(store.clone(), task.id);

        let Some(driver) = self.driver_for(&task.url) else {
            warn!(task_id = task.id, url = %task.url, "no driver claims url");
            reporter.failed(NO_DRIVER_MSG).await?;
            return Ok(());
        };

        info!(task_id = task.id, driver = driver.name(), "dispatching");
        if let Err(e) = driver.run(task, cancel, &reporter).await {
            let msg = format!("{:#}", e);
            error!(task_id = task.id, driver = driver.name(), error = %msg, "driver failed");
            reporter.failed(msg).await?;
        }

        // a driver must never leave its row DOWNLOADING
        if reporter.failed(NO_RESULT_MSG).await? {
            warn!(task_id = task.id, driver = driver.name(), "driver returned without a terminal status");
        }
        Ok(())
    }
}
