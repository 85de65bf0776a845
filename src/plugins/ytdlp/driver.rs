use anyhow::Context;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::model::{Mode, Task};
use crate::plugins::registry::{DriverContext, MediaDriver, TaskReporter};

/// Files touched this long before the run started still count as "created by it".
const RECENT_FILE_SLACK: Duration = Duration::from_secs(3);

/// Catch-all driver backed by the external `yt-dlp` tool.
pub struct YtDlpDriver {
    ctx: Arc<DriverContext>,
}

impl YtDlpDriver {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }

    fn build_args(&self, task: &Task, output_template: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--newline".into(), "-o".into(), output_template.into()];

        match task.mode {
            Mode::Video => args.push("--no-playlist".into()),
            Mode::Playlist => args.push("--yes-playlist".into()),
        }

        let fmt = self.ctx.quality.trim();
        if !matches!(fmt.to_ascii_lowercase().as_str(), "" | "best" | "default" | "auto") {
            args.push("-f".into());
            args.push(fmt.into());
        }

        if self.ctx.overwrite_existing {
            args.push("--no-continue".into());
        }

        args.extend(self.ctx.extra_args.iter().map(OsString::from));
        args.push(task.url.clone().into());
        args
    }
}

/// First `NN.N%` token on a progress line.
pub(crate) fn parse_percent(line: &str) -> Option<f64> {
    line.split_whitespace()
        .filter_map(|tok| tok.strip_suffix('%'))
        .find_map(|num| num.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Output path announced by yt-dlp on this line, if any.
pub(crate) fn parse_destination(line: &str) -> Option<&str> {
    if let Some((_, rest)) = line.split_once("Destination:") {
        return Some(rest.trim()).filter(|s| !s.is_empty());
    }
    if let Some((_, rest)) = line.split_once("Merging formats into") {
        return Some(rest.trim().trim_matches('"')).filter(|s| !s.is_empty());
    }
    if line.starts_with("[download]") {
        if let Some(rest) = line.strip_prefix("[download]") {
            if let Some(path) = rest.trim().strip_suffix("has already been downloaded") {
                return Some(path.trim()).filter(|s| !s.is_empty());
            }
        }
    }
    None
}

/// Next `\n`-terminated line, decoded lossily. `None` at end of stream.
pub(crate) async fn read_line_lossy<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Picks the file a finished run produced: the announced destination if it
/// exists, else the newest file carrying the task tag written during the run,
/// else (only after a clean exit) the newest file written during the run.
pub(crate) async fn locate_output(
    dir: &Path,
    detected: Option<&Path>,
    tag: &str,
    started: SystemTime,
    exited_ok: bool,
) -> Option<PathBuf> {
    if let Some(p) = detected {
        if tokio::fs::metadata(p).await.map(|m| m.is_file()).unwrap_or(false) {
            return Some(p.to_path_buf());
        }
    }

    let marker = format!("[{tag}].");
    let threshold = started.checked_sub(RECENT_FILE_SLACK).unwrap_or(UNIX_EPOCH);
    let mut tagged: Option<(SystemTime, PathBuf)> = None;
    let mut recent: Option<(SystemTime, PathBuf)> = None;

    let mut rd = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = rd.next_entry().await {
        let meta = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".part") || name.ends_with(".ytdl") || name.ends_with(".partial") {
            continue;
        }
        let mtime = meta.modified().unwrap_or(UNIX_EPOCH);

        if mtime < threshold {
            continue;
        }
        if name.contains(&marker) && tagged.as_ref().map_or(true, |(t, _)| mtime > *t) {
            tagged = Some((mtime, entry.path()));
        }
        if recent.as_ref().map_or(true, |(t, _)| mtime > *t) {
            recent = Some((mtime, entry.path()));
        }
    }

    if let Some((_, p)) = tagged {
        return Some(p);
    }
    if exited_ok {
        if let Some((_, p)) = recent {
            warn!(file = %p.display(), "adopting most recent file as yt-dlp output");
            return Some(p);
        }
    }
    None
}

#[async_trait]
impl MediaDriver for YtDlpDriver {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    /// yt-dlp understands nearly every site, so this driver claims everything.
    fn supports(&self, _url: &str) -> bool {
        true
    }

    async fn run(&self, task: &Task, cancel: &CancellationToken, reporter: &TaskReporter) -> anyhow::Result<()> {
        let dir = self.ctx.task_dir(task).await?;
        let tag = task.display_id();
        let template = dir.join(format!("%(title)s [{tag}].%(ext)s"));
        let args = self.build_args(task, &template);

        info!(task_id = task.id, tag = %tag, url = %task.url, bin = %self.ctx.ytdlp_bin.display(), "starting yt-dlp");
        let started = SystemTime::now();
        let mut child = Command::new(&self.ctx.ytdlp_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", self.ctx.ytdlp_bin.display()))?;

        let stdout = child.stdout.take().context("yt-dlp stdout not captured")?;
        let stderr = child.stderr.take().context("yt-dlp stderr not captured")?;

        // drain stderr concurrently so the pipe never fills up
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            let mut last = None;
            while let Ok(Some(l)) = read_line_lossy(&mut reader, &mut buf).await {
                let l = l.trim();
                if !l.is_empty() {
                    last = Some(l.to_string());
                }
            }
            last
        });

        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut detected: Option<PathBuf> = None;

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    reporter.cancelled().await?;
                    info!(task_id = task.id, "yt-dlp cancelled");
                    return Ok(());
                }
                line = read_line_lossy(&mut reader, &mut buf) => line.context("read yt-dlp output")?,
            };
            let Some(line) = line else { break };
            let line = line.trim();

            if let Some(dest) = parse_destination(line) {
                let p = PathBuf::from(dest);
                let p = if p.is_absolute() { p } else { dir.join(p) };
                debug!(task_id = task.id, dest = %p.display(), "destination detected");
                detected = Some(p);
            }
            if let Some(pct) = parse_percent(line) {
                reporter.progress(pct).await?;
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                reporter.cancelled().await?;
                info!(task_id = task.id, "yt-dlp cancelled");
                return Ok(());
            }
            status = child.wait() => status.context("wait for yt-dlp")?,
        };
        let last_err = stderr_task.await.ok().flatten();

        match locate_output(&dir, detected.as_deref(), &tag, started, status.success()).await {
            Some(path) => {
                let final_path = self.ctx.post_processor.process(&path).await;
                reporter.completed(&final_path).await?;
                info!(task_id = task.id, file = %final_path.display(), "yt-dlp download completed");
                Ok(())
            }
            None if !status.success() => {
                let code = status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string());
                anyhow::bail!(
                    "yt-dlp exited with code {}: {}",
                    code,
                    last_err.as_deref().unwrap_or("unknown error")
                )
            }
            None => anyhow::bail!("yt-dlp finished without errors but produced no file"),
        }
    }
}
