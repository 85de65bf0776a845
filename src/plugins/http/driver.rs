use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::core::model::Task;
use crate::plugins::registry::{DriverContext, MediaDriver, TaskReporter};

/// Path extensions served as plain files; anything else goes to the extractor.
const DIRECT_MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "webm", "mkv", "mov", "avi", "mp3", "m4a", "aac", "flac", "wav", "ogg", "opus",
];

#[derive(thiserror::Error, Debug)]
pub enum HttpDriverError {
    #[error("http status error: {0}")]
    Status(StatusCode),

    #[error("url has no usable file name: {0}")]
    NoFileName(String),
}

/// Streams direct links to media files (`https://host/path/clip.mp4`).
pub struct DirectHttpDriver {
    client: reqwest::Client,
    ctx: Arc<DriverContext>,
}

impl DirectHttpDriver {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, ctx }
    }

    /// `(stem, extension)` of the last path segment when the extension is a known media type.
    fn media_name(url: &Url) -> Option<(String, String)> {
        if url.scheme() != "http" && url.scheme() != "https" {
            return None;
        }
        let last = url.path_segments()?.last()?;
        let (stem, ext) = last.rsplit_once('.')?;
        let ext = ext.to_ascii_lowercase();
        if stem.is_empty() || !DIRECT_MEDIA_EXTENSIONS.contains(&ext.as_str()) {
            return None;
        }
        let stem = percent_decode(stem);
        Some((stem, ext))
    }

    fn build_headers(&self) -> anyhow::Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&self.ctx.user_agent)?);
        Ok(h)
    }

    fn should_retry_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.ctx.retry_backoff_ms.max(1);
        let mul = 1u64 << attempt.min(16);
        Duration::from_millis(base.saturating_mul(mul).min(30_000))
    }

    /// `Ok(None)` when cancelled, whether waiting on the server or backing off.
    async fn get_with_retry(&self, url: &str, cancel: &CancellationToken) -> anyhow::Result<Option<reqwest::Response>> {
        let headers = self.build_headers()?;

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=self.ctx.retries {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = sleep(self.backoff_delay(attempt - 1)) => {}
                }
            }

            // timeout covers connect + headers; the body is streamed without one
            let send = tokio::time::timeout(
                Duration::from_secs(self.ctx.timeout_secs.max(1)),
                self.client.get(url).headers(headers.clone()).send(),
            );
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                sent = send => sent,
            };
            let resp = match sent {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    last_err = Some(e.into());
                    continue;
                }
                Err(_) => {
                    last_err = Some(HttpDriverError::Status(StatusCode::REQUEST_TIMEOUT).into());
                    continue;
                }
            };

            if resp.status().is_success() {
                return Ok(Some(resp));
            }
            if Self::should_retry_status(resp.status()) {
                debug!(url, status = %resp.status(), attempt, "retrying");
                last_err = Some(HttpDriverError::Status(resp.status()).into());
                continue;
            }
            return Err(HttpDriverError::Status(resp.status()).into());
        }

        Err(last_err.unwrap_or_else(|| HttpDriverError::Status(StatusCode::REQUEST_TIMEOUT).into()))
    }

    /// Writes the body to `partial`. Returns the byte count, or `None` if cancelled.
    async fn stream_to(
        &self,
        resp: reqwest::Response,
        partial: &Path,
        total: Option<u64>,
        cancel: &CancellationToken,
        reporter: &TaskReporter,
    ) -> anyhow::Result<Option<u64>> {
        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = resp.bytes_stream();
        let mut downloaded: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(t) = total {
                reporter.progress((downloaded as f64 / t as f64) * 100.0).await?;
            }
        }
        file.flush().await?;
        Ok(Some(downloaded))
    }
}

#[async_trait]
impl MediaDriver for DirectHttpDriver {
    fn name(&self) -> &'static str {
        "direct-http"
    }

    fn supports(&self, url: &str) -> bool {
        Url::parse(url).ok().and_then(|u| Self::media_name(&u)).is_some()
    }

    async fn run(&self, task: &Task, cancel: &CancellationToken, reporter: &TaskReporter) -> anyhow::Result<()> {
        let url = Url::parse(&task.url)?;
        let (stem, ext) = Self::media_name(&url).ok_or_else(|| HttpDriverError::NoFileName(task.url.clone()))?;

        let dir = self.ctx.task_dir(task).await?;
        let target = dir.join(format!(
            "{} [{}].{}",
            sanitize_filename::sanitize(&stem),
            task.display_id(),
            ext
        ));
        let partial = target.with_extension(format!("{ext}.partial"));

        let Some(resp) = self.get_with_retry(&task.url, cancel).await? else {
            reporter.cancelled().await?;
            return Ok(());
        };
        let total = resp.content_length().filter(|t| *t > 0);
        info!(task_id = task.id, total = ?total, target = %target.display(), "streaming direct download");

        let downloaded = match self.stream_to(resp, &partial, total, cancel, reporter).await {
            Ok(Some(n)) => n,
            Ok(None) => {
                let _ = tokio::fs::remove_file(&partial).await;
                reporter.cancelled().await?;
                info!(task_id = task.id, "direct download cancelled");
                return Ok(());
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        if tokio::fs::metadata(&target).await.is_ok() {
            let _ = tokio::fs::remove_file(&target).await;
        }
        tokio::fs::rename(&partial, &target).await?;

        let final_path = self.ctx.post_processor.process(&target).await;
        reporter.completed(&final_path).await?;
        info!(task_id = task.id, bytes = downloaded, file = %final_path.display(), "direct download completed");
        Ok(())
    }
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{EnqueueOutcome, Mode, Source, TaskStatus};
    use crate::core::store::tests::temp_store;
    use crate::core::store::TaskStore;
    use crate::plugins::postprocess::NoopPostProcessor;
    use std::path::PathBuf;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn driver() -> DirectHttpDriver {
        driver_in(Path::new("/tmp/mq-test"))
    }

    fn driver_in(dir: &Path) -> DirectHttpDriver {
        DirectHttpDriver::new(Arc::new(DriverContext {
            downloads_dir: dir.to_path_buf(),
            user_agent: "test".to_string(),
            timeout_secs: 60,
            retries: 0,
            retry_backoff_ms: 1,
            ytdlp_bin: PathBuf::from("yt-dlp"),
            quality: "best".to_string(),
            extra_args: vec![],
            overwrite_existing: false,
            post_processor: Arc::new(NoopPostProcessor),
        }))
    }

    #[test]
    fn claims_only_direct_media_links() {
        let d = driver();
        assert!(d.supports("https://cdn.example.com/media/clip.mp4"));
        assert!(d.supports("http://cdn.example.com/a/b/Song.MP3?token=abc"));
        assert!(!d.supports("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(!d.supports("https://example.com/file.zip"));
        assert!(!d.supports("https://example.com/.mp4"));
        assert!(!d.supports("ftp://example.com/clip.mp4"));
        assert!(!d.supports("not a url"));
    }

    #[test]
    fn file_name_is_decoded() {
        let u = Url::parse("https://cdn.example.com/v/my%20clip.webm").unwrap();
        assert_eq!(
            DirectHttpDriver::media_name(&u),
            Some(("my clip".to_string(), "webm".to_string()))
        );
    }

    async fn claimed(store: &TaskStore, url: &str) -> Task {
        let EnqueueOutcome::Queued(id) = store.enqueue(url, Source::Api, Mode::Video).await.unwrap() else {
            panic!("duplicate");
        };
        assert!(store.claim(id).await.unwrap());
        store.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn cancel_interrupts_a_server_that_never_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let (dir, store) = temp_store().await;
        let d = driver_in(dir.path());
        let task = claimed(&store, &format!("http://{addr}/clip.mp4")).await;
        let reporter = TaskReporter::new(store.clone(), task.id);
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            });
        }

        let ran = tokio::time::timeout(Duration::from_secs(5), d.run(&task, &cancel, &reporter)).await;
        assert!(matches!(ran, Ok(Ok(()))));
        assert_eq!(store.get(task.id).await.unwrap().unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn truncated_body_leaves_no_partial_file() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut req = [0u8; 1024];
                let _ = sock.read(&mut req).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n0123456789")
                    .await;
            }
        });

        let (dir, store) = temp_store().await;
        let d = driver_in(dir.path());
        let task = claimed(&store, &format!("http://{addr}/clip.mp4")).await;
        let reporter = TaskReporter::new(store.clone(), task.id);

        assert!(d.run(&task, &CancellationToken::new(), &reporter).await.is_err());
        let mut entries = tokio::fs::read_dir(dir.path().join("API")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
