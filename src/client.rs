//! Thin REST client used by the `add`, `control`, `state` and `watch`
//! subcommands.

use crate::core::config::AppConfig;
use crate::core::model::{Task, TaskId, TaskStatus};
use crate::core::progress::ProgressSmoother;
use crate::core::worker::WorkerSnapshot;
use crate::server::routes::{
    ControlRequest, ControlResponse, CounterList, EnqueueRequest, EnqueueResponse, PingResponse, TaskList,
};
use anyhow::Context;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token.trim()))?);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { base: base_url.trim_end_matches('/').to_string(), http })
    }

    /// Server address and token file taken from the local configuration.
    pub async fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let path = &cfg.paths.token_path;
        let token = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read token {} (has the server run yet?)", path.display()))?;
        Self::new(&cfg.server_url(), &token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> anyhow::Result<T> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json::<T>().await?);
        }
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        let detail = body
            .get("detail")
            .and_then(|d| d.as_str())
            .unwrap_or("no detail")
            .to_string();
        anyhow::bail!("server answered {}: {}", status, detail)
    }

    pub async fn ping(&self) -> anyhow::Result<PingResponse> {
        Self::decode(self.http.get(self.url("/api/ping")).send().await?).await
    }

    pub async fn enqueue(&self, url: &str, source: &str, mode: &str) -> anyhow::Result<EnqueueResponse> {
        let body = EnqueueRequest {
            url: url.to_string(),
            source: Some(source.to_string()),
            mode: Some(mode.to_string()),
        };
        Self::decode(self.http.post(self.url("/api/queue")).json(&body).send().await?).await
    }

    pub async fn list(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<Task>> {
        let resp = self
            .http
            .get(self.url("/api/status"))
            .query(&[("limit", limit), ("offset", offset)])
            .send()
            .await?;
        Ok(Self::decode::<TaskList>(resp).await?.items)
    }

    pub async fn counters(&self) -> anyhow::Result<CounterList> {
        Self::decode(self.http.get(self.url("/api/counters")).send().await?).await
    }

    pub async fn control(&self, action: &str, task_id: Option<TaskId>) -> anyhow::Result<ControlResponse> {
        let body = ControlRequest { action: action.to_string(), task_id };
        Self::decode(self.http.post(self.url("/api/control")).json(&body).send().await?).await
    }

    pub async fn worker_state(&self) -> anyhow::Result<WorkerSnapshot> {
        Self::decode(self.http.get(self.url("/api/worker_state")).send().await?).await
    }
}

fn bar_label(task: &Task) -> String {
    let name = task.filename.as_deref().unwrap_or(&task.url);
    match (&task.status, &task.error_msg) {
        (TaskStatus::Error | TaskStatus::Cancelled, Some(msg)) => format!("{} {} ({})", task.status.as_str(), name, msg),
        _ => format!("{} {}", task.status.as_str(), name),
    }
}

/// Polls the queue and draws one bar per listed task until Ctrl-C.
pub async fn watch(client: &ApiClient, every: Duration, limit: i64) -> anyhow::Result<()> {
    let mp = MultiProgress::new();
    let style = ProgressStyle::with_template("{prefix:>6} {bar:40.cyan/blue} {pos:>3}% {wide_msg}")?
        .progress_chars("=> ");
    let mut bars: HashMap<TaskId, ProgressBar> = HashMap::new();
    let mut smoother = ProgressSmoother::new();

    loop {
        let tasks = client.list(limit, 0).await?;
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();

        // oldest at the top
        for task in tasks.iter().rev() {
            let shown = smoother.smooth(task.id, task.progress, task.status);
            let pb = bars.entry(task.id).or_insert_with(|| {
                let pb = mp.add(ProgressBar::new(100));
                pb.set_style(style.clone());
                pb.set_prefix(task.display_id());
                pb
            });
            pb.set_position(shown.floor().clamp(0.0, 100.0) as u64);
            pb.set_message(bar_label(task));
        }

        bars.retain(|id, pb| {
            let keep = ids.contains(id);
            if !keep {
                pb.finish_and_clear();
            }
            keep
        });
        smoother.retain_only(&ids);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(every) => {}
        }
    }

    for pb in bars.values() {
        pb.abandon();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Mode, Source};

    fn task(status: TaskStatus, error: Option<&str>) -> Task {
        Task {
            id: 1,
            url: "https://v.test/1".to_string(),
            source: Source::Gui,
            local_id: 1,
            source_prefix: "G".to_string(),
            mode: Mode::Video,
            status,
            progress: 0.0,
            retry_count: 0,
            filename: None,
            filepath: None,
            error_msg: error.map(str::to_string),
            added_at: "2026-01-01 00:00:00".to_string(),
            completed_at: None,
        }
    }

    #[test]
    fn label_shows_error_for_failed_tasks() {
        assert_eq!(bar_label(&task(TaskStatus::Pending, None)), "PENDING https://v.test/1");
        assert_eq!(
            bar_label(&task(TaskStatus::Error, Some("boom"))),
            "ERROR https://v.test/1 (boom)"
        );
    }

    #[test]
    fn base_url_is_normalized() {
        let c = ApiClient::new("http://127.0.0.1:8334/", "abc").unwrap();
        assert_eq!(c.url("/api/ping"), "http://127.0.0.1:8334/api/ping");
    }
}
