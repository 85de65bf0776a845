use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub db_path: PathBuf,
    pub token_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DownloadsConfig {
    pub ytdlp_bin: PathBuf,
    pub quality: String,
    pub extra_args: String,
    pub overwrite_existing: bool,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcessAction {
    /// Extract audio and delete the video.
    Audio,
    /// Extract audio and keep the video.
    Both,
}

impl PostProcessAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "audio" => Some(Self::Audio),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostProcessConfig {
    pub enabled: bool,
    pub action: PostProcessAction,
    pub audio_format: String,
    pub audio_bitrate: String,
    pub ffmpeg_bin: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerTimings {
    pub idle_poll: Duration,
    pub paused_poll: Duration,
    pub error_backoff: Duration,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_secs(2),
            paused_poll: Duration::from_secs(1),
            error_backoff: Duration::from_secs(3),
        }
    }
}

/// Process-wide settings. Built once in `main` and handed to every component.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub downloads: DownloadsConfig,
    pub postprocess: PostProcessConfig,
    pub worker: WorkerTimings,
    pub log_level: String,
}

impl AppConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            server: ServerConfig {
                name: "media-queue server".to_string(),
                scheme: "http".to_string(),
                host: "127.0.0.1".to_string(),
                port: 8334,
            },
            paths: PathsConfig {
                downloads_dir: data_dir.join("downloads"),
                db_path: data_dir.join("queue.sqlite"),
                token_path: data_dir.join("token.txt"),
                data_dir,
            },
            downloads: DownloadsConfig {
                ytdlp_bin: PathBuf::from("yt-dlp"),
                quality: "best".to_string(),
                extra_args: String::new(),
                overwrite_existing: false,
                user_agent: format!("media-queue/{}", env!("CARGO_PKG_VERSION")),
                timeout_secs: 60,
                retries: 2,
                retry_backoff_ms: 400,
            },
            postprocess: PostProcessConfig {
                enabled: false,
                action: PostProcessAction::Audio,
                audio_format: "mp3".to_string(),
                audio_bitrate: "320k".to_string(),
                ffmpeg_bin: PathBuf::from("ffmpeg"),
            },
            worker: WorkerTimings::default(),
            log_level: "info".to_string(),
        }
    }

    pub fn server_url(&self) -> String {
        format!("{}://{}:{}", self.server.scheme, self.server.host, self.server.port)
    }

    /// Global flags shared by every subcommand.
    pub fn augment_command(cmd: Command) -> Command {
        cmd.arg(
            Arg::new("data_dir")
                .long("data-dir")
                .env("MEDIA_QUEUE_DATA_DIR")
                .help("Directory holding the database, token and downloads")
                .default_value("./data")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("downloads_dir")
                .long("downloads-dir")
                .env("MEDIA_QUEUE_DOWNLOADS_DIR")
                .help("Where finished files land (default: <data-dir>/downloads)")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("token_path")
                .long("token-path")
                .env("MEDIA_QUEUE_TOKEN_PATH")
                .help("Bearer token file (default: <data-dir>/token.txt)")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .env("MEDIA_QUEUE_HOST")
                .help_heading("Server")
                .default_value("127.0.0.1")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .env("MEDIA_QUEUE_PORT")
                .help_heading("Server")
                .default_value("8334")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("server_name")
                .long("server-name")
                .env("MEDIA_QUEUE_SERVER_NAME")
                .help_heading("Server")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .env("MEDIA_QUEUE_LOG")
                .help("Log filter used when RUST_LOG is unset")
                .default_value("info")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("ytdlp_bin")
                .long("yt-dlp")
                .env("MEDIA_QUEUE_YTDLP")
                .help_heading("Downloads")
                .help("yt-dlp executable")
                .default_value("yt-dlp")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("quality")
                .long("quality")
                .env("MEDIA_QUEUE_QUALITY")
                .help_heading("Downloads")
                .help("yt-dlp format selector; best/default/auto leave it to yt-dlp")
                .default_value("best")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("extra_args")
                .long("extra-args")
                .env("MEDIA_QUEUE_EXTRA_ARGS")
                .help_heading("Downloads")
                .help("Extra yt-dlp arguments, whitespace separated")
                .allow_hyphen_values(true)
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("overwrite")
                .long("overwrite")
                .help_heading("Downloads")
                .help("Re-download instead of continuing partial files")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("timeout_secs")
                .long("timeout-secs")
                .help_heading("Downloads")
                .help("HTTP timeout in seconds")
                .default_value("60")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("retries")
                .long("retries")
                .help_heading("Downloads")
                .help("HTTP retries for transient errors")
                .default_value("2")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("postprocess")
                .long("postprocess")
                .env("MEDIA_QUEUE_POSTPROCESS")
                .help_heading("Post-processing")
                .help("Extract audio after download: audio (drop video) or both")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("audio_format")
                .long("audio-format")
                .help_heading("Post-processing")
                .default_value("mp3")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("audio_bitrate")
                .long("audio-bitrate")
                .help_heading("Post-processing")
                .default_value("320k")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("ffmpeg_bin")
                .long("ffmpeg")
                .env("MEDIA_QUEUE_FFMPEG")
                .help_heading("Post-processing")
                .default_value("ffmpeg")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("idle_poll_ms")
                .long("idle-poll-ms")
                .env("MEDIA_QUEUE_IDLE_POLL_MS")
                .help_heading("Worker")
                .help("Sleep between polls of an empty queue")
                .default_value("2000")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("paused_poll_ms")
                .long("paused-poll-ms")
                .env("MEDIA_QUEUE_PAUSED_POLL_MS")
                .help_heading("Worker")
                .help("Sleep between checks while paused")
                .default_value("1000")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("error_backoff_ms")
                .long("error-backoff-ms")
                .env("MEDIA_QUEUE_ERROR_BACKOFF_MS")
                .help_heading("Worker")
                .help("Pause after a store error or a crashed driver")
                .default_value("3000")
                .global(true)
                .num_args(1),
        )
    }

    pub fn from_matches(m: &ArgMatches) -> anyhow::Result<Self> {
        let data_dir: PathBuf = m
            .get_one::<String>("data_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let mut cfg = Self::with_data_dir(data_dir);

        if let Some(s) = m.get_one::<String>("downloads_dir") {
            cfg.paths.downloads_dir = PathBuf::from(s);
        }
        if let Some(s) = m.get_one::<String>("token_path") {
            cfg.paths.token_path = PathBuf::from(s);
        }
        if let Some(s) = m.get_one::<String>("host") {
            cfg.server.host = s.clone();
        }
        if let Some(s) = m.get_one::<String>("port") {
            cfg.server.port = s.parse().with_context(|| format!("invalid --port {s}"))?;
        }
        if let Some(s) = m.get_one::<String>("server_name") {
            cfg.server.name = s.clone();
        }
        if let Some(s) = m.get_one::<String>("log_level") {
            cfg.log_level = s.clone();
        }

        if let Some(s) = m.get_one::<String>("ytdlp_bin") {
            cfg.downloads.ytdlp_bin = PathBuf::from(s);
        }
        if let Some(s) = m.get_one::<String>("quality") {
            cfg.downloads.quality = s.clone();
        }
        if let Some(s) = m.get_one::<String>("extra_args") {
            cfg.downloads.extra_args = s.clone();
        }
        cfg.downloads.overwrite_existing = m.get_flag("overwrite");
        if let Some(s) = m.get_one::<String>("timeout_secs") {
            cfg.downloads.timeout_secs = s.parse().with_context(|| format!("invalid --timeout-secs {s}"))?;
        }
        if let Some(s) = m.get_one::<String>("retries") {
            cfg.downloads.retries = s.parse().with_context(|| format!("invalid --retries {s}"))?;
        }

        if let Some(s) = m.get_one::<String>("postprocess") {
            let action = PostProcessAction::parse(s)
                .ok_or_else(|| anyhow::anyhow!("invalid --postprocess {s}; expected audio or both"))?;
            cfg.postprocess.enabled = true;
            cfg.postprocess.action = action;
        }
        if let Some(s) = m.get_one::<String>("audio_format") {
            cfg.postprocess.audio_format = s.to_ascii_lowercase();
        }
        if let Some(s) = m.get_one::<String>("audio_bitrate") {
            cfg.postprocess.audio_bitrate = s.clone();
        }
        if let Some(s) = m.get_one::<String>("ffmpeg_bin") {
            cfg.postprocess.ffmpeg_bin = PathBuf::from(s);
        }

        let ms = |key: &str, flag: &str| -> anyhow::Result<Option<Duration>> {
            m.get_one::<String>(key)
                .map(|s| {
                    s.parse::<u64>()
                        .map(Duration::from_millis)
                        .with_context(|| format!("invalid --{flag} {s}"))
                })
                .transpose()
        };
        if let Some(d) = ms("idle_poll_ms", "idle-poll-ms")? {
            cfg.worker.idle_poll = d;
        }
        if let Some(d) = ms("paused_poll_ms", "paused-poll-ms")? {
            cfg.worker.paused_poll = d;
        }
        if let Some(d) = ms("error_backoff_ms", "error-backoff-ms")? {
            cfg.worker.error_backoff = d;
        }

        Ok(cfg)
    }
}
