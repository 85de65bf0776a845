//! Hook run by drivers after a successful fetch. Given the downloaded file it
//! returns the path that should be recorded as the task's result.

use crate::core::config::{PostProcessAction, PostProcessConfig};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info, warn};

#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Never fails: on any problem the input path is returned unchanged.
    async fn process(&self, input: &Path) -> PathBuf;
}

pub struct NoopPostProcessor;

#[async_trait]
impl PostProcessor for NoopPostProcessor {
    async fn process(&self, input: &Path) -> PathBuf {
        input.to_path_buf()
    }
}

pub fn from_config(cfg: &PostProcessConfig) -> Arc<dyn PostProcessor> {
    if cfg.enabled {
        Arc::new(FfmpegPostProcessor::new(cfg.clone()))
    } else {
        Arc::new(NoopPostProcessor)
    }
}

/// Audio extraction through an external ffmpeg.
pub struct FfmpegPostProcessor {
    cfg: PostProcessConfig,
}

impl FfmpegPostProcessor {
    pub fn new(cfg: PostProcessConfig) -> Self {
        Self { cfg }
    }

    fn codec_args(format: &str, bitrate: &str) -> Option<Vec<String>> {
        let args = match format {
            "mp3" => vec!["-acodec", "libmp3lame", "-b:a", bitrate],
            "m4a" => vec!["-c:a", "aac", "-b:a", bitrate],
            "flac" => vec!["-c:a", "flac"],
            "wav" => vec!["-acodec", "pcm_s16le"],
            _ => return None,
        };
        Some(args.into_iter().map(str::to_string).collect())
    }

    async fn extract(&self, input: &Path) -> anyhow::Result<PathBuf> {
        let format = self.cfg.audio_format.as_str();
        let codec = Self::codec_args(format, &self.cfg.audio_bitrate)
            .ok_or_else(|| anyhow::anyhow!("unsupported audio format {format}"))?;
        let output = input.with_extension(format);

        info!(input = %input.display(), format, "extracting audio");
        let out = Command::new(&self.cfg.ffmpeg_bin)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .args(&codec)
            .arg(&output)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("spawn {}: {}", self.cfg.ffmpeg_bin.display(), e))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let tail: String = stderr.chars().rev().take(300).collect::<Vec<_>>().into_iter().rev().collect();
            anyhow::bail!("ffmpeg failed: {}", tail.trim());
        }
        Ok(output)
    }
}

#[async_trait]
impl PostProcessor for FfmpegPostProcessor {
    async fn process(&self, input: &Path) -> PathBuf {
        if tokio::fs::metadata(input).await.is_err() {
            error!(input = %input.display(), "post-process input missing");
            return input.to_path_buf();
        }

        let audio = match self.extract(input).await {
            Ok(p) => p,
            Err(e) => {
                error!(input = %input.display(), error = %format!("{:#}", e), "post-process failed");
                return input.to_path_buf();
            }
        };

        match self.cfg.action {
            PostProcessAction::Audio => {
                if let Err(e) = tokio::fs::remove_file(input).await {
                    warn!(input = %input.display(), error = %e, "could not remove source video");
                }
                audio
            }
            PostProcessAction::Both => input.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(ffmpeg: &str, format: &str) -> PostProcessConfig {
        PostProcessConfig {
            enabled: true,
            action: PostProcessAction::Audio,
            audio_format: format.to_string(),
            audio_bitrate: "192k".to_string(),
            ffmpeg_bin: PathBuf::from(ffmpeg),
        }
    }

    #[test]
    fn codec_per_format() {
        assert_eq!(
            FfmpegPostProcessor::codec_args("mp3", "192k").unwrap(),
            vec!["-acodec", "libmp3lame", "-b:a", "192k"]
        );
        assert_eq!(FfmpegPostProcessor::codec_args("flac", "192k").unwrap(), vec!["-c:a", "flac"]);
        assert!(FfmpegPostProcessor::codec_args("ogg", "192k").is_none());
    }

    #[tokio::test]
    async fn failures_fall_back_to_input() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip [G1].mp4");
        tokio::fs::write(&video, b"not really a video").await.unwrap();

        let missing_tool = FfmpegPostProcessor::new(cfg("/nonexistent/ffmpeg-binary", "mp3"));
        assert_eq!(missing_tool.process(&video).await, video);
        assert!(video.exists());

        let bad_format = FfmpegPostProcessor::new(cfg("ffmpeg", "ogg"));
        assert_eq!(bad_format.process(&video).await, video);

        let gone = dir.path().join("gone.mp4");
        assert_eq!(missing_tool.process(&gone).await, gone);
    }

    #[tokio::test]
    async fn disabled_config_is_passthrough() {
        let mut c = cfg("ffmpeg", "mp3");
        c.enabled = false;
        let pp = from_config(&c);
        assert_eq!(pp.process(Path::new("/x/y.webm")).await, PathBuf::from("/x/y.webm"));
    }
}
