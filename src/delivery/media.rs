use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::courier::MediaAttachment;

/// Offset of the still frame used as a video thumbnail
const THUMBNAIL_OFFSET: &str = "00:00:10";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCategory {
    Video,
    Audio,
    Image,
    Generic,
}

impl ContentCategory {
    /// Guesses the category from the file extension
    pub fn classify(path: &Path) -> Self {
        let Some(mime) = mime_guess::from_path(path).first() else {
            return Self::Generic;
        };
        let kind = mime.type_();
        if kind == mime_guess::mime::VIDEO {
            Self::Video
        } else if kind == mime_guess::mime::AUDIO {
            Self::Audio
        } else if kind == mime_guess::mime::IMAGE {
            Self::Image
        } else {
            Self::Generic
        }
    }

    /// Caption prefix shown next to the file name
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Video => "🎬",
            Self::Audio => "🎵",
            Self::Image => "🖼️",
            Self::Generic => "📦",
        }
    }
}

/// External media tools used to enrich video and audio transfers
#[derive(Debug, Clone)]
pub struct MediaProbe {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub timeout: Duration,
}

impl Default for MediaProbe {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            timeout: Duration::from_secs(30),
        }
    }
}

impl MediaProbe {
    /// Builds the attachment for a part of the given category.
    ///
    /// A video thumbnail, if one was extracted, is a file next to `path` that
    /// the caller must remove after the transfer attempt.
    pub async fn attachment(&self, category: ContentCategory, path: &Path) -> MediaAttachment {
        match category {
            ContentCategory::Video => {
                let thumbnail = self.thumbnail(path).await;
                let duration_secs = self.duration_secs(path).await;
                MediaAttachment::Video {
                    thumbnail,
                    duration_secs,
                }
            }
            ContentCategory::Audio => MediaAttachment::Audio {
                duration_secs: self.duration_secs(path).await,
            },
            ContentCategory::Image => MediaAttachment::Image,
            ContentCategory::Generic => MediaAttachment::Document,
        }
    }

    /// Extracts a still frame with ffmpeg. Best effort.
    pub async fn thumbnail(&self, video: &Path) -> Option<PathBuf> {
        let name = video.file_name()?.to_string_lossy().into_owned();
        let dest = video.with_file_name(format!("{name}.thumb.jpg"));

        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-y")
            .args(["-ss", THUMBNAIL_OFFSET])
            .arg("-i")
            .arg(video)
            .args(["-vframes", "1", "-q:v", "2"])
            .arg(&dest);

        if !self.run_quiet(command).await {
            // ffmpeg may leave a truncated frame behind
            let _ = tokio::fs::remove_file(&dest).await;
            return None;
        }
        tokio::fs::try_exists(&dest)
            .await
            .unwrap_or(false)
            .then_some(dest)
    }

    /// Duration in whole seconds via ffprobe, 0 when unknown
    pub async fn duration_secs(&self, path: &Path) -> u64 {
        let mut command = Command::new(&self.ffprobe);
        command
            .args(["-v", "error"])
            .args(["-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                debug!(path = ?path, status = %output.status, "ffprobe failed");
                return 0;
            }
            Ok(Err(e)) => {
                warn!(program = ?self.ffprobe, error = %e, "Failed to run ffprobe");
                return 0;
            }
            Err(_) => {
                warn!(path = ?path, "ffprobe timed out");
                return 0;
            }
        };

        parse_duration(&String::from_utf8_lossy(&output.stdout))
    }

    async fn run_quiet(&self, mut command: Command) -> bool {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!(program = ?self.ffmpeg, error = %e, "Failed to run ffmpeg");
                false
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Thumbnail extraction timed out");
                false
            }
        }
    }
}

fn parse_duration(output: &str) -> u64 {
    output
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| secs as u64)
        .unwrap_or(0)
}
