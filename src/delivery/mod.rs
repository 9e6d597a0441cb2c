//! Post-download delivery
//!
//! Once a fetch succeeds, everything under the job's working directory is
//! discovered, ordered, split to fit the transfer ceiling and handed to the
//! courier one part at a time. Each part is removed right after its transfer
//! attempt, whatever the outcome.

mod discover;
mod media;
mod split;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::courier::{
    Courier, MediaAttachment, RateLimiter, SinkError, StatusReporter, TransferProgress, Upload,
};
use crate::request::RequesterId;
use crate::util::{human_size, progress_bar};

pub use discover::{DeliverableFile, discover};
pub use media::{ContentCategory, MediaProbe};
pub use split::{FilePart, SplitError, plan_parts};

/// Largest single transfer the transport accepts
pub const MAX_PART_SIZE: u64 = 2000 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("No deliverable files found in {0:?}")]
    NothingFound(PathBuf),

    #[error("Delivery canceled")]
    Canceled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Discovery task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Parts never exceed this many bytes
    pub max_part_size: u64,
    pub progress_interval: Duration,
    pub probe: MediaProbe,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_part_size: MAX_PART_SIZE,
            progress_interval: Duration::from_secs(5),
            probe: MediaProbe::default(),
        }
    }
}

/// Counts of one delivery, in parts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Files found by discovery
    pub files: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

pub struct DeliveryPipeline<C: Courier> {
    courier: Arc<C>,
    settings: DeliverySettings,
}

impl<C: Courier> DeliveryPipeline<C> {
    pub fn new(courier: Arc<C>, settings: DeliverySettings) -> Self {
        Self { courier, settings }
    }

    /// Delivers every file under `working_dir` to `requester_id`.
    ///
    /// Fails only when nothing was found or the job got cancelled; individual
    /// part failures are reported to the requester and counted.
    #[instrument(skip(self, status, cancel), fields(job = %status.job_id()))]
    pub async fn deliver(
        &self,
        requester_id: RequesterId,
        working_dir: &Path,
        status: &mut StatusReporter<C>,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReport, DeliveryError> {
        let dir = working_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || discover(&dir)).await?;
        if files.is_empty() {
            return Err(DeliveryError::NothingFound(working_dir.to_path_buf()));
        }

        info!(count = files.len(), "Starting uploads");
        status
            .update(format!("📁 Found {} files. Starting uploads...", files.len()))
            .await;

        let mut report = DeliveryReport {
            files: files.len(),
            ..Default::default()
        };

        for file in &files {
            if cancel.is_cancelled() {
                return Err(DeliveryError::Canceled);
            }
            self.deliver_file(requester_id, file, status, cancel, &mut report)
                .await?;
        }

        info!(?report, "Delivery finished");
        Ok(report)
    }

    async fn deliver_file(
        &self,
        requester_id: RequesterId,
        file: &DeliverableFile,
        status: &mut StatusReporter<C>,
        cancel: &CancellationToken,
        report: &mut DeliveryReport,
    ) -> Result<(), DeliveryError> {
        let filename = file.file_name();
        if file.size > self.settings.max_part_size {
            status
                .update(format!("⚠️ Splitting large file: {filename}"))
                .await;
        }

        let parts = match plan_parts(file, self.settings.max_part_size).await {
            Ok(parts) => parts,
            Err(e) => {
                error!(file = %filename, error = %e, "Splitting failed");
                status
                    .update(format!("❌ Splitting failed for {filename}: {e}"))
                    .await;
                report.failed += 1;
                return Ok(());
            }
        };

        for part in &parts {
            if cancel.is_cancelled() {
                // Remaining parts go away with the working directory
                return Err(DeliveryError::Canceled);
            }

            status
                .update(format!(
                    "📤 Uploading...\n📁 File: {filename}\n🔸 Part: {}/{}\n📦 Size: {}",
                    part.index,
                    part.total,
                    human_size(part.size)
                ))
                .await;

            let result = self
                .deliver_part(requester_id, &filename, part, status, cancel)
                .await;

            if let Err(e) = tokio::fs::remove_file(&part.path).await {
                warn!(part = ?part.path, error = %e, "Failed to remove delivered part");
            }

            match result {
                Ok(()) => report.delivered += 1,
                Err(PartFailure::Canceled) => return Err(DeliveryError::Canceled),
                Err(PartFailure::Sink(e)) => {
                    error!(part = ?part.path, error = %e, "Upload failed");
                    status
                        .update(format!("❌ Upload failed for {}: {e}", part.file_name()))
                        .await;
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn deliver_part(
        &self,
        requester_id: RequesterId,
        filename: &str,
        part: &FilePart,
        status: &mut StatusReporter<C>,
        cancel: &CancellationToken,
    ) -> Result<(), PartFailure> {
        let category = ContentCategory::classify(&part.path);
        let media = self.settings.probe.attachment(category, &part.path).await;
        let thumbnail = match &media {
            MediaAttachment::Video { thumbnail, .. } => thumbnail.clone(),
            _ => None,
        };

        let upload = Upload {
            path: part.path.clone(),
            file_name: part.file_name(),
            caption: format!("{} {filename}", category.icon()),
            size: part.size,
            media,
        };

        let (progress_tx, progress_rx) = mpsc::channel(16);
        let transfer = async {
            let (result, ()) = tokio::join!(
                self.courier.send_file(requester_id, &upload, progress_tx),
                report_transfer(
                    &upload.file_name,
                    progress_rx,
                    status,
                    self.settings.progress_interval
                ),
            );
            result
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PartFailure::Canceled),
            result = transfer => result.map_err(PartFailure::Sink),
        };

        if let Some(thumbnail) = thumbnail {
            let _ = tokio::fs::remove_file(thumbnail).await;
        }
        result
    }
}

enum PartFailure {
    Canceled,
    Sink(SinkError),
}

/// Forwards transfer progress to the status message until the sender is dropped
async fn report_transfer<C: Courier>(
    part_name: &str,
    mut progress_rx: mpsc::Receiver<TransferProgress>,
    status: &mut StatusReporter<C>,
    interval: Duration,
) {
    let mut limiter = RateLimiter::new(interval);
    while let Some(progress) = progress_rx.recv().await {
        if progress.total == 0 {
            continue;
        }
        let percent = progress.percent().floor();
        if !limiter.ready(percent >= 100.0) {
            continue;
        }
        status
            .update(format!(
                "📤 Uploading...\n📁 File: {part_name}\n📊 Progress: {} / {}\n🔸 {} 🔸",
                human_size(progress.current),
                human_size(progress.total),
                progress_bar(percent)
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use ulid::Ulid;

    /// Records every transferred file together with its contents
    #[derive(Default)]
    struct RecordingCourier {
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
        media: Mutex<Vec<MediaAttachment>>,
        texts: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl Courier for RecordingCourier {
        async fn notify(
            &self,
            _job_id: Ulid,
            _requester_id: RequesterId,
            text: &str,
        ) -> Result<(), SinkError> {
            self.texts.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_file(
            &self,
            _requester_id: RequesterId,
            upload: &Upload,
            progress_tx: mpsc::Sender<TransferProgress>,
        ) -> Result<(), SinkError> {
            if self.fail_on.as_deref() == Some(upload.file_name.as_str()) {
                return Err(SinkError::Rejected("scripted failure".to_string()));
            }
            let bytes = tokio::fs::read(&upload.path).await?;
            if let MediaAttachment::Video {
                thumbnail: Some(thumb),
                ..
            } = &upload.media
            {
                assert!(thumb.exists(), "thumbnail missing during transfer");
            }
            self.media.lock().unwrap().push(upload.media.clone());
            let _ = progress_tx
                .send(TransferProgress {
                    current: upload.size,
                    total: upload.size,
                })
                .await;
            self.uploads
                .lock()
                .unwrap()
                .push((upload.file_name.clone(), bytes));
            Ok(())
        }
    }

    fn settings(max_part_size: u64) -> DeliverySettings {
        DeliverySettings {
            max_part_size,
            progress_interval: Duration::from_millis(0),
            probe: MediaProbe {
                ffmpeg: PathBuf::from("/nonexistent/ffmpeg"),
                ffprobe: PathBuf::from("/nonexistent/ffprobe"),
                timeout: Duration::from_secs(1),
            },
        }
    }

    async fn run(
        courier: Arc<RecordingCourier>,
        dir: &Path,
        max_part_size: u64,
    ) -> Result<DeliveryReport, DeliveryError> {
        let pipeline = DeliveryPipeline::new(courier.clone(), settings(max_part_size));
        let mut status = StatusReporter::new(courier, Ulid::new(), 7, 1);
        pipeline
            .deliver(7, dir, &mut status, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_delivers_in_natural_order_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let big: Vec<u8> = (0..2500u32).map(|i| (i % 7) as u8).collect();
        std::fs::write(dir.path().join("10.bin"), vec![1u8; 1500]).unwrap();
        std::fs::write(dir.path().join("2.bin"), &big).unwrap();
        std::fs::write(dir.path().join("1.bin"), vec![3u8; 1100]).unwrap();

        let courier = Arc::new(RecordingCourier::default());
        let report = run(courier.clone(), dir.path(), 1000).await.unwrap();

        assert_eq!(
            report,
            DeliveryReport {
                files: 3,
                delivered: 7,
                failed: 0
            }
        );

        let uploads = courier.uploads.lock().unwrap();
        let names: Vec<&str> = uploads.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "1.bin.part001",
                "1.bin.part002",
                "2.bin.part001",
                "2.bin.part002",
                "2.bin.part003",
                "10.bin.part001",
                "10.bin.part002",
            ]
        );
        let rebuilt: Vec<u8> = uploads[2..5]
            .iter()
            .flat_map(|(_, bytes)| bytes.clone())
            .collect();
        assert_eq!(rebuilt, big);

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_failed_part_does_not_abort_siblings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![0u8; 2000]).unwrap();
        std::fs::write(dir.path().join("b.bin"), vec![0u8; 2000]).unwrap();

        let courier = Arc::new(RecordingCourier {
            fail_on: Some("a.bin".to_string()),
            ..Default::default()
        });
        let report = run(courier.clone(), dir.path(), 10_000).await.unwrap();

        assert_eq!((report.delivered, report.failed), (1, 1));
        assert!(!dir.path().join("a.bin").exists());
        assert!(
            courier
                .texts
                .lock()
                .unwrap()
                .iter()
                .any(|t| t.starts_with("❌ Upload failed for a.bin"))
        );
    }

    #[tokio::test]
    async fn test_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.aria2"), vec![0u8; 4096]).unwrap();

        let courier = Arc::new(RecordingCourier::default());
        let result = run(courier, dir.path(), 1000).await;
        assert!(matches!(result, Err(DeliveryError::NothingFound(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![0u8; 2000]).unwrap();

        let courier = Arc::new(RecordingCourier::default());
        let pipeline = DeliveryPipeline::new(courier.clone(), settings(10_000));
        let mut status = StatusReporter::new(courier.clone(), Ulid::new(), 7, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pipeline.deliver(7, dir.path(), &mut status, &cancel).await;
        assert!(matches!(result, Err(DeliveryError::Canceled)));
        assert!(courier.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_progress_is_rate_limited() {
        let courier = Arc::new(RecordingCourier::default());
        let mut status = StatusReporter::new(courier.clone(), Ulid::new(), 7, 1);
        let (tx, rx) = mpsc::channel(8);
        for current in [100, 500, 900, 1000] {
            tx.send(TransferProgress {
                current,
                total: 1000,
            })
            .await
            .unwrap();
        }
        drop(tx);

        report_transfer("clip.bin", rx, &mut status, Duration::from_secs(5)).await;

        let texts = courier.texts.lock().unwrap();
        assert_eq!(texts.len(), 2, "{texts:?}");
        assert!(texts[0].contains(&progress_bar(10.0)));
        assert!(texts[1].contains(&"█".repeat(20)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_video_part_gets_frame_and_duration() {
        use std::os::unix::fs::PermissionsExt;

        let tools = tempfile::tempdir().unwrap();
        let ffmpeg = tools.path().join("ffmpeg");
        let ffprobe = tools.path().join("ffprobe");
        // The frame destination is the last argument
        std::fs::write(
            &ffmpeg,
            "#!/bin/sh\nfor arg in \"$@\"; do last=\"$arg\"; done\nprintf jpeg > \"$last\"\n",
        )
        .unwrap();
        std::fs::write(&ffprobe, "#!/bin/sh\necho 42.7\n").unwrap();
        for tool in [&ffmpeg, &ffprobe] {
            std::fs::set_permissions(tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), vec![0u8; 4096]).unwrap();

        let courier = Arc::new(RecordingCourier::default());
        let pipeline = DeliveryPipeline::new(
            courier.clone(),
            DeliverySettings {
                max_part_size: 1024 * 1024,
                progress_interval: Duration::ZERO,
                probe: MediaProbe {
                    ffmpeg,
                    ffprobe,
                    timeout: Duration::from_secs(5),
                },
            },
        );
        let mut status = StatusReporter::new(courier.clone(), Ulid::new(), 7, 1);
        let report = pipeline
            .deliver(7, dir.path(), &mut status, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);

        let media = courier.media.lock().unwrap();
        let thumb = dir.path().join("clip.mp4.thumb.jpg");
        assert_eq!(
            *media,
            vec![MediaAttachment::Video {
                thumbnail: Some(thumb.clone()),
                duration_secs: 42,
            }]
        );
        assert!(!thumb.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
