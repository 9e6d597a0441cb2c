//! Directory-backed courier
//!
//! Status messages live in memory (one per job) and are what the HTTP job
//! listing shows. Files are copied in chunks into `<root>/<requester>/`,
//! together with a small JSON sidecar describing how they were sent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};
use ulid::Ulid;

use super::{Courier, MediaAttachment, SinkError, TransferProgress, Upload};
use crate::request::RequesterId;

const COPY_CHUNK_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub requester_id: RequesterId,
    pub text: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct OutboxCourier {
    root: PathBuf,
    max_part_size: u64,
    statuses: Mutex<HashMap<Ulid, StatusEntry>>,
}

#[derive(Serialize)]
struct Sidecar<'a> {
    file_name: &'a str,
    caption: &'a str,
    size: u64,
    media: &'a MediaAttachment,
    delivered_at: DateTime<Utc>,
}

impl OutboxCourier {
    pub fn new(root: impl Into<PathBuf>, max_part_size: u64) -> Self {
        Self {
            root: root.into(),
            max_part_size,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn requester_dir(&self, requester_id: RequesterId) -> PathBuf {
        self.root.join(requester_id.to_string())
    }

    /// Latest status text of a job
    pub fn status(&self, job_id: &Ulid) -> Option<StatusEntry> {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }

    /// Drops status entries for jobs that are no longer tracked
    pub fn retain_statuses(&self, keep: impl Fn(&Ulid) -> bool) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|id, _| keep(id));
    }

    async fn copy_with_progress(
        source: &Path,
        dest: &Path,
        total: u64,
        progress_tx: &mpsc::Sender<TransferProgress>,
    ) -> std::io::Result<u64> {
        let mut reader = File::open(source).await?;
        let mut writer = File::create(dest).await?;
        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        let mut current = 0u64;

        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            writer.write_all(&buf[..read]).await?;
            current += read as u64;
            // A closed receiver only means nobody is watching
            let _ = progress_tx.send(TransferProgress { current, total }).await;
        }

        writer.flush().await?;
        Ok(current)
    }
}

impl Courier for OutboxCourier {
    async fn notify(
        &self,
        job_id: Ulid,
        requester_id: RequesterId,
        text: &str,
    ) -> Result<(), SinkError> {
        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        if statuses.get(&job_id).is_some_and(|entry| entry.text == text) {
            return Err(SinkError::NotModified);
        }

        info!(job = %job_id, requester = requester_id, status = %text, "Status update");
        statuses.insert(
            job_id,
            StatusEntry {
                requester_id,
                text: text.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    #[instrument(level = "debug", skip(self, upload, progress_tx), fields(file = %upload.file_name))]
    async fn send_file(
        &self,
        requester_id: RequesterId,
        upload: &Upload,
        progress_tx: mpsc::Sender<TransferProgress>,
    ) -> Result<(), SinkError> {
        if upload.size > self.max_part_size {
            return Err(SinkError::Rejected(format!(
                "{} is {} bytes, the limit is {}",
                upload.file_name, upload.size, self.max_part_size
            )));
        }

        let dir = self.requester_dir(requester_id);
        tokio::fs::create_dir_all(&dir).await?;

        let dest = dir.join(&upload.file_name);
        let copied = Self::copy_with_progress(&upload.path, &dest, upload.size, &progress_tx).await?;
        debug!(bytes = copied, dest = ?dest, "File copied to outbox");

        if let MediaAttachment::Video {
            thumbnail: Some(thumb),
            ..
        } = &upload.media
        {
            tokio::fs::copy(thumb, dir.join(format!("{}.thumb.jpg", upload.file_name))).await?;
        }

        let sidecar = Sidecar {
            file_name: &upload.file_name,
            caption: &upload.caption,
            size: copied,
            media: &upload.media,
            delivered_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| SinkError::Rejected(e.to_string()))?;
        tokio::fs::write(dir.join(format!("{}.json", upload.file_name)), json).await?;

        info!(requester = requester_id, file = %upload.file_name, bytes = copied, "Delivered file");
        Ok(())
    }
}
