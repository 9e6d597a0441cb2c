//! Outbound side of the service
//!
//! A [`Courier`] is whatever carries status text and files back to a
//! requester. The engine only talks to this trait; [`OutboxCourier`] is the
//! implementation shipped with the binary.

mod outbox;
mod status;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::request::RequesterId;

pub use outbox::{OutboxCourier, StatusEntry};
pub use status::{RateLimiter, StatusReporter};

#[derive(Error, Debug)]
pub enum SinkError {
    /// The transport asks us to slow down and retry after the given delay
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The status text is identical to what is already shown
    #[error("Status message not modified")]
    NotModified,

    /// The status message no longer exists on the transport side
    #[error("Status message is gone")]
    MessageGone,

    #[error("Transfer rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte progress of one file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub current: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.current as f64 * 100.0 / self.total as f64
    }
}

/// How a file is presented to the requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaAttachment {
    Video {
        thumbnail: Option<PathBuf>,
        duration_secs: u64,
    },
    Audio {
        duration_secs: u64,
    },
    Image,
    Document,
}

/// One file (or file part) ready to be transferred
#[derive(Debug, Clone, Serialize)]
pub struct Upload {
    pub path: PathBuf,
    pub file_name: String,
    pub caption: String,
    pub size: u64,
    pub media: MediaAttachment,
}

/// Notification sink and file transport for requesters
pub trait Courier: Send + Sync + 'static {
    /// Shows `text` as the current status of a job.
    ///
    /// Implementations report rate limiting through [`SinkError::RateLimited`]
    /// instead of sleeping themselves; retrying is up to [`StatusReporter`].
    fn notify(
        &self,
        job_id: Ulid,
        requester_id: RequesterId,
        text: &str,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Transfers one file, reporting byte progress through `progress_tx`
    fn send_file(
        &self,
        requester_id: RequesterId,
        upload: &Upload,
        progress_tx: mpsc::Sender<TransferProgress>,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}
