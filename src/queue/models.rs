//! Data structures for the job queue
//!
//! Status values, snapshots returned by the job listing, and the ticket a
//! submitter gets back to follow its job.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use ulid::Ulid;

use crate::delivery::DeliveryReport;
use crate::request::{RequesterId, Source};

/// Lifecycle of a job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the requester's FIFO
    #[default]
    Queued,
    /// Popped; working directory created, fetch not started yet
    Pending,
    Fetching,
    Delivering,
    Succeeded,
    Failed(String),
    Canceled,
}

impl JobStatus {
    /// The job has finished one way or another
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Canceled)
    }

    /// The job has been popped and is being worked on
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Fetching | Self::Delivering)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "Queued"),
            Self::Pending => write!(f, "Pending"),
            Self::Fetching => write!(f, "Fetching"),
            Self::Delivering => write!(f, "Delivering"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed(reason) => write!(f, "Failed: {reason}"),
            Self::Canceled => write!(f, "Canceled"),
        }
    }
}

/// Point-in-time view of a job, as shown by the job listing
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Ulid,
    pub requester_id: RequesterId,
    pub source: Source,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<DeliveryReport>,
    /// Latest status text shown to the requester
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Returned by a successful submission to follow the job
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub id: Ulid,
    status_rx: watch::Receiver<JobStatus>,
}

impl JobTicket {
    pub(crate) fn new(id: Ulid, status_rx: watch::Receiver<JobStatus>) -> Self {
        Self { id, status_rx }
    }

    /// Latest status
    pub fn status(&self) -> JobStatus {
        self.status_rx.borrow().clone()
    }

    /// Waits for a terminal status.
    ///
    /// If the queue drops the job without a terminal status it is reported as canceled.
    pub async fn wait_until_done(&mut self) -> JobStatus {
        let result = self
            .status_rx
            .wait_for(JobStatus::is_terminal)
            .await
            .map(|status| status.clone());
        match result {
            Ok(status) => status,
            Err(_) => {
                let last = self.status_rx.borrow().clone();
                if last.is_terminal() {
                    last
                } else {
                    JobStatus::Canceled
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(JobStatus::Failed("x".into()).is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(JobStatus::Fetching.is_active());
        assert!(!JobStatus::Queued.is_active());
        assert_eq!(JobStatus::Failed("boom".into()).to_string(), "Failed: boom");
    }

    #[tokio::test]
    async fn test_ticket_waits_for_terminal() {
        let (tx, rx) = watch::channel(JobStatus::Queued);
        let mut ticket = JobTicket::new(Ulid::new(), rx);

        let waiter = tokio::spawn(async move { ticket.wait_until_done().await });
        tx.send_replace(JobStatus::Fetching);
        tx.send_replace(JobStatus::Succeeded);
        assert_eq!(waiter.await.unwrap(), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_ticket_dropped_sender_reads_as_canceled() {
        let (tx, rx) = watch::channel(JobStatus::Pending);
        let mut ticket = JobTicket::new(Ulid::new(), rx);
        drop(tx);
        assert_eq!(ticket.wait_until_done().await, JobStatus::Canceled);
    }
}
