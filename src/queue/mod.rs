//! Job queue
//!
//! Accepts validated requests, keeps one FIFO per requester and runs each job
//! through fetching and delivery.

mod job;
mod manager;
mod models;

pub use job::JobError;
pub use manager::{JobQueueManager, QueueSettings, SubmitError};
pub use models::{JobSnapshot, JobStatus, JobTicket};
