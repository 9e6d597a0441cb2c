//! Per-requester job queues
//!
//! Every requester gets a FIFO of pending requests drained by a single task.
//! The task is started by the first submission and tears the requester's entry
//! down once nothing is pending or active, under the same lock submissions
//! take, so a request can never be left behind without a drain task.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

use super::models::{JobSnapshot, JobStatus, JobTicket};
use crate::config::BusyPolicy;
use crate::courier::Courier;
use crate::delivery::{DeliveryPipeline, DeliveryReport, DeliverySettings};
use crate::fetch::{
    Aria2Options, DescriptorError, DescriptorFetcher, FetchSupervisor, ProcessRegistry,
    SupervisorSettings,
};
use crate::request::{Request, RequesterId};
use crate::util::unix_millis;

/// Everything the queue needs to run jobs
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Parent of all working directories and staged uploads
    pub download_dir: PathBuf,
    pub busy_policy: BusyPolicy,
    /// Pause between two jobs of the same requester
    pub cooldown: Duration,
    /// Wall-clock limit for a fetch, counted from the moment the job starts
    pub fetch_timeout: Duration,
    pub descriptor_timeout: Duration,
    pub status_retry_limit: u32,
    pub aria2: Aria2Options,
    pub supervisor: SupervisorSettings,
    pub delivery: DeliverySettings,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            busy_policy: BusyPolicy::default(),
            cooldown: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(1800),
            descriptor_timeout: Duration::from_secs(30),
            status_retry_limit: 5,
            aria2: Aria2Options::default(),
            supervisor: SupervisorSettings::default(),
            delivery: DeliverySettings::default(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Requester {requester} already has a download in progress")]
    Busy { requester: RequesterId },

    #[error("The queue is shutting down")]
    ShuttingDown,
}

pub(super) struct JobEntry {
    pub(super) request: Request,
    pub(super) status_tx: watch::Sender<JobStatus>,
    pub(super) display_name: Option<String>,
    pub(super) started_at: Option<DateTime<Utc>>,
    pub(super) finished_at: Option<DateTime<Utc>>,
    pub(super) working_dir: Option<PathBuf>,
    pub(super) report: Option<DeliveryReport>,
}

impl JobEntry {
    fn new(request: Request, status_tx: watch::Sender<JobStatus>) -> Self {
        Self {
            request,
            status_tx,
            display_name: None,
            started_at: None,
            finished_at: None,
            working_dir: None,
            report: None,
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.request.id,
            requester_id: self.request.requester_id,
            source: self.request.source.clone(),
            status: self.status_tx.borrow().clone(),
            enqueued_at: self.request.enqueued_at,
            display_name: self.display_name.clone(),
            started_at: self.started_at,
            working_dir: self.working_dir.clone(),
            report: self.report,
            message: None,
        }
    }

    fn finish(&mut self, status: JobStatus) {
        self.finished_at = Some(Utc::now());
        self.status_tx.send_replace(status);
    }
}

struct ActiveJob {
    id: Ulid,
    token: CancellationToken,
    working_dir: PathBuf,
    /// Uploaded descriptor not yet moved into `working_dir`
    staged: Option<PathBuf>,
}

#[derive(Default)]
struct RequesterQueue {
    pending: VecDeque<Request>,
    active: Option<ActiveJob>,
    drain: Option<JoinHandle<()>>,
}

impl RequesterQueue {
    fn outstanding(&self) -> usize {
        self.pending.len() + usize::from(self.active.is_some())
    }
}

#[derive(Default)]
pub(super) struct QueueState {
    requesters: HashMap<RequesterId, RequesterQueue>,
    pub(super) jobs: BTreeMap<Ulid, JobEntry>,
    shutting_down: bool,
}

pub(super) struct Inner<C: Courier> {
    pub(super) courier: Arc<C>,
    pub(super) supervisor: FetchSupervisor,
    pub(super) pipeline: DeliveryPipeline<C>,
    pub(super) descriptors: DescriptorFetcher,
    pub(super) settings: QueueSettings,
    state: Mutex<QueueState>,
}

impl<C: Courier> Inner<C> {
    pub(super) fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn update_job(&self, job_id: Ulid, f: impl FnOnce(&mut JobEntry)) {
        if let Some(entry) = self.lock_state().jobs.get_mut(&job_id) {
            f(entry);
        }
    }

    pub(super) fn set_status(&self, job_id: Ulid, status: JobStatus) {
        debug!(job = %job_id, %status, "Job status changed");
        self.update_job(job_id, |entry| {
            entry.status_tx.send_replace(status);
        });
    }

    /// Pops the next request and records it as active, or removes the
    /// requester's entry when nothing is left.
    fn next_job(&self, requester_id: RequesterId) -> Option<(Request, CancellationToken, PathBuf)> {
        let mut state = self.lock_state();
        let QueueState {
            requesters, jobs, ..
        } = &mut *state;

        let queue = requesters.get_mut(&requester_id)?;
        let Some(request) = queue.pending.pop_front() else {
            requesters.remove(&requester_id);
            debug!(requester = requester_id, "Requester queue drained");
            return None;
        };

        let working_dir = self
            .settings
            .download_dir
            .join(format!("user_{requester_id}_{}", unix_millis()));
        let token = CancellationToken::new();
        queue.active = Some(ActiveJob {
            id: request.id,
            token: token.clone(),
            working_dir: working_dir.clone(),
            staged: request.source.staged_path().map(Path::to_path_buf),
        });

        if let Some(entry) = jobs.get_mut(&request.id) {
            entry.started_at = Some(Utc::now());
            entry.working_dir = Some(working_dir.clone());
            entry.status_tx.send_replace(JobStatus::Pending);
        }
        Some((request, token, working_dir))
    }

    /// Records the terminal status and clears the active slot.
    /// Returns whether more requests are waiting.
    fn finish_job(&self, requester_id: RequesterId, job_id: Ulid, status: JobStatus) -> bool {
        let mut state = self.lock_state();
        if let Some(entry) = state.jobs.get_mut(&job_id) {
            entry.finish(status);
        }
        match state.requesters.get_mut(&requester_id) {
            Some(queue) => {
                if queue.active.as_ref().is_some_and(|active| active.id == job_id) {
                    queue.active = None;
                }
                !queue.pending.is_empty()
            }
            None => false,
        }
    }

    #[instrument(skip(self))]
    async fn drain(self: Arc<Self>, requester_id: RequesterId) {
        while let Some((request, token, working_dir)) = self.next_job(requester_id) {
            let job_id = request.id;
            let staged = request.source.staged_path().map(Path::to_path_buf);

            info!(job = %job_id, dir = ?working_dir, "Starting job");
            // Run the job on its own task so a panic only takes down this job
            let runner = self.clone();
            let job_dir = working_dir.clone();
            let task = tokio::spawn(async move { runner.run_job(request, token, job_dir).await });
            let status = match task.await {
                Ok(status) => status,
                Err(e) => {
                    error!(job = %job_id, error = %e, "Job task failed");
                    JobStatus::Failed("internal error".to_string())
                }
            };

            remove_working_dir(&working_dir).await;
            if let Some(staged) = staged {
                let _ = tokio::fs::remove_file(staged).await;
            }

            info!(job = %job_id, %status, "Job finished");
            let more = self.finish_job(requester_id, job_id, status);
            if more && !self.settings.cooldown.is_zero() {
                tokio::time::sleep(self.settings.cooldown).await;
            }
        }
    }
}

async fn remove_working_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = ?dir, "Working directory removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = ?dir, error = %e, "Failed to remove working directory"),
    }
}

/// Accepts requests and runs them, one at a time per requester
pub struct JobQueueManager<C: Courier> {
    inner: Arc<Inner<C>>,
}

impl<C: Courier> Clone for JobQueueManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Courier> JobQueueManager<C> {
    pub fn new(
        courier: Arc<C>,
        registry: Arc<ProcessRegistry>,
        settings: QueueSettings,
    ) -> Result<Self, DescriptorError> {
        let descriptors = DescriptorFetcher::new(settings.descriptor_timeout)?;
        let supervisor = FetchSupervisor::new(registry, settings.supervisor.clone());
        let pipeline = DeliveryPipeline::new(courier.clone(), settings.delivery.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                courier,
                supervisor,
                pipeline,
                descriptors,
                settings,
                state: Mutex::new(QueueState::default()),
            }),
        })
    }

    /// Queues `request` according to the busy policy.
    ///
    /// Starts the requester's drain task if none is running.
    #[instrument(skip(self, request), fields(job = %request.id, requester = request.requester_id))]
    pub fn submit(&self, request: Request) -> Result<JobTicket, SubmitError> {
        let requester_id = request.requester_id;
        let job_id = request.id;

        let mut state = self.inner.lock_state();
        if state.shutting_down {
            return Err(SubmitError::ShuttingDown);
        }
        let QueueState {
            requesters, jobs, ..
        } = &mut *state;

        let queue = requesters.entry(requester_id).or_default();
        if queue.outstanding() > 0 {
            match self.inner.settings.busy_policy {
                BusyPolicy::Reject => {
                    info!(outstanding = queue.outstanding(), "Requester busy, rejecting request");
                    return Err(SubmitError::Busy {
                        requester: requester_id,
                    });
                }
                BusyPolicy::Queue => {}
                BusyPolicy::Supersede => {
                    if let Some(active) = &queue.active {
                        info!(superseded = %active.id, "Canceling active job for newer request");
                        active.token.cancel();
                    }
                }
            }
        }

        let (status_tx, status_rx) = watch::channel(JobStatus::Queued);
        jobs.insert(job_id, JobEntry::new(request.clone(), status_tx));
        queue.pending.push_back(request);
        info!(pending = queue.pending.len(), "Request queued");

        if queue.drain.is_none() {
            let inner = self.inner.clone();
            queue.drain = Some(tokio::spawn(inner.drain(requester_id)));
        }

        Ok(JobTicket::new(job_id, status_rx))
    }

    /// Cancels an active job or drops a pending one. Returns false for unknown or finished jobs.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: Ulid) -> bool {
        let dropped = {
            let mut state = self.inner.lock_state();
            let QueueState {
                requesters, jobs, ..
            } = &mut *state;

            let mut dropped = None;
            for queue in requesters.values_mut() {
                if let Some(active) = queue.active.as_ref().filter(|a| a.id == job_id) {
                    info!("Canceling active job");
                    active.token.cancel();
                    return true;
                }
                if let Some(position) = queue.pending.iter().position(|r| r.id == job_id) {
                    dropped = queue.pending.remove(position);
                    break;
                }
            }

            let Some(request) = dropped else {
                debug!("No such outstanding job");
                return false;
            };
            if let Some(entry) = jobs.get_mut(&job_id) {
                entry.finish(JobStatus::Canceled);
            }
            info!("Pending request dropped");
            request
        };

        if let Some(staged) = dropped.source.staged_path() {
            let _ = tokio::fs::remove_file(staged).await;
        }
        true
    }

    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        self.inner
            .lock_state()
            .jobs
            .values()
            .map(JobEntry::snapshot)
            .collect()
    }

    pub fn job(&self, job_id: &Ulid) -> Option<JobSnapshot> {
        self.inner.lock_state().jobs.get(job_id).map(JobEntry::snapshot)
    }

    /// Id of the requester's active job
    pub fn active_job(&self, requester_id: RequesterId) -> Option<Ulid> {
        self.inner
            .lock_state()
            .requesters
            .get(&requester_id)
            .and_then(|queue| queue.active.as_ref().map(|active| active.id))
    }

    /// Pending plus active jobs of a requester
    pub fn outstanding(&self, requester_id: RequesterId) -> usize {
        self.inner
            .lock_state()
            .requesters
            .get(&requester_id)
            .map_or(0, RequesterQueue::outstanding)
    }

    /// Forgets finished jobs. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut state = self.inner.lock_state();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, entry| !entry.status_tx.borrow().is_terminal());
        let removed = before - state.jobs.len();
        if removed > 0 {
            info!(removed, "Removed finished jobs");
        }
        removed
    }

    /// Paths under the download root that belong to outstanding jobs
    pub fn protected_paths(&self) -> Vec<PathBuf> {
        let state = self.inner.lock_state();
        state
            .requesters
            .values()
            .flat_map(|queue| {
                let staged = queue
                    .pending
                    .iter()
                    .filter_map(|request| request.source.staged_path().map(Path::to_path_buf));
                queue
                    .active
                    .iter()
                    .flat_map(|active| {
                        std::iter::once(active.working_dir.clone()).chain(active.staged.clone())
                    })
                    .chain(staged)
            })
            .collect()
    }

    /// Stops accepting requests, cancels everything outstanding and waits for the drain tasks
    pub async fn shutdown(&self) {
        let (handles, staged) = {
            let mut state = self.inner.lock_state();
            state.shutting_down = true;
            let QueueState {
                requesters, jobs, ..
            } = &mut *state;

            let mut handles = Vec::new();
            let mut staged = Vec::new();
            for queue in requesters.values_mut() {
                if let Some(active) = &queue.active {
                    active.token.cancel();
                }
                for request in queue.pending.drain(..) {
                    if let Some(entry) = jobs.get_mut(&request.id) {
                        entry.finish(JobStatus::Canceled);
                    }
                    staged.extend(request.source.staged_path().map(Path::to_path_buf));
                }
                handles.extend(queue.drain.take());
            }
            (handles, staged)
        };

        info!(tasks = handles.len(), "Shutting down job queue");
        for path in staged {
            let _ = tokio::fs::remove_file(path).await;
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Drain task failed");
            }
        }
    }
}
