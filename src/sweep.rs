//! Periodic cleanup of the download root
//!
//! Working directories are removed by their job, but a crash or a kill can
//! leave some behind. The sweep deletes top-level entries older than the
//! retention window unless they belong to an outstanding job.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

use crate::courier::OutboxCourier;
use crate::queue::JobQueueManager;

/// Removes entries of `root` last modified at least `retention` ago.
///
/// Entries listed in `protected` are kept. Returns how many were removed;
/// failures on single entries are logged and skipped.
pub async fn sweep_once(
    root: &Path,
    retention: Duration,
    protected: &[PathBuf],
) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if protected.contains(&path) {
            debug!(path = ?path, "Skipping entry of an outstanding job");
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read metadata");
                continue;
            }
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < retention {
            continue;
        }

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => {
                info!(path = ?path, age_secs = age.as_secs(), "Removed stale entry");
                removed += 1;
            }
            Err(e) => error!(path = ?path, error = %e, "Failed to remove stale entry"),
        }
    }
    Ok(removed)
}

pub struct Sweeper {
    manager: JobQueueManager<OutboxCourier>,
    courier: Arc<OutboxCourier>,
    root: PathBuf,
    retention: Duration,
}

impl Sweeper {
    pub fn new(
        manager: JobQueueManager<OutboxCourier>,
        courier: Arc<OutboxCourier>,
        root: PathBuf,
        retention: Duration,
    ) -> Self {
        Self {
            manager,
            courier,
            root,
            retention,
        }
    }

    /// One pass: stale directories, finished jobs and their status messages
    #[instrument(name = "sweep", skip(self))]
    pub async fn sweep(&self) -> usize {
        let protected = self.manager.protected_paths();
        let removed = match sweep_once(&self.root, self.retention, &protected).await {
            Ok(removed) => removed,
            Err(e) => {
                error!(root = ?self.root, error = %e, "Sweep failed");
                0
            }
        };

        self.manager.cleanup();
        let live: HashSet<Ulid> = self.manager.list_jobs().iter().map(|job| job.id).collect();
        self.courier.retain_statuses(|id| live.contains(id));

        info!(removed, "Sweep finished");
        removed
    }

    /// Sweeps once now, then on every tick of `schedule` until `shutdown` fires
    pub async fn run(self, schedule: Schedule, shutdown: CancellationToken) {
        self.sweep().await;

        loop {
            let now = chrono::Local::now();
            let Some(next_time) = schedule.upcoming(chrono::Local).next() else {
                error!("Failed to determine next sweep time");
                return;
            };
            let wait = (next_time - now).to_std().unwrap_or_default();
            info!(
                "Next sweep at {} (in {} minutes)",
                next_time.format("%Y-%m-%d %H:%M:%S"),
                wait.as_secs() / 60
            );

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Sweeper stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
            self.sweep().await;
        }
    }
}
