//! Process-wide single-flight registry for fetch processes
//!
//! At most one aria2c runs at any time across all requesters. Registering a
//! new fetch cancels whichever fetch was registered before it, so starting a
//! download for requester B terminates requester A's running download.

use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ulid::Ulid;

#[derive(Debug)]
struct RunningFetch {
    job_id: Ulid,
    token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    current: Mutex<Option<RunningFetch>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunningFetch>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `job_id` as the running fetch and terminates the previous one.
    ///
    /// Returns the id of the job that was terminated, if any.
    pub fn replace(&self, job_id: Ulid, token: CancellationToken) -> Option<Ulid> {
        let previous = self.lock().replace(RunningFetch { job_id, token });
        match previous {
            Some(previous) if previous.job_id != job_id => {
                info!(superseded = %previous.job_id, by = %job_id, "Terminating previous fetch process");
                previous.token.cancel();
                Some(previous.job_id)
            }
            _ => None,
        }
    }

    /// Unregisters `job_id` if it is still the running fetch
    pub fn clear(&self, job_id: Ulid) -> bool {
        let mut current = self.lock();
        if current.as_ref().is_some_and(|running| running.job_id == job_id) {
            debug!(job = %job_id, "Fetch process unregistered");
            *current = None;
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> Option<Ulid> {
        self.lock().as_ref().map(|running| running.job_id)
    }

    /// Terminates the running fetch, used on shutdown
    pub fn terminate_current(&self) -> Option<Ulid> {
        let running = self.lock().take()?;
        info!(job = %running.job_id, "Terminating fetch process");
        running.token.cancel();
        Some(running.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_cancels_previous() {
        let registry = ProcessRegistry::new();
        let (first, second) = (Ulid::new(), Ulid::new());
        let first_token = CancellationToken::new();
        let second_token = CancellationToken::new();

        assert_eq!(registry.replace(first, first_token.clone()), None);
        assert_eq!(registry.replace(second, second_token.clone()), Some(first));
        assert!(first_token.is_cancelled());
        assert!(!second_token.is_cancelled());
        assert_eq!(registry.current(), Some(second));
    }

    #[test]
    fn test_clear_only_removes_own_entry() {
        let registry = ProcessRegistry::new();
        let (first, second) = (Ulid::new(), Ulid::new());
        registry.replace(first, CancellationToken::new());
        registry.replace(second, CancellationToken::new());

        assert!(!registry.clear(first));
        assert_eq!(registry.current(), Some(second));
        assert!(registry.clear(second));
        assert_eq!(registry.current(), None);
    }

    #[test]
    fn test_terminate_current() {
        let registry = ProcessRegistry::new();
        let token = CancellationToken::new();
        let job = Ulid::new();
        registry.replace(job, token.clone());

        assert_eq!(registry.terminate_current(), Some(job));
        assert!(token.is_cancelled());
        assert_eq!(registry.terminate_current(), None);
    }
}
