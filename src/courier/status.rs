use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use ulid::Ulid;

use super::{Courier, SinkError};
use crate::request::RequesterId;

/// Lets an update through at most once per `min_interval`, or whenever forced
#[derive(Debug, Clone)]
pub struct RateLimiter {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            min_interval,
        }
    }

    /// Returns true if an update may be emitted now and records it
    pub fn ready(&mut self, force: bool) -> bool {
        self.ready_at(Instant::now(), force)
    }

    pub fn ready_at(&mut self, now: Instant, force: bool) -> bool {
        let due = force
            || self
                .last_emit
                .is_none_or(|last| now.saturating_duration_since(last) >= self.min_interval);
        if due {
            self.last_emit = Some(now);
        }
        due
    }
}

/// Keeps one job's status message up to date.
///
/// Unchanged text is skipped, `NotModified` and `MessageGone` count as
/// delivered, and rate limiting is retried a bounded number of times using the
/// delay the courier asked for. While a cancellation token is attached the
/// backoff sleep gives up as soon as the job is cancelled.
pub struct StatusReporter<C: Courier> {
    courier: Arc<C>,
    job_id: Ulid,
    requester_id: RequesterId,
    retry_limit: u32,
    last_text: Option<String>,
    cancel: Option<CancellationToken>,
}

impl<C: Courier> StatusReporter<C> {
    pub fn new(courier: Arc<C>, job_id: Ulid, requester_id: RequesterId, retry_limit: u32) -> Self {
        Self {
            courier,
            job_id,
            requester_id,
            retry_limit,
            last_text: None,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Final reports must go out even for cancelled jobs
    pub fn detach_cancellation(&mut self) {
        self.cancel = None;
    }

    pub fn job_id(&self) -> Ulid {
        self.job_id
    }

    /// Sends `text`. Returns whether the requester can see it.
    pub async fn update(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        if self.last_text.as_deref() == Some(text.as_str()) {
            return true;
        }

        let mut attempt = 0;
        loop {
            match self
                .courier
                .notify(self.job_id, self.requester_id, &text)
                .await
            {
                Ok(()) | Err(SinkError::NotModified) | Err(SinkError::MessageGone) => {
                    self.last_text = Some(text);
                    return true;
                }
                Err(SinkError::RateLimited { retry_after }) => {
                    attempt += 1;
                    if attempt > self.retry_limit {
                        warn!(job = %self.job_id, attempts = attempt, "Giving up on rate-limited status update");
                        return false;
                    }
                    debug!(job = %self.job_id, ?retry_after, attempt, "Status update rate limited");
                    if !self.backoff(retry_after).await {
                        return false;
                    }
                }
                Err(e) => {
                    error!(job = %self.job_id, error = %e, "Error updating status");
                    return false;
                }
            }
        }
    }

    /// Sleeps for `delay`; returns false if the job got cancelled meanwhile
    async fn backoff(&self, delay: Duration) -> bool {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            },
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::courier::{TransferProgress, Upload};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Fails with the scripted errors first, then records every text
    #[derive(Default)]
    struct ScriptedCourier {
        failures: Mutex<Vec<SinkError>>,
        texts: Mutex<Vec<String>>,
    }

    impl Courier for ScriptedCourier {
        async fn notify(
            &self,
            _job_id: Ulid,
            _requester_id: RequesterId,
            text: &str,
        ) -> Result<(), SinkError> {
            if let Some(err) = self.failures.lock().unwrap().pop() {
                return Err(err);
            }
            self.texts.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_file(
            &self,
            _requester_id: RequesterId,
            _upload: &Upload,
            _progress_tx: mpsc::Sender<TransferProgress>,
        ) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn rate_limited(ms: u64) -> SinkError {
        SinkError::RateLimited {
            retry_after: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_rate_limiter_interval() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(Duration::from_secs(5));

        assert!(limiter.ready_at(start, false));
        assert!(!limiter.ready_at(start + Duration::from_secs(2), false));
        assert!(limiter.ready_at(start + Duration::from_secs(3), true));
        assert!(!limiter.ready_at(start + Duration::from_secs(7), false));
        assert!(limiter.ready_at(start + Duration::from_secs(8), false));
    }

    #[tokio::test]
    async fn test_retries_after_rate_limit() {
        let courier = Arc::new(ScriptedCourier::default());
        courier
            .failures
            .lock()
            .unwrap()
            .extend([rate_limited(10), rate_limited(10)]);

        let mut reporter = StatusReporter::new(courier.clone(), Ulid::new(), 1, 5);
        assert!(reporter.update("hello").await);
        assert_eq!(*courier.texts.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_gives_up_after_retry_limit() {
        let courier = Arc::new(ScriptedCourier::default());
        courier
            .failures
            .lock()
            .unwrap()
            .extend((0..3).map(|_| rate_limited(1)));

        let mut reporter = StatusReporter::new(courier.clone(), Ulid::new(), 1, 2);
        assert!(!reporter.update("hello").await);
        assert!(courier.texts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let courier = Arc::new(ScriptedCourier::default());
        courier.failures.lock().unwrap().push(rate_limited(60_000));
        let token = CancellationToken::new();
        token.cancel();

        let mut reporter =
            StatusReporter::new(courier, Ulid::new(), 1, 5).with_cancellation(token);
        let result = tokio::time::timeout(Duration::from_secs(5), reporter.update("x")).await;
        assert_eq!(result.ok(), Some(false));
    }

    #[tokio::test]
    async fn test_unchanged_and_not_modified_are_noops() {
        let courier = Arc::new(ScriptedCourier::default());
        let mut reporter = StatusReporter::new(courier.clone(), Ulid::new(), 1, 5);

        assert!(reporter.update("same").await);
        assert!(reporter.update("same").await);
        assert_eq!(courier.texts.lock().unwrap().len(), 1);

        courier.failures.lock().unwrap().push(SinkError::NotModified);
        assert!(reporter.update("other").await);
        assert_eq!(courier.texts.lock().unwrap().len(), 1);
    }
}
