//! Fetch process supervision
//!
//! Runs one fetch command to a terminal outcome while streaming its output
//! through the progress parser.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use ulid::Ulid;

use super::FetchError;
use super::command::FetchCommand;
use super::progress::{LineEvent, ProgressSample, parse_line};
use super::registry::ProcessRegistry;
use crate::courier::RateLimiter;

const OUTPUT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Longest wait for one line of output before re-checking the process
    pub read_wait: Duration,
    /// Minimum interval between forwarded progress samples
    pub progress_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            read_wait: Duration::from_secs(1),
            progress_interval: Duration::from_secs(5),
        }
    }
}

/// Terminal result of one fetch run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    Failure { exit_code: Option<i32> },
    TimedOut,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct FetchSupervisor {
    registry: Arc<ProcessRegistry>,
    settings: SupervisorSettings,
}

impl FetchSupervisor {
    pub fn new(registry: Arc<ProcessRegistry>, settings: SupervisorSettings) -> Self {
        Self { registry, settings }
    }

    /// Runs `command` until it completes, fails, times out at `deadline` or `cancel` fires.
    ///
    /// Registering the run terminates whatever fetch was running before, for
    /// any requester. Progress samples are forwarded at most once per
    /// `progress_interval` (always at 100%) and dropped if the receiver lags.
    #[instrument(name = "fetch", skip_all, fields(job = %job_id))]
    pub async fn run(
        &self,
        command: &FetchCommand,
        job_id: Ulid,
        cancel: CancellationToken,
        deadline: Instant,
        progress_tx: mpsc::Sender<ProgressSample>,
    ) -> Result<FetchOutcome, FetchError> {
        self.registry.replace(job_id, cancel.clone());
        let result = self.supervise(command, &cancel, deadline, progress_tx).await;
        self.registry.clear(job_id);

        match &result {
            Ok(outcome) => info!(?outcome, "Fetch finished"),
            Err(e) => warn!(error = %e, "Fetch errored"),
        }
        result
    }

    async fn supervise(
        &self,
        command: &FetchCommand,
        cancel: &CancellationToken,
        deadline: Instant,
        progress_tx: mpsc::Sender<ProgressSample>,
    ) -> Result<FetchOutcome, FetchError> {
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Canceled);
        }

        info!(program = %command.program().display(), args = ?command.args(), "Starting fetch");
        let mut child = command
            .to_command()
            .spawn()
            .map_err(|source| FetchError::Spawn {
                program: command.program().display().to_string(),
                source,
            })?;
        let mut lines = merged_output(&mut child)?;
        let mut limiter = RateLimiter::new(self.settings.progress_interval);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Fetch cancelled, terminating process");
                    terminate(&mut child).await;
                    return Ok(FetchOutcome::Canceled);
                }

                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Fetch timed out, terminating process");
                    terminate(&mut child).await;
                    return Ok(FetchOutcome::TimedOut);
                }

                read = tokio::time::timeout(self.settings.read_wait, lines.recv()) => match read {
                    // Nothing to read, only check whether the process is gone
                    Err(_) => {
                        if let Some(status) = child.try_wait()? {
                            return Ok(exit_outcome(status));
                        }
                    }
                    Ok(None) => {
                        let status = child.wait().await?;
                        return Ok(exit_outcome(status));
                    }
                    Ok(Some(line)) => {
                        // Console redraws come as carriage-return separated segments
                        for segment in line.split('\r').map(str::trim).filter(|s| !s.is_empty()) {
                            trace!(line = %segment, "fetch output");
                            match parse_line(segment) {
                                Some(LineEvent::Complete) => {
                                    info!("Download complete reported");
                                    terminate(&mut child).await;
                                    return Ok(FetchOutcome::Success);
                                }
                                Some(LineEvent::Progress(sample)) => {
                                    if limiter.ready(sample.percent >= 100) {
                                        // A lagging consumer just misses this sample
                                        let _ = progress_tx.try_send(sample);
                                    }
                                }
                                None => {}
                            }
                        }
                    }
                }
            }
        }
    }
}

fn exit_outcome(status: ExitStatus) -> FetchOutcome {
    debug!(?status, "Fetch process exited");
    if status.success() {
        FetchOutcome::Success
    } else {
        FetchOutcome::Failure {
            exit_code: status.code(),
        }
    }
}

/// Kills the child and reaps it
async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Error killing fetch process");
    }
}

/// Merges stdout and stderr into one line stream that ends when both close
fn merged_output(child: &mut Child) -> Result<mpsc::Receiver<String>, FetchError> {
    let stdout = child.stdout.take().ok_or(FetchError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(FetchError::MissingPipe("stderr"))?;
    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    forward_lines(stdout, tx.clone());
    forward_lines(stderr, tx);
    Ok(rx)
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Error reading fetch output");
                    break;
                }
            }
        }
    });
}
