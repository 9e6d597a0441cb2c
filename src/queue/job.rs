//! One iteration of a requester's drain loop: resolve the source, fetch,
//! deliver, and report the outcome to the requester.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use super::manager::Inner;
use super::models::JobStatus;
use crate::courier::{Courier, StatusReporter};
use crate::delivery::{DeliveryError, DeliveryReport};
use crate::fetch::descriptor::adopt_staged;
use crate::fetch::{DescriptorError, FetchError, FetchOutcome, ProgressSample};
use crate::request::{Request, Source, descriptor_display_name, magnet_display_name};
use crate::util::{format_elapsed, human_size, progress_bar};

/// Everything that can end a job early
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Could not get the .torrent file: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Download failed ({})", exit_description(.exit_code))]
    FetchFailed { exit_code: Option<i32> },

    #[error("Download timed out after {0}")]
    TimedOut(String),

    #[error("No files found after download")]
    NothingFound,

    #[error(transparent)]
    Delivery(DeliveryError),

    #[error("Job canceled")]
    Canceled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DeliveryError> for JobError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::Canceled => Self::Canceled,
            DeliveryError::NothingFound(_) => Self::NothingFound,
            e => Self::Delivery(e),
        }
    }
}

fn exit_description(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_string(),
    }
}

impl<C: Courier> Inner<C> {
    /// Runs one job to a terminal status. Never fails; errors become the status.
    #[instrument(name = "job", skip_all, fields(job = %request.id, requester = request.requester_id))]
    pub(super) async fn run_job(
        self: Arc<Self>,
        request: Request,
        token: CancellationToken,
        working_dir: PathBuf,
    ) -> JobStatus {
        let started = Instant::now();
        let deadline = started + self.settings.fetch_timeout;
        let mut status = StatusReporter::new(
            self.courier.clone(),
            request.id,
            request.requester_id,
            self.settings.status_retry_limit,
        )
        .with_cancellation(token.clone());
        status.update("🔄 Processing started...").await;

        let result = self
            .execute(&request, &token, &working_dir, deadline, &mut status)
            .await;

        status.detach_cancellation();
        let elapsed = format_elapsed(started.elapsed());
        let (final_status, text) = match result {
            Ok(report) => {
                self.update_job(request.id, |entry| entry.report = Some(report));
                (JobStatus::Succeeded, completion_text(&report, &elapsed))
            }
            Err(JobError::Canceled) => {
                info!("Job canceled");
                (JobStatus::Canceled, "🚫 Download canceled".to_string())
            }
            Err(e) => {
                error!(error = %e, "Job failed");
                (JobStatus::Failed(e.to_string()), format!("❌ Processing failed: {e}"))
            }
        };
        status.update(text).await;
        final_status
    }

    async fn execute(
        &self,
        request: &Request,
        token: &CancellationToken,
        working_dir: &Path,
        deadline: Instant,
        status: &mut StatusReporter<C>,
    ) -> Result<DeliveryReport, JobError> {
        if token.is_cancelled() {
            return Err(JobError::Canceled);
        }
        tokio::fs::create_dir_all(working_dir).await?;

        let (target, display_name) = self
            .resolve_source(&request.source, working_dir, status)
            .await?;
        let name = display_name.clone();
        self.update_job(request.id, |entry| entry.display_name = Some(name));

        status
            .update(format!("📥 Starting download for {display_name}..."))
            .await;
        self.set_status(request.id, JobStatus::Fetching);

        let command = self.settings.aria2.command(working_dir, &target);
        let (progress_tx, progress_rx) = mpsc::channel(8);
        let (outcome, ()) = tokio::join!(
            self.supervisor
                .run(&command, request.id, token.clone(), deadline, progress_tx),
            report_fetch(&display_name, progress_rx, status),
        );

        match outcome? {
            FetchOutcome::Success => {}
            FetchOutcome::Failure { exit_code } => {
                return Err(JobError::FetchFailed { exit_code });
            }
            FetchOutcome::TimedOut => {
                return Err(JobError::TimedOut(format_elapsed(
                    self.settings.fetch_timeout,
                )));
            }
            FetchOutcome::Canceled => return Err(JobError::Canceled),
        }
        if token.is_cancelled() {
            return Err(JobError::Canceled);
        }

        self.set_status(request.id, JobStatus::Delivering);
        let report = self
            .pipeline
            .deliver(request.requester_id, working_dir, status, token)
            .await?;
        Ok(report)
    }

    /// Returns what to hand to aria2c and the display name of the job
    async fn resolve_source(
        &self,
        source: &Source,
        working_dir: &Path,
        status: &mut StatusReporter<C>,
    ) -> Result<(String, String), JobError> {
        match source {
            Source::Magnet(locator) => Ok((locator.clone(), magnet_display_name(locator))),
            Source::DescriptorUrl(url) => {
                status.update("📥 Downloading .torrent file...").await;
                let path = self.descriptors.fetch(url, working_dir).await?;
                let name = descriptor_display_name(&path);
                status
                    .update(format!(
                        "📥 Torrent file ready: {name}\n🚀 Starting content download..."
                    ))
                    .await;
                Ok((path.display().to_string(), name))
            }
            Source::DescriptorFile(staged) => {
                let path = adopt_staged(staged, working_dir).await?;
                let name = descriptor_display_name(&path);
                Ok((path.display().to_string(), name))
            }
        }
    }
}

async fn report_fetch<C: Courier>(
    name: &str,
    mut progress_rx: mpsc::Receiver<ProgressSample>,
    status: &mut StatusReporter<C>,
) {
    while let Some(sample) = progress_rx.recv().await {
        status.update(fetch_progress_text(name, &sample)).await;
    }
}

fn fetch_progress_text(name: &str, sample: &ProgressSample) -> String {
    let eta = sample
        .eta
        .map(format_elapsed)
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "📩 Downloading...\n🪺 Torrent: {name}\n📦 Progress: {}/{} ({}%)\n🔸 {} 🔸\n🚀 Speed: {}/s | ⏳ ETA: {eta}",
        human_size(sample.bytes_done),
        human_size(sample.bytes_total),
        sample.percent,
        progress_bar(f64::from(sample.percent)),
        human_size(sample.rate),
    )
}

fn completion_text(report: &DeliveryReport, elapsed: &str) -> String {
    let mut text = format!(
        "✅ Done in {elapsed}: delivered {} of {} parts",
        report.delivered,
        report.attempted()
    );
    if report.failed > 0 {
        text.push_str(&format!(", {} failed", report.failed));
    }
    text
}
