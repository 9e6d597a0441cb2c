//! Config module for torrent-courier

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::delivery::{DeliverySettings, MediaProbe};
use crate::fetch::{Aria2Options, DEFAULT_TRACKERS, SupervisorSettings};
use crate::queue::QueueSettings;

/// What happens when a requester submits while a job of theirs is outstanding
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[clap(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Refuse the request with a busy signal
    #[default]
    Reject,
    /// Append the request to the requester's FIFO
    Queue,
    /// Append the request and cancel the active job
    Supersede,
}

#[derive(Parser, Debug, Clone)]
pub struct FetchConfig {
    /// Path to the aria2c binary
    #[clap(long, env = "COURIER_ARIA2C", default_value = "aria2c")]
    pub aria2c_path: PathBuf,

    /// Wall-clock limit for a single fetch, in seconds
    #[clap(long, env = "COURIER_FETCH_TIMEOUT", default_value_t = 1800)]
    pub fetch_timeout_secs: u64,

    /// How long to wait for a line of fetch output before re-checking the process
    #[clap(long, env = "COURIER_READ_WAIT_MS", default_value_t = 1000)]
    pub read_wait_ms: u64,

    /// Minimum interval between two progress updates, in seconds
    #[clap(long, env = "COURIER_PROGRESS_INTERVAL", default_value_t = 5)]
    pub progress_interval_secs: u64,

    /// Trackers passed to aria2c on top of those in the locator
    #[clap(
        long,
        env = "COURIER_TRACKERS",
        value_delimiter = ',',
        default_values_t = DEFAULT_TRACKERS.iter().map(|t| t.to_string()).collect::<Vec<_>>()
    )]
    pub trackers: Vec<String>,

    /// Timeout for downloading a descriptor file from a URL, in seconds
    #[clap(long, env = "COURIER_DESCRIPTOR_TIMEOUT", default_value_t = 30)]
    pub descriptor_timeout_secs: u64,
}

impl FetchConfig {
    /// Trackers with empty entries filtered out
    pub fn get_valid_trackers(&self) -> Vec<String> {
        self.trackers
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DeliveryConfig {
    /// Largest single transfer, in bytes. Bigger files are split into parts of this size.
    #[clap(long, env = "COURIER_MAX_PART_SIZE", default_value_t = crate::delivery::MAX_PART_SIZE)]
    pub max_part_size: u64,

    #[clap(long, env = "COURIER_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg_path: PathBuf,

    #[clap(long, env = "COURIER_FFPROBE", default_value = "ffprobe")]
    pub ffprobe_path: PathBuf,

    /// Time limit for thumbnail extraction and duration probing, in seconds
    #[clap(long, env = "COURIER_PROBE_TIMEOUT", default_value_t = 30)]
    pub probe_timeout_secs: u64,

    /// Directory the outbox courier delivers files into
    #[clap(long, env = "COURIER_OUTBOX_DIR", default_value = "outbox")]
    pub outbox_dir: PathBuf,
}

#[derive(Parser, Debug, Clone)]
pub struct QueueConfig {
    #[clap(long, env = "COURIER_BUSY_POLICY", value_enum, default_value = "reject")]
    pub busy_policy: BusyPolicy,

    /// Pause between two jobs of the same requester, in milliseconds
    #[clap(long, env = "COURIER_COOLDOWN_MS", default_value_t = 1000)]
    pub cooldown_ms: u64,

    /// How many times a rate-limited status update is retried
    #[clap(long, env = "COURIER_STATUS_RETRIES", default_value_t = 5)]
    pub status_retry_limit: u32,
}

#[derive(Parser, Debug, Clone)]
pub struct SweepConfig {
    /// Cron expression for the stale working directory sweep
    #[clap(long, env = "COURIER_SWEEP_SCHEDULE", default_value = "0 0 * * * * *")]
    pub sweep_schedule: String,

    /// Entries older than this many seconds are removed by the sweep
    #[clap(long, env = "COURIER_RETENTION", default_value_t = 3600)]
    pub retention_secs: u64,
}

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
pub struct Config {
    #[clap(long, env = "COURIER_HOST", default_value = "0.0.0.0:8080")]
    pub host: String,

    /// Root directory for per-job working directories and staged uploads
    #[clap(long, env = "COURIER_DOWNLOAD_DIR", default_value = "downloads")]
    pub download_dir: PathBuf,

    #[clap(long, env = "COURIER_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    #[clap(flatten)]
    pub fetch: FetchConfig,

    #[clap(flatten)]
    pub delivery: DeliveryConfig,

    #[clap(flatten)]
    pub queue: QueueConfig,

    #[clap(flatten)]
    pub sweep: SweepConfig,
}

impl Config {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.sweep.retention_secs)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        let progress_interval = Duration::from_secs(self.fetch.progress_interval_secs);
        QueueSettings {
            download_dir: self.download_dir.clone(),
            busy_policy: self.queue.busy_policy,
            cooldown: Duration::from_millis(self.queue.cooldown_ms),
            fetch_timeout: Duration::from_secs(self.fetch.fetch_timeout_secs),
            descriptor_timeout: Duration::from_secs(self.fetch.descriptor_timeout_secs),
            status_retry_limit: self.queue.status_retry_limit,
            aria2: Aria2Options {
                program: self.fetch.aria2c_path.clone(),
                trackers: self.fetch.get_valid_trackers(),
            },
            supervisor: SupervisorSettings {
                read_wait: Duration::from_millis(self.fetch.read_wait_ms),
                progress_interval,
            },
            delivery: DeliverySettings {
                max_part_size: self.delivery.max_part_size,
                progress_interval,
                probe: MediaProbe {
                    ffmpeg: self.delivery.ffmpeg_path.clone(),
                    ffprobe: self.delivery.ffprobe_path.clone(),
                    timeout: Duration::from_secs(self.delivery.probe_timeout_secs),
                },
            },
        }
    }
}

pub fn config() -> Config {
    Config::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_constants() {
        let config = Config::try_parse_from(["torrent-courier"]).unwrap();
        let settings = config.queue_settings();

        assert_eq!(settings.fetch_timeout, Duration::from_secs(1800));
        assert_eq!(settings.supervisor.read_wait, Duration::from_secs(1));
        assert_eq!(settings.supervisor.progress_interval, Duration::from_secs(5));
        assert_eq!(settings.delivery.max_part_size, 2000 * 1024 * 1024);
        assert_eq!(settings.aria2.trackers.len(), DEFAULT_TRACKERS.len());
        assert_eq!(config.retention(), Duration::from_secs(3600));
    }

    #[test]
    fn test_busy_policy_flag() {
        let config =
            Config::try_parse_from(["torrent-courier", "--busy-policy", "supersede"]).unwrap();
        assert_eq!(config.queue.busy_policy, BusyPolicy::Supersede);
    }

    #[test]
    fn test_empty_trackers_filtered() {
        let config =
            Config::try_parse_from(["torrent-courier", "--trackers", "udp://a:1,,udp://b:2"])
                .unwrap();
        assert_eq!(
            config.fetch.get_valid_trackers(),
            vec!["udp://a:1".to_string(), "udp://b:2".to_string()]
        );
    }
}
