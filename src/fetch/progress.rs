//! Parsing of aria2c console output
//!
//! aria2c prints a summary line such as
//! `[#2089b0 400KiB/1.2MiB(32%) CN:1 DL:115KiB ETA:6s]` every summary interval
//! and a `Download complete:` notice when a download finishes. Everything else
//! is noise as far as the supervisor is concerned.

use std::str::FromStr;
use std::time::Duration;

use bytesize::ByteSize;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static PROGRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[#\w+\s+([\d.]+\w*)/([\d.]+\w*)\((\d+)%\)\s+.*DL:([\d.]+\w*).*ETA:(\w+)\]")
        .unwrap()
});

static ETA_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").unwrap());

const COMPLETE_SENTINEL: &str = "Download complete:";
/// aria2c reports the magnet metadata download with the same notice
const METADATA_MARKER: &str = "[METADATA]";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSample {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub percent: u32,
    /// Transfer rate in bytes per second
    pub rate: u64,
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Progress(ProgressSample),
    /// The payload finished downloading
    Complete,
}

/// Parses one line of fetch output. Lines that match neither form yield `None`.
pub fn parse_line(line: &str) -> Option<LineEvent> {
    if line.contains(COMPLETE_SENTINEL) && !line.contains(METADATA_MARKER) {
        return Some(LineEvent::Complete);
    }
    parse_progress(line).map(LineEvent::Progress)
}

fn parse_progress(line: &str) -> Option<ProgressSample> {
    let caps = PROGRESS_REGEX.captures(line)?;
    Some(ProgressSample {
        bytes_done: parse_amount(&caps[1])?,
        bytes_total: parse_amount(&caps[2])?,
        percent: caps[3].parse().ok()?,
        rate: parse_amount(&caps[4])?,
        eta: parse_eta(&caps[5]),
    })
}

fn parse_amount(text: &str) -> Option<u64> {
    ByteSize::from_str(text).ok().map(|size| size.as_u64())
}

fn parse_eta(text: &str) -> Option<Duration> {
    let caps = ETA_REGEX.captures(text)?;
    let mut secs = 0u64;
    let mut any = false;
    for (index, unit) in [(1, 3600u64), (2, 60), (3, 1)] {
        if let Some(value) = caps.get(index) {
            secs = secs.checked_add(value.as_str().parse::<u64>().ok()?.checked_mul(unit)?)?;
            any = true;
        }
    }
    any.then(|| Duration::from_secs(secs))
}
