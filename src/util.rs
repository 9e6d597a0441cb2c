use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytesize::ByteSize;

const BAR_LENGTH: usize = 20;

/// Formats a byte count with binary units, e.g. `1.5 MiB`
pub fn human_size(bytes: u64) -> String {
    ByteSize::b(bytes).display().iec().to_string()
}

/// Renders a fixed-width progress bar. Out of range percentages are clamped.
pub fn progress_bar(percent: f64) -> String {
    let percent = if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    };
    let filled = (BAR_LENGTH as f64 * percent / 100.0).round() as usize;
    let empty = BAR_LENGTH - filled;
    format!("{}{}", "█".repeat(filled), "░".repeat(empty))
}

/// Formats a duration as `1h 2m 3s`
pub fn format_elapsed(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Replaces characters that are not allowed in file names
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .trim()
        .chars()
        .map(|c| match c {
            '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

pub fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
