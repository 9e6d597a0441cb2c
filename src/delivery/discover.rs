use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

/// Files this small are aria2c leftovers, not content
pub const MIN_DELIVERABLE_SIZE: u64 = 1024;

/// Extensions of fetch-tool control files
const CONTROL_EXTENSIONS: &[&str] = &["aria2", "tmp", "torrent"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverableFile {
    pub path: PathBuf,
    pub size: u64,
}

impl DeliverableFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn is_control_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            CONTROL_EXTENSIONS
                .iter()
                .any(|control| ext.eq_ignore_ascii_case(control))
        })
}

/// Lists deliverable files under `dir` in natural file name order
pub fn discover(dir: &Path) -> Vec<DeliverableFile> {
    let mut files: Vec<DeliverableFile> = jwalk::WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.path();
            if is_control_file(&path) {
                trace!(path = ?path, "Skipping control file");
                return None;
            }
            let size = std::fs::metadata(&path).ok()?.len();
            (size > MIN_DELIVERABLE_SIZE).then_some(DeliverableFile { path, size })
        })
        .collect();

    files.sort_by(|a, b| {
        natural_cmp(&a.file_name(), &b.file_name()).then_with(|| a.path.cmp(&b.path))
    });
    debug!(count = files.len(), dir = ?dir, "Discovered files");
    files
}

#[derive(Debug)]
enum Run<'a> {
    Digits(&'a str),
    Text(&'a str),
}

fn runs(s: &str) -> Vec<Run<'_>> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut digits = None;
    for (index, c) in s.char_indices() {
        let is_digit = c.is_ascii_digit();
        match digits {
            Some(previous) if previous != is_digit => {
                runs.push(make_run(&s[start..index], previous));
                start = index;
            }
            _ => {}
        }
        digits = Some(is_digit);
    }
    if let Some(is_digit) = digits {
        runs.push(make_run(&s[start..], is_digit));
    }
    runs
}

fn make_run(s: &str, is_digit: bool) -> Run<'_> {
    if is_digit { Run::Digits(s) } else { Run::Text(s) }
}

fn cmp_digits(a: &str, b: &str) -> Ordering {
    let a_trimmed = a.trim_start_matches('0');
    let b_trimmed = b.trim_start_matches('0');
    a_trimmed
        .len()
        .cmp(&b_trimmed.len())
        .then_with(|| a_trimmed.cmp(b_trimmed))
        .then_with(|| a.len().cmp(&b.len()))
}

fn cmp_text(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

/// Human ordering of names: digit runs compare by value, the rest case-insensitively
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (a_runs, b_runs) = (runs(a), runs(b));
    for (x, y) in a_runs.iter().zip(&b_runs) {
        let ordering = match (x, y) {
            (Run::Digits(x), Run::Digits(y)) => cmp_digits(x, y),
            (Run::Text(x), Run::Text(y)) => cmp_text(x, y),
            (Run::Digits(_), Run::Text(_)) => Ordering::Less,
            (Run::Text(_), Run::Digits(_)) => Ordering::Greater,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a_runs.len().cmp(&b_runs.len())
}
