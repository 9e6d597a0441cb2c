//! Inbound requests
//!
//! Validates what a requester sends (a magnet locator, a URL pointing at a
//! `.torrent` descriptor, or an uploaded descriptor file) and turns it into an
//! immutable [`Request`] for the queue.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Identifies whoever submitted a request, e.g. a chat user id
pub type RequesterId = i64;

static MAGNET_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^magnet:\?xt=urn:btih:[a-f0-9]+").unwrap());

static DESCRIPTOR_URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^https?://.*\.torrent(?:\?.*)?$").unwrap());

const DESCRIPTOR_EXTENSION: &str = ".torrent";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please send a valid magnet link, .torrent URL, or .torrent file")]
    UnsupportedLocator,

    #[error("Uploaded file {0:?} is not a .torrent file")]
    NotADescriptor(String),

    #[error("Uploaded descriptor is empty")]
    EmptyDescriptor,
}

/// Where the content comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Source {
    /// A `magnet:?xt=urn:btih:` locator
    Magnet(String),
    /// A remote `.torrent` descriptor
    DescriptorUrl(String),
    /// A descriptor already on disk (uploaded and staged)
    DescriptorFile(PathBuf),
}

impl Source {
    /// Validates a text locator
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let text = text.trim();
        if MAGNET_REGEX.is_match(text) {
            Ok(Self::Magnet(text.to_string()))
        } else if DESCRIPTOR_URL_REGEX.is_match(text) {
            Ok(Self::DescriptorUrl(text.to_string()))
        } else {
            Err(ValidationError::UnsupportedLocator)
        }
    }

    /// Validates the original name of an uploaded descriptor. The file itself is staged by the caller.
    pub fn check_upload_name(file_name: &str) -> Result<(), ValidationError> {
        if strip_descriptor_suffix(file_name).is_some() {
            Ok(())
        } else {
            Err(ValidationError::NotADescriptor(file_name.to_string()))
        }
    }

    /// Path of a staged descriptor that still belongs to this request
    pub fn staged_path(&self) -> Option<&Path> {
        match self {
            Self::DescriptorFile(path) => Some(path),
            _ => None,
        }
    }
}

/// A queued content-acquisition request. Its id becomes the job id once it is processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Ulid,
    pub requester_id: RequesterId,
    pub source: Source,
    pub enqueued_at: DateTime<Utc>,
}

impl Request {
    pub fn new(requester_id: RequesterId, source: Source) -> Self {
        Self {
            id: Ulid::new(),
            requester_id,
            source,
            enqueued_at: Utc::now(),
        }
    }
}

/// Derives a display name from a magnet locator.
///
/// Uses the `dn` parameter when present, otherwise `Torrent-` followed by the
/// first eight characters of the info-hash.
pub fn magnet_display_name(locator: &str) -> String {
    let locator = locator.trim().replace(' ', "%20");
    let Ok(url) = url::Url::parse(&locator) else {
        return "Unknown-Torrent".to_string();
    };

    let mut info_hash = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "dn" if !value.is_empty() => return value.into_owned(),
            "xt" if info_hash.is_none() => {
                info_hash = value.rsplit("urn:btih:").next().map(str::to_string)
            }
            _ => {}
        }
    }

    match info_hash {
        Some(hash) if !hash.is_empty() => {
            let prefix: String = hash.chars().take(8).collect();
            format!("Torrent-{}", prefix.to_uppercase())
        }
        _ => "Unknown-Torrent".to_string(),
    }
}

/// Display name of a descriptor file: its file name without the `.torrent` suffix
pub fn descriptor_display_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    strip_descriptor_suffix(&name)
        .map(str::to_string)
        .unwrap_or(name)
}

/// Returns the name without a case-insensitive `.torrent` suffix, or `None` if it has none
pub fn strip_descriptor_suffix(name: &str) -> Option<&str> {
    let split = name.len().checked_sub(DESCRIPTOR_EXTENSION.len())?;
    let suffix = name.get(split..)?;
    suffix
        .eq_ignore_ascii_case(DESCRIPTOR_EXTENSION)
        .then(|| &name[..split])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_magnet() {
        let source = Source::parse("  magnet:?xt=urn:btih:ABCDEF0123456789&dn=x ").unwrap();
        assert_eq!(
            source,
            Source::Magnet("magnet:?xt=urn:btih:ABCDEF0123456789&dn=x".to_string())
        );
    }

    #[test]
    fn test_accepts_descriptor_url() {
        let source = Source::parse("HTTPS://example.com/files/ubuntu.torrent?sig=1").unwrap();
        assert!(matches!(source, Source::DescriptorUrl(_)));
    }

    #[test]
    fn test_rejects_everything_else() {
        for text in [
            "hello",
            "magnet:?xt=urn:sha1:abc",
            "https://example.com/file.zip",
            "ftp://example.com/a.torrent",
        ] {
            assert_eq!(
                Source::parse(text),
                Err(ValidationError::UnsupportedLocator),
                "{text}"
            );
        }
    }

    #[test]
    fn test_upload_name() {
        assert!(Source::check_upload_name("Linux.ISO.TORRENT").is_ok());
        assert!(Source::check_upload_name("notes.txt").is_err());
    }

    #[test]
    fn test_magnet_name_from_dn() {
        let name = magnet_display_name("magnet:?xt=urn:btih:0123456789abcdef&dn=My%20File");
        assert_eq!(name, "My File");
    }

    #[test]
    fn test_magnet_name_from_hash() {
        let name = magnet_display_name("magnet:?xt=urn:btih:abcdef0123456789");
        assert_eq!(name, "Torrent-ABCDEF01");
    }

    #[test]
    fn test_magnet_name_with_raw_spaces() {
        let name = magnet_display_name("magnet:?xt=urn:btih:abcdef01&dn=Some Show S01");
        assert_eq!(name, "Some Show S01");
    }

    #[test]
    fn test_descriptor_display_name() {
        assert_eq!(
            descriptor_display_name(Path::new("/tmp/x/Big.Movie.torrent")),
            "Big.Movie"
        );
    }
}
