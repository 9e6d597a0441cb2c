//! Descriptor (`.torrent`) file handling
//!
//! Descriptors given by URL are downloaded into the job's working directory;
//! uploaded descriptors are staged under the download root until their job
//! starts and then moved into its working directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{
    Client, Url,
    header::{self, HeaderMap, HeaderValue},
};
use thiserror::Error;
use tracing::{debug, info, instrument, trace};

use crate::request::{RequesterId, strip_descriptor_suffix};
use crate::util::{sanitize_filename, unix_millis};

const USER_AGENT: &str = "Mozilla/5.0";

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Descriptor at {0} is empty")]
    Empty(String),
}

/// Downloads descriptor files over HTTP(S)
#[derive(Debug, Clone)]
pub struct DescriptorFetcher {
    client: Client,
}

impl DescriptorFetcher {
    pub fn new(timeout: Duration) -> Result<Self, DescriptorError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Downloads `url` into `dir` and returns the path of the saved descriptor
    #[instrument(level = "debug", skip(self, dir))]
    pub async fn fetch(&self, url: &str, dir: &Path) -> Result<PathBuf, DescriptorError> {
        let response = self.client.get(url).send().await?.error_for_status()?;

        let from_header = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_disposition);
        let filename = from_header
            .or_else(|| filename_from_url(url))
            .unwrap_or_else(|| format!("download_{}", unix_millis()));
        let filename = descriptor_filename(&filename);

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(DescriptorError::Empty(url.to_string()));
        }

        let path = dir.join(&filename);
        tokio::fs::write(&path, &bytes).await?;
        info!(path = ?path, bytes = bytes.len(), "Descriptor downloaded");
        Ok(path)
    }
}

/// Normalizes a descriptor file name: sanitized and ending in `.torrent`
pub fn descriptor_filename(name: &str) -> String {
    let name = sanitize_filename(name);
    if strip_descriptor_suffix(&name).is_some() {
        name
    } else {
        format!("{name}.torrent")
    }
}

fn filename_from_url(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let name = url.path_segments()?.next_back()?;
    let name = urlencoding::decode(name).ok()?.into_owned();
    (!name.is_empty()).then_some(name)
}

/// Parse filename from Content-Disposition header
/// Returns Some(filename) if successful, None otherwise
#[tracing::instrument(level = "trace", ret)]
pub fn parse_content_disposition(content_disposition: &str) -> Option<String> {
    // filename*=UTF-8''... (RFC 5987) takes precedence over the plain form
    if let Some(pos) = content_disposition.find("filename*=") {
        let value = &content_disposition[pos + "filename*=".len()..];
        let value = value.split(';').next().unwrap_or_default().trim();
        let encoded = value.rsplit("''").next().unwrap_or(value).trim_matches('"');
        if let Ok(decoded) = urlencoding::decode(encoded) {
            if !decoded.is_empty() {
                trace!(filename = %decoded, "Found encoded filename");
                return Some(decoded.into_owned());
            }
        }
    }

    // filename="..." (RFC 6266)
    if let Some(pos) = content_disposition.find("filename=\"") {
        let start = pos + "filename=\"".len();
        if let Some(end) = content_disposition[start..].find('"') {
            let filename = content_disposition[start..(start + end)].to_string();
            trace!(filename = %filename, "Found quoted filename");
            return Some(filename);
        }
    }

    // filename=... (without quotes)
    if let Some(pos) = content_disposition.find("filename=") {
        let start = pos + "filename=".len();
        let end = content_disposition[start..]
            .find(|c: char| c.is_whitespace() || c == ';')
            .unwrap_or(content_disposition[start..].len());

        if end > 0 {
            let filename = content_disposition[start..(start + end)].to_string();
            trace!(filename = %filename, "Found unquoted filename");
            return Some(filename);
        }
    }

    trace!("No filename found");
    None
}

/// Stores an uploaded descriptor under `root` until its job starts
pub async fn stage_upload(
    root: &Path,
    requester_id: RequesterId,
    bytes: &[u8],
) -> Result<PathBuf, DescriptorError> {
    if bytes.is_empty() {
        return Err(DescriptorError::Empty("upload".to_string()));
    }
    tokio::fs::create_dir_all(root).await?;
    let path = root.join(format!("upload_{requester_id}_{}.torrent", unix_millis()));
    tokio::fs::write(&path, bytes).await?;
    debug!(path = ?path, "Staged uploaded descriptor");
    Ok(path)
}

/// Moves a staged descriptor into `dir`, copying when a rename is not possible
pub async fn adopt_staged(staged: &Path, dir: &Path) -> Result<PathBuf, DescriptorError> {
    let name = staged
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("upload_{}.torrent", unix_millis()));
    let dest = dir.join(descriptor_filename(&name));

    if tokio::fs::rename(staged, &dest).await.is_err() {
        tokio::fs::copy(staged, &dest).await?;
        tokio::fs::remove_file(staged).await?;
    }
    debug!(from = ?staged, to = ?dest, "Descriptor moved into working directory");
    Ok(dest)
}
