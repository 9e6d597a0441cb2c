use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

use super::discover::DeliverableFile;

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0:?} already exists, refusing to overwrite it")]
    PartExists(PathBuf),

    #[error("Part size must be greater than zero")]
    ZeroCeiling,

    #[error("Wrote {written} of {expected} bytes while splitting {path:?}")]
    ShortRead {
        path: PathBuf,
        written: u64,
        expected: u64,
    },
}

/// One physical chunk of a deliverable file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub path: PathBuf,
    pub size: u64,
    /// 1-based
    pub index: usize,
    pub total: usize,
}

impl FilePart {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Parts to deliver for `file`: the file itself when it fits under `ceiling`,
/// otherwise the chunks produced by [`split_file`] (the original is removed).
pub async fn plan_parts(file: &DeliverableFile, ceiling: u64) -> Result<Vec<FilePart>, SplitError> {
    if file.size <= ceiling {
        return Ok(vec![FilePart {
            path: file.path.clone(),
            size: file.size,
            index: 1,
            total: 1,
        }]);
    }

    let parts = split_file(&file.path, ceiling).await?;
    tokio::fs::remove_file(&file.path).await?;
    Ok(parts)
}

fn part_path(path: &Path, index: usize) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.part{index:03}"))
}

/// Splits `path` into sequential `<name>.partNNN` files of `ceiling` bytes.
///
/// The last part holds the remainder. On failure every part written so far is removed.
pub async fn split_file(path: &Path, ceiling: u64) -> Result<Vec<FilePart>, SplitError> {
    if ceiling == 0 {
        return Err(SplitError::ZeroCeiling);
    }

    let size = tokio::fs::metadata(path).await?.len();
    let total = size.div_ceil(ceiling).max(1) as usize;
    info!(path = ?path, size, parts = total, "Splitting file");

    let mut parts = Vec::with_capacity(total);
    let result = write_parts(path, size, ceiling, total, &mut parts).await;
    if let Err(e) = result {
        warn!(path = ?path, error = %e, "Splitting failed, removing partial parts");
        for part in &parts {
            let _ = tokio::fs::remove_file(&part.path).await;
        }
        return Err(e);
    }
    Ok(parts)
}

async fn write_parts(
    path: &Path,
    size: u64,
    ceiling: u64,
    total: usize,
    parts: &mut Vec<FilePart>,
) -> Result<(), SplitError> {
    let mut reader = BufReader::new(File::open(path).await?);

    for index in 1..=total {
        let expected = ceiling.min(size - ceiling * (index as u64 - 1));
        let dest = part_path(path, index);
        // Never clobber a file that came with the download
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => SplitError::PartExists(dest.clone()),
                _ => SplitError::Io(e),
            })?;
        // Tracked from here on so a failure cleans it up too
        parts.push(FilePart {
            path: dest.clone(),
            size: expected,
            index,
            total,
        });

        let mut writer = BufWriter::new(file);
        let mut chunk = (&mut reader).take(expected);
        let written = tokio::io::copy(&mut chunk, &mut writer).await?;
        writer.flush().await?;

        if written != expected {
            return Err(SplitError::ShortRead {
                path: path.to_path_buf(),
                written,
                expected,
            });
        }
        debug!(part = ?dest, bytes = written, "Wrote part");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_split_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ceiling = 1000u64;
        let data = pattern(5 * ceiling as usize + 1);
        let path = dir.path().join("movie.mkv");
        std::fs::write(&path, &data).unwrap();

        let parts = split_file(&path, ceiling).await.unwrap();
        assert_eq!(parts.len(), 6);
        for part in &parts[..5] {
            assert_eq!(part.size, ceiling);
            assert_eq!(std::fs::metadata(&part.path).unwrap().len(), ceiling);
        }
        assert_eq!(parts[5].size, 1);
        assert_eq!(parts[5].file_name(), "movie.mkv.part006");

        let indices: Vec<usize> = parts.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5, 6]);

        let mut joined = Vec::new();
        for part in &parts {
            joined.extend(std::fs::read(&part.path).unwrap());
        }
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_plan_parts_small_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.mp3");
        std::fs::write(&path, pattern(2000)).unwrap();
        let file = DeliverableFile {
            path: path.clone(),
            size: 2000,
        };

        let parts = plan_parts(&file, 2000).await.unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].path, path);
        assert_eq!((parts[0].index, parts[0].total), (1, 1));
    }

    #[tokio::test]
    async fn test_plan_parts_removes_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.iso");
        std::fs::write(&path, pattern(2500)).unwrap();
        let file = DeliverableFile {
            path: path.clone(),
            size: 2500,
        };

        let parts = plan_parts(&file, 1000).await.unwrap();
        assert_eq!(parts.len(), 3);
        assert!(!path.exists());
        assert!(parts.iter().all(|p| p.size <= 1000));
    }

    #[tokio::test]
    async fn test_existing_part_name_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let data = pattern(2500);
        std::fs::write(&path, &data).unwrap();
        let shipped = dir.path().join("a.bin.part002");
        std::fs::write(&shipped, b"came with the torrent").unwrap();
        let file = DeliverableFile {
            path: path.clone(),
            size: 2500,
        };

        let result = plan_parts(&file, 1000).await;
        assert!(matches!(result, Err(SplitError::PartExists(p)) if p == shipped));
        assert_eq!(std::fs::read(&shipped).unwrap(), b"came with the torrent");
        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert!(!dir.path().join("a.bin.part001").exists());
    }

    #[tokio::test]
    async fn test_zero_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        std::fs::write(&path, b"abc").unwrap();
        assert!(matches!(split_file(&path, 0).await, Err(SplitError::ZeroCeiling)));
    }
}
