//! The partial-file store: a `.part` file per in-flight transfer, append-only
//! writes, and an atomic rename to the final name only once every expected
//! byte has arrived.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::error::TransferError;

/// An open `.part` file a `Transfer` appends to.
pub struct PartialFile {
    part_path: PathBuf,
    final_path: PathBuf,
    file: tokio::fs::File,
    /// Bytes already on disk — either 0 for a fresh download or the size of
    /// a pre-existing `.part` file when resuming.
    pub received: u64,
}

impl PartialFile {
    /// Create (or reopen, for resume) the `.part` file for `filename` inside
    /// `dest_dir`. `dest_dir` is created recursively if missing. Any
    /// trailing path separators on `dest_dir` are tolerated.
    ///
    /// When `resume` is `false` and a `.part` file already exists, it is
    /// unlinked first so the transfer restarts from zero.
    pub async fn open(dest_dir: &Path, filename: &str, resume: bool) -> Result<Self, TransferError> {
        let dest_dir = strip_trailing_separators(dest_dir);
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|source| TransferError::DestinationDir {
                path: dest_dir.clone(),
                source,
            })?;

        let final_path = dest_dir.join(filename);
        let part_path = part_path_for(&final_path);

        let mut existing = match tokio::fs::metadata(&part_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(source) => {
                return Err(TransferError::PartialStat {
                    path: part_path,
                    source,
                })
            }
        };

        if !resume && existing > 0 {
            tokio::fs::remove_file(&part_path)
                .await
                .map_err(|source| TransferError::PartialUnlink {
                    path: part_path.clone(),
                    source,
                })?;
            existing = 0;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part_path)
            .await
            .map_err(|source| TransferError::PartialOpen {
                path: part_path.clone(),
                source,
            })?;

        Ok(Self {
            part_path,
            final_path,
            file,
            received: existing,
        })
    }

    /// Resume offset to request via `DCC RESUME`/expect via `DCC ACCEPT`,
    /// i.e. the number of bytes already on disk.
    pub fn resume_offset(&self) -> u64 {
        self.received
    }

    /// Append `buf` to the `.part` file, bumping `received`.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), TransferError> {
        self.file.write_all(buf).await.map_err(TransferError::Write)?;
        self.received += buf.len() as u64;
        Ok(())
    }

    /// Rename the `.part` file to its final name. Only succeeds, per the
    /// completion invariant, when every expected byte has arrived
    /// (`received == file_size && file_size > 0`); a zero-length
    /// `file_size` never completes (the offer carried no size, so there is
    /// nothing to compare against and the transfer ends only when the peer
    /// closes the connection and `force` records it as done anyway).
    ///
    /// On rename failure the `.part` file is left exactly where it was.
    pub async fn finalize(mut self, file_size: u64, force: bool) -> Result<PathBuf, TransferError> {
        self.file
            .flush()
            .await
            .map_err(TransferError::Write)?;

        let complete = force || (file_size > 0 && self.received == file_size);
        if !complete {
            return Err(TransferError::ShortTransfer {
                received: self.received,
                expected: file_size,
            });
        }

        tokio::fs::rename(&self.part_path, &self.final_path)
            .await
            .map_err(|source| TransferError::Rename {
                from: self.part_path.clone(),
                to: self.final_path.clone(),
                source,
            })?;

        Ok(self.final_path)
    }
}

fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

fn strip_trailing_separators(dir: &Path) -> PathBuf {
    let s = dir.to_string_lossy();
    let trimmed = s.trim_end_matches(['/', '\\']);
    PathBuf::from(if trimmed.is_empty() { s.as_ref() } else { trimmed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_download_starts_at_zero_and_completes() {
        let dir = tempdir();
        let mut pf = PartialFile::open(&dir, "a.bin", true).await.unwrap();
        assert_eq!(pf.resume_offset(), 0);
        pf.write(b"hello").await.unwrap();
        let final_path = pf.finalize(5, false).await.unwrap();
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"hello");
        assert!(!dir.join("a.bin.part").exists());
    }

    #[tokio::test]
    async fn resume_picks_up_existing_part_size() {
        let dir = tempdir();
        {
            let mut pf = PartialFile::open(&dir, "a.bin", true).await.unwrap();
            pf.write(b"hel").await.unwrap();
            // do not finalize: simulate an interrupted transfer
        }
        let pf = PartialFile::open(&dir, "a.bin", true).await.unwrap();
        assert_eq!(pf.resume_offset(), 3);
    }

    #[tokio::test]
    async fn resume_disabled_truncates_existing_part() {
        let dir = tempdir();
        {
            let mut pf = PartialFile::open(&dir, "a.bin", true).await.unwrap();
            pf.write(b"hel").await.unwrap();
        }
        let pf = PartialFile::open(&dir, "a.bin", false).await.unwrap();
        assert_eq!(pf.resume_offset(), 0);
    }

    #[tokio::test]
    async fn short_transfer_leaves_part_file_in_place() {
        let dir = tempdir();
        let mut pf = PartialFile::open(&dir, "a.bin", true).await.unwrap();
        pf.write(b"hel").await.unwrap();
        let err = pf.finalize(5, false).await.unwrap_err();
        assert!(matches!(err, TransferError::ShortTransfer { received: 3, expected: 5 }));
        assert!(dir.join("a.bin.part").exists());
    }

    fn tempdir() -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "xdcc-transfer-test-{}",
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        dir
    }
}
