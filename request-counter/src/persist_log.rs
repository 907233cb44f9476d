//! Append-only persistence log of request timestamps.
//!
//! The log is a plain file of fixed-size records (see [`crate::timestamp`]), with no
//! header, checksum or record count. At startup [`PersistenceLog::load`] replays it,
//! dropping stale and corrupt records, and compacts it to only the retained records.
//! After that a single [`LogAppender`] owns the file and appends one record per request.

use crate::timestamp::{self, RECORD_LEN, Timestamp};
use displaydoc::Display;
use std::{
    fs::{self, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// How hard an append tries to make a record durable.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SyncPolicy {
    /// Write and flush to the OS. A crash of the process loses nothing flushed,
    /// but a crash of the machine can lose what is still in the page cache.
    #[default]
    FlushOnly,
    /// Also `fdatasync` after every record.
    SyncData,
}

/// The outcome of a successful load.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Records kept, in file order
    pub retained: Vec<Timestamp>,
    /// Records that decoded but were older than the retention
    pub stale: usize,
    /// Corrupt regions that were skipped
    pub corrupt: usize,
}

/// The step of a load that failed.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum LoadStage {
    /// open
    Open,
    /// read
    Read,
    /// rewrite
    Rewrite,
}

/// could not {stage} persistence log {path}: {source}
#[derive(Debug, Display)]
pub struct LoadError {
    pub path: PathBuf,
    pub stage: LoadStage,
    pub source: io::Error,
    /// Whatever was retained before the failure, so a caller can carry on
    /// degraded instead of aborting.
    pub partial: Vec<Timestamp>,
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// The persistence log file.
#[derive(Clone, Debug)]
pub struct PersistenceLog {
    path: PathBuf,
}

impl PersistenceLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the log and compact it.
    ///
    /// Records older than `cutoff` are dropped, as are corrupt regions, which are
    /// logged and skipped. The file is then rewritten to hold exactly the
    /// retained records in file order. The rewrite goes through a
    /// sibling temp file that is renamed into place, so a crash mid-compaction
    /// leaves either the old or the new log.
    ///
    /// Creates the file (and its parent directory) if it does not exist.
    pub fn load(&self, cutoff: Timestamp) -> Result<LoadReport, LoadError> {
        let fail = |stage, source, partial| LoadError {
            path: self.path.clone(),
            stage,
            source,
            partial,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| fail(LoadStage::Open, err, vec![]))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|err| fail(LoadStage::Open, err, vec![]))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|err| fail(LoadStage::Read, err, vec![]))?;
        drop(file);

        let report = self.scan(&bytes, cutoff);

        if let Err(err) = self.rewrite(&report.retained) {
            return Err(fail(LoadStage::Rewrite, err, report.retained));
        }

        info!(
            "Loaded {}: {} retained, {} stale, {} corrupt ({} -> {} bytes)",
            self.path.display(),
            report.retained.len(),
            report.stale,
            report.corrupt,
            bytes.len(),
            report.retained.len() * RECORD_LEN,
        );
        Ok(report)
    }

    fn scan(&self, bytes: &[u8], cutoff: Timestamp) -> LoadReport {
        let mut report = LoadReport::default();
        let mut pos = 0;

        while pos < bytes.len() {
            match timestamp::decode(&bytes[pos..]) {
                Ok(ts) => {
                    if ts < cutoff {
                        report.stale += 1;
                    } else {
                        report.retained.push(ts);
                    }
                    pos += RECORD_LEN;
                }
                Err(err) => {
                    // Resynchronize at the next offset where a whole record decodes.
                    // A torn write from an unclean shutdown only costs that record.
                    let start = pos;
                    pos += 1;
                    while pos < bytes.len() && timestamp::decode(&bytes[pos..]).is_err() {
                        pos += 1;
                    }
                    report.corrupt += 1;
                    warn!(
                        "Skipped {} corrupt bytes at offset {start} of {}: {err}",
                        pos - start,
                        self.path.display()
                    );
                }
            }
        }
        report
    }

    fn rewrite(&self, retained: &[Timestamp]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(retained.len() * RECORD_LEN);
        for ts in retained {
            buf.extend_from_slice(&timestamp::encode(ts));
        }

        let tmp_path = self.compaction_path();
        let result = write_and_replace(&tmp_path, &self.path, &buf);
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn compaction_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".compact");
        self.path.with_file_name(name)
    }

    /// Open the log for appending. Call this only after [`Self::load`].
    pub async fn open_appender(&self, sync_policy: SyncPolicy) -> io::Result<LogAppender> {
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        Ok(LogAppender { file, sync_policy })
    }
}

fn write_and_replace(tmp_path: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = fs::File::create(tmp_path)?;
    tmp.write_all(bytes)?;
    tmp.sync_all()?;
    fs::rename(tmp_path, path)
}

/// Exclusive append handle on the persistence log.
#[derive(Debug)]
pub struct LogAppender {
    file: tokio::fs::File,
    sync_policy: SyncPolicy,
}

impl LogAppender {
    /// Write one record and flush it to the OS (and to disk, with [`SyncPolicy::SyncData`]).
    ///
    /// A failure part way through can leave a torn record at the end of the file,
    /// which the next load skips.
    pub async fn append(&mut self, ts: &Timestamp) -> io::Result<()> {
        self.file.write_all(&timestamp::encode(ts)).await?;
        self.file.flush().await?;
        if self.sync_policy == SyncPolicy::SyncData {
            self.file.sync_data().await?;
        }
        Ok(())
    }

    /// Flush and sync everything written so far.
    pub async fn sync(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await
    }
}
