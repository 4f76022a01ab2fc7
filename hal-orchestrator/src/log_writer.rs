//! Per-task output log (spec.md §4.D / SPEC_FULL.md §4.D). One append-only
//! file under `data/logs/<taskId>.log`, opened once and reused across poll
//! iterations rather than reopened per write — grounded on the teacher's
//! `logger.rs` preference for a single long-lived file handle over
//! per-line opens.

use hal_common::HalResult;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub struct TaskLogWriter {
    file: File,
    path: PathBuf,
}

impl TaskLogWriter {
    /// Opens (creating if absent) `<dir>/<task_id>.log` in append mode.
    ///
    /// # Errors
    ///
    /// Returns `HalError::Other` if the file cannot be created or opened.
    pub async fn open(dir: &Path, task_id: Uuid) -> HalResult<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| hal_common::HalError::Other(e.into()))?;
        let path = dir.join(format!("{task_id}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| hal_common::HalError::Other(e.into()))?;
        Ok(Self { file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&mut self, chunk: &[u8]) -> HalResult<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| hal_common::HalError::Other(e.into()))?;
        self.file
            .flush()
            .await
            .map_err(|e| hal_common::HalError::Other(e.into()))
    }

    /// Writes the sentinel line exactly once, at collect time (SPEC_FULL.md
    /// §4.D, P6).
    pub async fn write_sentinel(&mut self, exit_code: i64) -> HalResult<()> {
        self.append(format!("\n---HAL9999-DONE exit={exit_code}---\n").as_bytes())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_sentinel_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let task_id = Uuid::new_v4();
        let mut w = TaskLogWriter::open(dir.path(), task_id).await.unwrap();
        w.append(b"hello\n").await.unwrap();
        w.append(b"world\n").await.unwrap();
        w.write_sentinel(0).await.unwrap();

        let contents = tokio::fs::read_to_string(w.path()).await.unwrap();
        assert!(contents.starts_with("hello\nworld\n"));
        assert!(contents.ends_with("---HAL9999-DONE exit=0---\n"));
    }

    #[tokio::test]
    async fn reopen_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let task_id = Uuid::new_v4();
        {
            let mut w = TaskLogWriter::open(dir.path(), task_id).await.unwrap();
            w.append(b"first\n").await.unwrap();
        }
        let mut w = TaskLogWriter::open(dir.path(), task_id).await.unwrap();
        w.append(b"second\n").await.unwrap();
        let contents = tokio::fs::read_to_string(w.path()).await.unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }
}
