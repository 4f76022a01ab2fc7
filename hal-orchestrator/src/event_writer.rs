//! Per-task JSONL event stream (spec.md §4.D / SPEC_FULL.md §4.D).
//! Grounded on the teacher's `bus.rs` tagged-union-over-serde shape for
//! `TaskEvent` itself; the writer here owns the monotone `seq` counter
//! (never the caller, P5) and is constructed once per task by
//! `execute_task` — no global registry, since there is no inter-task
//! shared mutable state except the store.

use chrono::Utc;
use hal_common::{EventEnvelope, HalError, HalResult, TaskEvent};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub struct TaskEventWriter {
    file: File,
    path: PathBuf,
    task_id: Uuid,
    seq: u64,
}

impl TaskEventWriter {
    /// Opens (creating if absent) `<dir>/<task_id>.jsonl` in append mode.
    /// `seq` always starts at 0 — each task gets a fresh stream, it is
    /// never resumed across a crash (a recovered task's `Recover` path
    /// emits a new `TaskEnd` onto whatever stream already exists on disk,
    /// continuing the counter from the last line instead).
    ///
    /// # Errors
    ///
    /// Returns `HalError::Other` if the file cannot be created or opened,
    /// or `HalError::Other` if an existing stream's last line cannot be
    /// parsed while recovering the counter.
    pub async fn open(dir: &Path, task_id: Uuid) -> HalResult<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| HalError::Other(e.into()))?;
        let path = dir.join(format!("{task_id}.jsonl"));
        let seq = Self::next_seq_from_existing(&path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| HalError::Other(e.into()))?;
        Ok(Self { file, path, task_id, seq })
    }

    async fn next_seq_from_existing(path: &Path) -> HalResult<u64> {
        let Ok(contents) = tokio::fs::read_to_string(path).await else {
            return Ok(0);
        };
        let last = contents.lines().last();
        match last {
            None => Ok(0),
            Some(line) => {
                let envelope: EventEnvelope =
                    serde_json::from_str(line).map_err(|e| HalError::Other(e.into()))?;
                Ok(envelope.seq + 1)
            }
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn emit(&mut self, event: TaskEvent) -> HalResult<()> {
        let envelope = EventEnvelope {
            task_id: self.task_id.to_string(),
            timestamp: Utc::now(),
            seq: self.seq,
            event,
        };
        self.seq += 1;

        let mut line = serde_json::to_string(&envelope).map_err(|e| HalError::Other(e.into()))?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| HalError::Other(e.into()))?;
        self.file.flush().await.map_err(|e| HalError::Other(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal_common::{FinalStatus, Phase};

    #[tokio::test]
    async fn seq_is_monotone_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let task_id = Uuid::new_v4();
        let mut w = TaskEventWriter::open(dir.path(), task_id).await.unwrap();
        w.emit(TaskEvent::TaskStart {
            repo_url: "r".to_string(),
            context: "c".to_string(),
            agent: "claude".to_string(),
        })
        .await
        .unwrap();
        w.emit(TaskEvent::Phase { name: Phase::Clone }).await.unwrap();
        w.emit(TaskEvent::TaskEnd {
            status: FinalStatus::Completed,
            exit_code: Some(0),
            error: None,
            pr_url: None,
        })
        .await
        .unwrap();

        let contents = tokio::fs::read_to_string(w.path()).await.unwrap();
        let seqs: Vec<u64> = contents
            .lines()
            .map(|l| serde_json::from_str::<EventEnvelope>(l).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn reopening_continues_the_counter() {
        let dir = tempfile::tempdir().unwrap();
        let task_id = Uuid::new_v4();
        {
            let mut w = TaskEventWriter::open(dir.path(), task_id).await.unwrap();
            w.emit(TaskEvent::TaskStart {
                repo_url: "r".to_string(),
                context: "c".to_string(),
                agent: "claude".to_string(),
            })
            .await
            .unwrap();
        }
        let mut w = TaskEventWriter::open(dir.path(), task_id).await.unwrap();
        assert_eq!(w.seq, 1);
        w.emit(TaskEvent::Phase { name: Phase::Clone }).await.unwrap();
        let contents = tokio::fs::read_to_string(w.path()).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
