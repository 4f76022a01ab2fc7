//! Task Manager (spec.md §2 row E, SPEC_FULL.md §4.E). Thin CRUD +
//! transition layer over the `tasks` table — the actual guarded
//! transitions live in `Store` (mirroring the teacher's
//! `state_machine.rs` pattern of keeping transitions as small, auditable
//! SQL statements); this module owns id/slug generation and the
//! higher-level operations built from those primitives.

use chrono::Utc;
use hal_common::{HalResult, Task, TaskStatus};
use std::sync::Arc;
use uuid::Uuid;

use crate::store::Store;

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "deft", "eager", "fleet", "gentle", "honest", "idle", "jolly",
    "keen", "lucid", "mellow", "nimble", "orderly", "plucky", "quiet", "ready", "stark", "tidy",
];
const NOUNS: &[&str] = &[
    "falcon", "harbor", "juniper", "kestrel", "lantern", "meadow", "otter", "pepper", "quartz",
    "raven", "summit", "thicket", "umbra", "violet", "willow", "yarrow", "zephyr", "basalt",
    "cedar", "dune",
];

/// `adjective-noun` slug derived from the task's UUID (spec.md §3
/// "human-friendly unique slug"), deterministic so it never collides with
/// itself on retry and never needs a database round trip to generate.
#[must_use]
pub fn slugify(id: Uuid) -> String {
    let bytes = id.as_bytes();
    let a = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let n = NOUNS[bytes[1] as usize % NOUNS.len()];
    format!("{a}-{n}-{}", &id.to_string()[..4])
}

/// Default feature branch name (spec.md §4.G step 6).
#[must_use]
pub fn default_branch(id: Uuid) -> String {
    format!("hal/{}", &id.to_string()[..8])
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub repo_url: String,
    pub context: String,
    pub agent: String,
    pub branch: Option<String>,
}

pub struct TaskManager {
    store: Arc<Store>,
}

impl TaskManager {
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Creates a `pending` task row (spec.md §4.H `StartTask`/`RunTask`
    /// entry step).
    pub async fn create(&self, new: NewTask) -> HalResult<Task> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let task = Task {
            id,
            slug: slugify(id),
            repo_url: new.repo_url,
            context: new.context,
            agent: new.agent,
            status: TaskStatus::Pending,
            vm_id: None,
            result: None,
            exit_code: None,
            branch: Some(new.branch.unwrap_or_else(|| default_branch(id))),
            pr_url: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.store.insert_task(&task).await?;
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> HalResult<Task> {
        self.store.get_task(id).await
    }

    pub async fn mark_running(&self, id: Uuid) -> HalResult<()> {
        self.store.mark_task_running(id).await
    }

    /// Single entry point for forcing a non-terminal task to `failed`
    /// (spec.md §4.E, used by `recover`, stale-heartbeat orphan release,
    /// and the agent wall-clock timeout path). Returns `true` if the
    /// task actually transitioned (idempotent against an already-terminal
    /// task, T1).
    pub async fn force_fail(&self, id: Uuid, reason: &str) -> HalResult<bool> {
        self.store.force_fail_task(id, reason, None).await
    }

    pub async fn complete(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: &str,
        exit_code: Option<i64>,
        pr_url: Option<&str>,
    ) -> HalResult<bool> {
        self.store.complete_task(id, status, result, exit_code, pr_url).await
    }

    /// The heartbeat (spec.md §9 "Heartbeat without a dedicated
    /// channel") — every poll-like loop MUST call this.
    pub async fn heartbeat(&self, id: Uuid) -> HalResult<()> {
        self.store.touch_task(id).await
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> HalResult<Vec<Task>> {
        self.store.list_tasks_by_status(status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(slugify(id), slugify(id));
        assert!(slugify(id).contains('-'));
    }

    #[tokio::test]
    async fn create_then_get_round_trip() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let tm = TaskManager::new(store);
        let created = tm
            .create(NewTask {
                repo_url: "https://example.com/r.git".to_string(),
                context: "do the thing".to_string(),
                agent: "claude".to_string(),
                branch: None,
            })
            .await
            .unwrap();
        let fetched = tm.get(created.id).await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn force_fail_is_monotone_terminal() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let tm = TaskManager::new(store);
        let created = tm
            .create(NewTask {
                repo_url: "r".to_string(),
                context: "c".to_string(),
                agent: "claude".to_string(),
                branch: None,
            })
            .await
            .unwrap();

        assert!(tm.force_fail(created.id, "boom").await.unwrap());
        let fetched = tm.get(created.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Failed);
        let completed_at = fetched.completed_at;

        // A second force-fail is a no-op (T1: no resurrection, no change).
        assert!(!tm.force_fail(created.id, "again").await.unwrap());
        let refetched = tm.get(created.id).await.unwrap();
        assert_eq!(refetched.result.as_deref(), Some("boom"));
        assert_eq!(refetched.completed_at, completed_at);
    }
}
