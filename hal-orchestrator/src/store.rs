//! The Store (spec.md §4.A). Single-writer SQLite in WAL mode —
//! `write_pool` is capped at one connection so every mutation serializes
//! through SQLite's own lock, mirroring the teacher's reliance on
//! Postgres transactions for atomic multi-row updates
//! (`state_machine.rs`'s guarded `UPDATE ... WHERE status = 'x'` idiom)
//! without needing `SELECT ... FOR UPDATE SKIP LOCKED` — there is only
//! ever one writer, so two claimers can never observe the same row as
//! claimable.
//!
//! Runtime `sqlx::query`/`query_as` only, never the `sqlx::query!`
//! compile-time macro — most of the teacher's own code (`logger.rs`,
//! `state_machine.rs`, `provisioning_job.rs`) already avoids the macro
//! specifically to not require `DATABASE_URL` at build time.

use chrono::{DateTime, Utc};
use hal_common::{HalError, HalResult, Image, Task, TaskStatus, Vm, VmStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone)]
pub struct Store {
    write_pool: SqlitePool,
    read_pool: SqlitePool,
}

impl Store {
    /// Opens (creating if absent) the SQLite database at `path`, enables
    /// WAL journaling, and runs migrations. The write pool is capped at
    /// one connection (§4.A "single-writer"); the read pool may use
    /// several since WAL allows concurrent readers alongside the writer.
    ///
    /// # Errors
    ///
    /// Returns `HalError::Store` if the database cannot be opened or
    /// migrations fail.
    pub async fn open(path: &Path) -> HalResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HalError::Config(e.to_string()))?;
        }

        let connect_opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_opts.clone())
            .await?;

        let read_pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(connect_opts)
            .await?;

        sqlx::migrate!("./migrations").run(&write_pool).await.map_err(|e| {
            HalError::Config(format!("migration failed: {e}"))
        })?;

        Ok(Self { write_pool, read_pool })
    }

    /// In-memory database for tests — a single connection shared by both
    /// "pools" so write_pool/read_pool see the same data (`:memory:`
    /// databases are otherwise per-connection).
    pub async fn open_in_memory() -> HalResult<Self> {
        let connect_opts = SqliteConnectOptions::from_str(":memory:")
            .map_err(|e| HalError::Config(e.to_string()))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_opts)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            HalError::Config(format!("migration failed: {e}"))
        })?;
        Ok(Self {
            write_pool: pool.clone(),
            read_pool: pool,
        })
    }

    // ---- VM rows ----------------------------------------------------

    pub async fn insert_vm(&self, vm: &Vm) -> HalResult<()> {
        sqlx::query(
            "INSERT INTO vms (id, label, provider, ip, ssh_port, status, task_id, \
             snapshot_id, region, plan, created_at, updated_at, idle_since, last_error) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&vm.id)
        .bind(&vm.label)
        .bind(&vm.provider)
        .bind(&vm.ip_address)
        .bind(vm.ssh_port)
        .bind(vm.status.as_str())
        .bind(vm.task_id.map(|id| id.to_string()))
        .bind(&vm.image_ref)
        .bind(&vm.region)
        .bind(&vm.plan)
        .bind(vm.created_at.to_rfc3339())
        .bind(vm.updated_at.to_rfc3339())
        .bind(vm.idle_since.map(|t| t.to_rfc3339()))
        .bind(&vm.last_error)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn get_vm(&self, id: &str) -> HalResult<Vm> {
        let row = sqlx::query("SELECT * FROM vms WHERE id = ?")
            .bind(id)
            .fetch_one(&self.read_pool)
            .await?;
        row_to_vm(&row)
    }

    pub async fn find_vm(&self, id: &str) -> HalResult<Option<Vm>> {
        let row = sqlx::query("SELECT * FROM vms WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.read_pool)
            .await?;
        row.as_ref().map(row_to_vm).transpose()
    }

    pub async fn count_vms_in_states(&self, provider: &str, states: &[VmStatus]) -> HalResult<i64> {
        let placeholders = states.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT COUNT(*) as n FROM vms WHERE provider = ? AND status IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql).bind(provider);
        for s in states {
            q = q.bind(s.as_str());
        }
        let row = q.fetch_one(&self.read_pool).await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    /// One row with `status = ready AND task_id IS NULL`, any provider
    /// (spec.md §4.F-4 "scan for a single row").
    pub async fn find_any_ready_vm(&self) -> HalResult<Option<Vm>> {
        let row = sqlx::query("SELECT * FROM vms WHERE status = 'ready' AND task_id IS NULL LIMIT 1")
            .fetch_optional(&self.read_pool)
            .await?;
        row.as_ref().map(row_to_vm).transpose()
    }

    pub async fn list_vms_by_status(&self, status: VmStatus) -> HalResult<Vec<Vm>> {
        let rows = sqlx::query("SELECT * FROM vms WHERE status = ?")
            .bind(status.as_str())
            .fetch_all(&self.read_pool)
            .await?;
        rows.iter().map(row_to_vm).collect()
    }

    pub async fn list_vms(&self) -> HalResult<Vec<Vm>> {
        let rows = sqlx::query("SELECT * FROM vms").fetch_all(&self.read_pool).await?;
        rows.iter().map(row_to_vm).collect()
    }

    /// Renames a `provisioning` row's identity from its temporary
    /// label-as-id to the provider-assigned id (spec.md §4.F-2b).
    pub async fn rename_vm_id(&self, old_id: &str, new_id: &str, ip: Option<&str>, ssh_port: Option<i64>) -> HalResult<()> {
        let mut tx = self.write_pool.begin().await?;
        sqlx::query("UPDATE vms SET id = ?, ip = ?, ssh_port = ?, updated_at = ? WHERE id = ?")
            .bind(new_id)
            .bind(ip)
            .bind(ssh_port)
            .bind(Utc::now().to_rfc3339())
            .bind(old_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE tasks SET vm_id = ? WHERE vm_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_vm_status(&self, id: &str, status: VmStatus, detail: Option<&str>) -> HalResult<()> {
        let mut tx = self.write_pool.begin().await?;
        let from: Option<String> = sqlx::query("SELECT status FROM vms WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| r.try_get::<String, _>("status"))
            .transpose()?;
        sqlx::query("UPDATE vms SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO vm_state_history (vm_id, from_status, to_status, detail, created_at) VALUES (?,?,?,?,?)",
        )
        .bind(id)
        .bind(from)
        .bind(status.as_str())
        .bind(detail)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_vm_error(&self, id: &str, message: &str) -> HalResult<()> {
        let mut tx = self.write_pool.begin().await?;
        sqlx::query("UPDATE vms SET status = 'error', last_error = ?, updated_at = ? WHERE id = ?")
            .bind(message)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO vm_state_history (vm_id, from_status, to_status, detail, created_at) VALUES (?, NULL, 'error', ?, ?)",
        )
        .bind(id)
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_vm_ready(&self, id: &str, ip: Option<&str>, ssh_port: Option<i64>) -> HalResult<()> {
        sqlx::query(
            "UPDATE vms SET status = 'ready', ip = ?, ssh_port = ?, task_id = NULL, idle_since = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(ip)
        .bind(ssh_port)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn release_vm_to_idle(&self, id: &str) -> HalResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE vms SET status = 'ready', task_id = NULL, idle_since = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    /// Atomically binds a VM to a task (spec.md §4.F-4 task-binding
    /// transaction), guarded on the VM still being `ready`/unbound so two
    /// callers racing on the same row can't both succeed (B1,
    /// "double-assignment MUST NOT occur"). Returns `false` if the guard
    /// didn't match — the caller lost the race and must pick another VM.
    pub async fn bind_vm_to_task(&self, vm_id: &str, task_id: Uuid) -> HalResult<bool> {
        let mut tx = self.write_pool.begin().await?;
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE vms SET status = 'assigned', task_id = ?, idle_since = NULL, updated_at = ? \
             WHERE id = ? AND status = 'ready' AND task_id IS NULL",
        )
        .bind(task_id.to_string())
        .bind(&now)
        .bind(vm_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query("UPDATE tasks SET vm_id = ?, status = 'assigned', updated_at = ? WHERE id = ?")
            .bind(vm_id)
            .bind(&now)
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn delete_vm(&self, id: &str) -> HalResult<()> {
        sqlx::query("DELETE FROM vms WHERE id = ?").bind(id).execute(&self.write_pool).await?;
        Ok(())
    }

    // ---- Task rows ----------------------------------------------------

    pub async fn insert_task(&self, task: &Task) -> HalResult<()> {
        sqlx::query(
            "INSERT INTO tasks (id, slug, repo_url, context, agent, status, vm_id, result, \
             exit_code, branch, pr_url, created_at, updated_at, started_at, completed_at) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(task.id.to_string())
        .bind(&task.slug)
        .bind(&task.repo_url)
        .bind(&task.context)
        .bind(&task.agent)
        .bind(task.status.as_str())
        .bind(&task.vm_id)
        .bind(&task.result)
        .bind(task.exit_code)
        .bind(&task.branch)
        .bind(&task.pr_url)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: Uuid) -> HalResult<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.read_pool)
            .await?;
        row_to_task(&row)
    }

    pub async fn find_task(&self, id: Uuid) -> HalResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.read_pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    pub async fn list_tasks_by_status(&self, status: TaskStatus) -> HalResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_all(&self.read_pool)
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// Transition a task's status, guarded by its current status so a
    /// stale in-memory read can never resurrect a terminal row (spec.md
    /// T1). Returns `true` if a row was actually updated.
    pub async fn transition_task(
        &self,
        id: Uuid,
        from_not_in: &[TaskStatus],
        to: TaskStatus,
    ) -> HalResult<bool> {
        let now = Utc::now().to_rfc3339();
        let excluded = from_not_in.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        let placeholders = excluded.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = if placeholders.is_empty() {
            "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?".to_string()
        } else {
            format!("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status NOT IN ({placeholders})")
        };
        let mut q = sqlx::query(&sql).bind(to.as_str()).bind(&now).bind(id.to_string());
        for s in &excluded {
            q = q.bind(*s);
        }
        let result = q.execute(&self.write_pool).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_task_running(&self, id: Uuid) -> HalResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE tasks SET status = 'running', started_at = ?, updated_at = ? \
             WHERE id = ? AND status != 'completed' AND status != 'failed'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    /// Force-fails a task with `reason`, the single entry point used by
    /// `recover`, stale-heartbeat orphan release, and agent timeout
    /// (spec.md §4.E, T1).
    pub async fn force_fail_task(&self, id: Uuid, reason: &str, exit_code: Option<i64>) -> HalResult<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'failed', result = ?, exit_code = ?, completed_at = ?, updated_at = ? \
             WHERE id = ? AND status != 'completed' AND status != 'failed'",
        )
        .bind(reason)
        .bind(exit_code)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn complete_task(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: &str,
        exit_code: Option<i64>,
        pr_url: Option<&str>,
    ) -> HalResult<bool> {
        let now = Utc::now().to_rfc3339();
        let outcome = sqlx::query(
            "UPDATE tasks SET status = ?, result = ?, exit_code = ?, pr_url = ?, completed_at = ?, updated_at = ? \
             WHERE id = ? AND status != 'completed' AND status != 'failed'",
        )
        .bind(status.as_str())
        .bind(result)
        .bind(exit_code)
        .bind(pr_url)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.write_pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    pub async fn touch_task(&self, id: Uuid) -> HalResult<()> {
        sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    // ---- Images ----------------------------------------------------

    pub async fn upsert_image(&self, image: &Image) -> HalResult<()> {
        sqlx::query(
            "INSERT INTO images (id, provider, snapshot_id, label, created_at) VALUES (?,?,?,?,?) \
             ON CONFLICT(id) DO UPDATE SET snapshot_id = excluded.snapshot_id, label = excluded.label",
        )
        .bind(image.id.to_string())
        .bind(&image.provider)
        .bind(&image.snapshot_id)
        .bind(&image.label)
        .bind(image.created_at.to_rfc3339())
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn list_images(&self) -> HalResult<Vec<Image>> {
        let rows = sqlx::query("SELECT * FROM images").fetch_all(&self.read_pool).await?;
        rows.iter().map(row_to_image).collect()
    }

    // ---- Action log --------------------------------------------------

    pub async fn log_action(&self, task_id: Option<Uuid>, vm_id: Option<&str>, action: &str, detail: Option<&str>) -> HalResult<()> {
        sqlx::query(
            "INSERT INTO action_logs (task_id, vm_id, action, detail, created_at) VALUES (?,?,?,?,?)",
        )
        .bind(task_id.map(|t| t.to_string()))
        .bind(vm_id)
        .bind(action)
        .bind(detail)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }
}

fn parse_ts(s: &str) -> HalResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HalError::Store(sqlx::Error::Decode(Box::new(e))))
}

fn row_to_vm(row: &sqlx::sqlite::SqliteRow) -> HalResult<Vm> {
    let status: String = row.try_get("status")?;
    let task_id: Option<String> = row.try_get("task_id")?;
    let idle_since: Option<String> = row.try_get("idle_since")?;
    Ok(Vm {
        id: row.try_get("id")?,
        label: row.try_get("label")?,
        provider: row.try_get("provider")?,
        ip_address: row.try_get("ip")?,
        ssh_port: row.try_get("ssh_port")?,
        status: VmStatus::from_str(&status).map_err(|e| HalError::Other(anyhow::anyhow!(e)))?,
        task_id: task_id.map(|s| Uuid::parse_str(&s)).transpose().map_err(|e| HalError::Other(e.into()))?,
        image_ref: row.try_get("snapshot_id")?,
        region: row.try_get("region")?,
        plan: row.try_get("plan")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        idle_since: idle_since.map(|s| parse_ts(&s)).transpose()?,
        last_error: row.try_get("last_error")?,
    })
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> HalResult<Task> {
    let status: String = row.try_get("status")?;
    let id: String = row.try_get("id")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    Ok(Task {
        id: Uuid::parse_str(&id).map_err(|e| HalError::Other(e.into()))?,
        slug: row.try_get("slug")?,
        repo_url: row.try_get("repo_url")?,
        context: row.try_get("context")?,
        agent: row.try_get("agent")?,
        status: TaskStatus::from_str(&status).map_err(|e| HalError::Other(anyhow::anyhow!(e)))?,
        vm_id: row.try_get("vm_id")?,
        result: row.try_get("result")?,
        exit_code: row.try_get("exit_code")?,
        branch: row.try_get("branch")?,
        pr_url: row.try_get("pr_url")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        started_at: started_at.map(|s| parse_ts(&s)).transpose()?,
        completed_at: completed_at.map(|s| parse_ts(&s)).transpose()?,
    })
}

fn row_to_image(row: &sqlx::sqlite::SqliteRow) -> HalResult<Image> {
    let id: String = row.try_get("id")?;
    Ok(Image {
        id: Uuid::parse_str(&id).map_err(|e| HalError::Other(e.into()))?,
        provider: row.try_get("provider")?,
        snapshot_id: row.try_get("snapshot_id")?,
        label: row.try_get("label")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}
