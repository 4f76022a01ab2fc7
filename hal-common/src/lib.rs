//! Shared types for the HAL9999 orchestrator: VM/task records, the
//! provider-slot configuration unit, the event envelope, and the error
//! taxonomy. Kept dependency-light (no `axum`, no provider SDKs) so both
//! `hal-providers` and `hal-orchestrator` can depend on it without pulling
//! in a web framework.

pub mod error;
pub mod events;
pub mod slot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// VM lifecycle states (spec.md §3). `Error` is re-enterable from any
/// non-terminal state; `Destroyed`/`Error` are terminal for accounting
/// purposes (an `Error` row can still be retried out by a reaper into
/// `Destroyed`).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Provisioning,
    Ready,
    Assigned,
    Destroying,
    Destroyed,
    Error,
}

impl VmStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Provisioning => "provisioning",
            VmStatus::Ready => "ready",
            VmStatus::Assigned => "assigned",
            VmStatus::Destroying => "destroying",
            VmStatus::Destroyed => "destroyed",
            VmStatus::Error => "error",
        }
    }

    /// States counted against a slot's `maxPoolSize` (spec.md V1).
    #[must_use]
    pub fn counts_against_capacity(&self) -> bool {
        matches!(
            self,
            VmStatus::Provisioning | VmStatus::Ready | VmStatus::Assigned
        )
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmStatus::Destroyed | VmStatus::Error)
    }
}

impl std::str::FromStr for VmStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(VmStatus::Provisioning),
            "ready" => Ok(VmStatus::Ready),
            "assigned" => Ok(VmStatus::Assigned),
            "destroying" => Ok(VmStatus::Destroying),
            "destroyed" => Ok(VmStatus::Destroyed),
            "error" => Ok(VmStatus::Error),
            other => Err(format!("unknown vm status '{other}'")),
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle states (spec.md §3). Monotone toward a terminal state
/// (T1) — `Completed`/`Failed` never transition again.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// VM record (spec.md §3). `id` is the provider-assigned opaque string once
/// provisioned; during the provisioning window (before the provider call
/// returns) it is a temporary label so the row can exist in the store while
/// still counting against slot capacity.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Vm {
    pub id: String,
    pub label: String,
    pub provider: String,
    pub ip_address: Option<String>,
    pub ssh_port: Option<i64>,
    pub status: VmStatus,
    pub task_id: Option<Uuid>,
    pub image_ref: String,
    pub region: String,
    pub plan: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub idle_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Task record (spec.md §3). `slug` is a human-friendly unique
/// `adjective-noun` identifier generated alongside the UUID `id`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Task {
    pub id: Uuid,
    pub slug: String,
    pub repo_url: String,
    pub context: String,
    pub agent: String,
    pub status: TaskStatus,
    pub vm_id: Option<String>,
    pub result: Option<String>,
    pub exit_code: Option<i64>,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Known golden-image / snapshot reference (spec.md §2 Store row:
/// "Durable state: VMs, tasks, images").
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Image {
    pub id: Uuid,
    pub provider: String,
    pub snapshot_id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

/// Default staleness window for a running/assigned task's heartbeat
/// (spec.md §3 T3, §4.F-9).
pub const STALE_TASK_MAX: chrono::Duration = chrono::Duration::minutes(10);

/// Default window after which a `provisioning` row with no provider id is
/// considered abandoned by a dead orchestrator process (spec.md §4.F-7).
pub const STALE_PROVISION_MAX: chrono::Duration = chrono::Duration::minutes(10);

/// Default agent wall-clock budget (spec.md §5 Timeouts).
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 600;

pub use error::HalError;
pub use events::{EventEnvelope, FinalStatus, OutputStream, Phase, TaskEvent};
pub use slot::ProviderSlot;
