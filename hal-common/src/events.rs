//! The per-task JSONL event envelope (spec.md §6). Grounded on the
//! teacher's `bus.rs` tagged-union-over-serde pattern (`FinopsEventType` /
//! `FinopsEventEnvelope`), adapted from a pub/sub command bus to an
//! append-only per-task event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phases a task passes through during setup (spec.md §6 event table).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    VmAcquire,
    SshWait,
    Clone,
    AgentInstall,
    BranchSetup,
    AgentLaunch,
    AgentRun,
}

impl Phase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::VmAcquire => "vm_acquire",
            Phase::SshWait => "ssh_wait",
            Phase::Clone => "clone",
            Phase::AgentInstall => "agent_install",
            Phase::BranchSetup => "branch_setup",
            Phase::AgentLaunch => "agent_launch",
            Phase::AgentRun => "agent_run",
        }
    }
}

/// Stream discriminator for `output` events.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// The tagged union of task events (spec.md §6). Every finalized task's
/// stream contains exactly one `TaskStart` and exactly one `TaskEnd` (P6),
/// with `Phase`/`Output`/`VmAcquired` events interleaved arbitrarily
/// between them.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStart {
        repo_url: String,
        context: String,
        agent: String,
    },
    VmAcquired {
        vm_id: String,
        provider: String,
        ip: Option<String>,
    },
    Phase {
        name: Phase,
    },
    Output {
        stream: OutputStream,
        text: String,
    },
    TaskEnd {
        status: FinalStatus,
        exit_code: Option<i64>,
        error: Option<String>,
        pr_url: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Completed,
    Failed,
}

/// One line of the per-task JSONL event stream (spec.md §6). `seq` is
/// strictly increasing within a task (P5), assigned by the event writer's
/// monotone counter — never by the caller.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventEnvelope {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub seq: u64,
    pub event: TaskEvent,
}
