//! Process-wide configuration (spec.md §3 "provider slot", §6
//! Configuration table). Grounded on the teacher's env/secret-file
//! reading style in `provider_manager.rs`, flattened here into one
//! struct built once at startup (the teacher re-reads env per request;
//! this config never changes for the process lifetime, per spec.md §3
//! "the set of slots is fixed for a process lifetime").

use hal_common::ProviderSlot;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub slots: Vec<ProviderSlot>,
    pub data_dir: std::path::PathBuf,
    pub listen_addr: String,
    pub stale_task_max: Duration,
    pub stale_provision_max: Duration,
    pub agent_timeout: Duration,
    pub poll_interval: Duration,
    pub ssh_user: String,
    pub ssh_key_path: Option<std::path::PathBuf>,
    pub github_token: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub claude_code_oauth_token: Option<String>,
    pub openai_api_key: Option<String>,
}

impl AppConfig {
    /// # Errors
    ///
    /// Returns a message if `ProviderSlot::from_env` fails (missing
    /// `HAL_PROVIDERS` or a slot's snapshot id) — this is
    /// `ConfigError` territory (spec.md §7), fatal at startup.
    pub fn from_env() -> Result<Self, String> {
        let slots = ProviderSlot::from_env()?;

        let data_dir = std::env::var("HAL_DATA_DIR")
            .unwrap_or_else(|_| "./data".to_string())
            .into();

        let listen_addr =
            std::env::var("HAL_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let stale_task_max = Duration::from_secs(env_u64("HAL_STALE_TASK_MAX_S", 600));
        let stale_provision_max = Duration::from_secs(env_u64("HAL_STALE_PROVISION_MAX_S", 600));
        let agent_timeout = Duration::from_secs(env_u64("HAL_AGENT_TIMEOUT_S", 600));
        let poll_interval = Duration::from_millis(env_u64("HAL_POLL_INTERVAL_MS", 5000));

        let ssh_user = std::env::var("HAL_SSH_USER").unwrap_or_else(|_| "root".to_string());
        let ssh_key_path = std::env::var("HAL_SSH_KEY_PATH").ok().map(Into::into);

        Ok(Self {
            slots,
            data_dir,
            listen_addr,
            stale_task_max,
            stale_provision_max,
            agent_timeout,
            poll_interval,
            ssh_user,
            ssh_key_path,
            github_token: std::env::var("GITHUB_TOKEN").ok(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            claude_code_oauth_token: std::env::var("CLAUDE_CODE_OAUTH_TOKEN").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
        })
    }

    #[must_use]
    pub fn db_path(&self) -> std::path::PathBuf {
        self.data_dir.join("hal9999.db")
    }

    #[must_use]
    pub fn logs_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("logs")
    }

    #[must_use]
    pub fn events_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("events")
    }

    #[must_use]
    pub fn plans_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("plans")
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
