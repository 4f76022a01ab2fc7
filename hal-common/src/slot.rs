//! Provider-slot configuration (spec.md §3 "Configuration (provider
//! slot)", §6 Configuration table). Grounded on the teacher's
//! `provider_manager.rs` env/secret-file reading conventions
//! (`HAL_<PROV>_*` here in place of `SCALEWAY_*`), generalized from "one
//! hardcoded provider" to an ordered list of slots.

use serde::{Deserialize, Serialize};

/// One configured provider backend with capacity and warm-pool parameters
/// (spec.md §3). The set of slots is fixed for a process lifetime — built
/// once at startup from env vars and never mutated.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderSlot {
    pub name: String,
    pub provider: String,
    pub snapshot_id: String,
    pub region: String,
    pub plan: String,
    pub max_pool_size: u32,
    pub priority: i32,
    pub idle_timeout_ms: i64,
    pub min_ready: u32,
    pub ssh_key_ids: Vec<String>,
}

impl ProviderSlot {
    /// Build the ordered slot list from env vars, following the priority
    /// of the comma-separated provider list (spec.md §6 Configuration
    /// table, row "default provider list").
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError`-flavored message if the provider list is
    /// empty or a referenced provider is missing its snapshot id.
    pub fn from_env() -> Result<Vec<ProviderSlot>, String> {
        let providers_csv = std::env::var("HAL_PROVIDERS").unwrap_or_default();
        let names: Vec<String> = providers_csv
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if names.is_empty() {
            return Err("HAL_PROVIDERS must list at least one provider slot".to_string());
        }

        let mut slots = Vec::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            let prefix = format!("HAL_{}", name.to_uppercase());

            let snapshot_id = std::env::var(format!("{prefix}_SNAPSHOT_ID"))
                .map_err(|_| format!("{prefix}_SNAPSHOT_ID must be set for slot '{name}'"))?;

            let region = std::env::var(format!("{prefix}_REGION")).unwrap_or_default();
            let plan = std::env::var(format!("{prefix}_PLAN")).unwrap_or_default();

            let default_idle_timeout_s: i64 = if name.eq_ignore_ascii_case("local") {
                1800
            } else {
                300
            };

            let max_pool_size = env_u32(&format!("{prefix}_MAX_POOL_SIZE"), 5);
            let idle_timeout_s = env_i64(&format!("{prefix}_IDLE_TIMEOUT_S"), default_idle_timeout_s);
            let min_ready = env_u32(&format!("{prefix}_MIN_READY"), 0);

            let ssh_key_ids: Vec<String> = std::env::var("HAL_SSH_KEY_ID")
                .ok()
                .map(|v| vec![v])
                .unwrap_or_default();

            slots.push(ProviderSlot {
                name: name.clone(),
                provider: name.clone(),
                snapshot_id,
                region,
                plan,
                max_pool_size,
                priority: idx as i32,
                idle_timeout_ms: idle_timeout_s.saturating_mul(1000),
                min_ready,
                ssh_key_ids,
            });
        }

        Ok(slots)
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn from_env_builds_ordered_slots_by_priority() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("HAL_PROVIDERS", "local,cloud");
        std::env::set_var("HAL_LOCAL_SNAPSHOT_ID", "img-local");
        std::env::set_var("HAL_CLOUD_SNAPSHOT_ID", "img-cloud");
        std::env::set_var("HAL_CLOUD_MAX_POOL_SIZE", "3");

        let slots = ProviderSlot::from_env().unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].name, "local");
        assert_eq!(slots[0].priority, 0);
        assert_eq!(slots[0].idle_timeout_ms, 1_800_000);
        assert_eq!(slots[1].name, "cloud");
        assert_eq!(slots[1].priority, 1);
        assert_eq!(slots[1].max_pool_size, 3);
        assert_eq!(slots[1].idle_timeout_ms, 300_000);

        std::env::remove_var("HAL_PROVIDERS");
        std::env::remove_var("HAL_LOCAL_SNAPSHOT_ID");
        std::env::remove_var("HAL_CLOUD_SNAPSHOT_ID");
        std::env::remove_var("HAL_CLOUD_MAX_POOL_SIZE");
    }

    #[test]
    fn from_env_requires_snapshot_id() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("HAL_PROVIDERS", "ghost");
        std::env::remove_var("HAL_GHOST_SNAPSHOT_ID");

        let err = ProviderSlot::from_env().unwrap_err();
        assert!(err.contains("HAL_GHOST_SNAPSHOT_ID"));

        std::env::remove_var("HAL_PROVIDERS");
    }
}
