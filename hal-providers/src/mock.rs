//! An in-memory `Provider` for local development and tests. Grounded on
//! the teacher's `inventiv-providers::mock::MockProvider` — same idea
//! (a synthetic backend that validates the whole create→wait→destroy
//! chain without a real cloud account) but the teacher's version shells
//! out to `docker compose` to run a fake vLLM container per instance;
//! that machinery is specific to the teacher's LLM-worker domain and has
//! no counterpart here, so this one just tracks instance state in memory
//! and fabricates IPs.

use crate::{Instance, InstanceState, Provider, ProviderNotFound};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

struct MockInstance {
    ip: String,
    status: InstanceState,
    label: String,
    region: String,
}

/// Creates instances that become `Active` immediately — real providers lag
/// behind `create_instance` before `wait_for_ready` succeeds, but the mock
/// has no reason to simulate that unless a test explicitly wants to
/// exercise the polling path (`set_pending_polls` below).
pub struct MockProvider {
    instances: Mutex<HashMap<String, MockInstance>>,
    pending_polls: Mutex<HashMap<String, u32>>,
    fail_next_create: Mutex<bool>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            pending_polls: Mutex::new(HashMap::new()),
            fail_next_create: Mutex::new(false),
        }
    }

    /// Test hook: the next `create_instance` call fails once, then
    /// subsequent calls succeed (spec.md scenario 3, "provider flake then
    /// success").
    pub fn fail_next_create(&self) {
        *self.fail_next_create.lock().unwrap() = true;
    }

    /// Test hook: make `wait_for_ready` poll `n` times before the instance
    /// reports ready.
    pub fn set_pending_polls(&self, id: &str, n: u32) {
        self.pending_polls.lock().unwrap().insert(id.to_string(), n);
    }

    fn fabricate_ip(id: &str) -> String {
        let h = id
            .bytes()
            .fold(1u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        format!("10.{}.{}.{}", (h >> 16) % 255, (h >> 8) % 255, (h % 254) + 1)
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn create_instance(
        &self,
        region: &str,
        _plan: &str,
        _snapshot_id: &str,
        label: &str,
        _ssh_key_ids: &[String],
    ) -> Result<Instance> {
        {
            let mut fail = self.fail_next_create.lock().unwrap();
            if *fail {
                *fail = false;
                anyhow::bail!("mock provider: transient create failure");
            }
        }

        let id = format!("mock-{}", Uuid::new_v4());
        let ip = Self::fabricate_ip(&id);
        self.instances.lock().unwrap().insert(
            id.clone(),
            MockInstance {
                ip: ip.clone(),
                status: InstanceState::Active,
                label: label.to_string(),
                region: region.to_string(),
            },
        );

        Ok(Instance {
            id,
            ip: Some(ip),
            ssh_port: Some(22),
            status: InstanceState::Active,
        })
    }

    async fn wait_for_ready(&self, id: &str, timeout: Duration) -> Result<Instance> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let should_wait = {
                let mut pending = self.pending_polls.lock().unwrap();
                match pending.get_mut(id) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };

            if !should_wait {
                return self.get_instance(id).await;
            }

            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("mock provider: wait_for_ready timed out for {id}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn get_instance(&self, id: &str) -> Result<Instance> {
        let instances = self.instances.lock().unwrap();
        let inst = instances
            .get(id)
            .ok_or_else(|| ProviderNotFound(id.to_string()))?;
        Ok(Instance {
            id: id.to_string(),
            ip: Some(inst.ip.clone()),
            ssh_port: Some(22),
            status: inst.status,
        })
    }

    async fn list_instances(&self, label_filter: Option<&str>) -> Result<Vec<Instance>> {
        let instances = self.instances.lock().unwrap();
        Ok(instances
            .iter()
            .filter(|(_, v)| label_filter.is_none_or(|f| v.label == f))
            .map(|(id, v)| Instance {
                id: id.clone(),
                ip: Some(v.ip.clone()),
                ssh_port: Some(22),
                status: v.status,
            })
            .collect())
    }

    async fn destroy_instance(&self, id: &str) -> Result<()> {
        let mut instances = self.instances.lock().unwrap();
        if instances.remove(id).is_none() {
            anyhow::bail!(ProviderNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn start_instance(&self, id: &str) -> Result<()> {
        let mut instances = self.instances.lock().unwrap();
        let inst = instances
            .get_mut(id)
            .ok_or_else(|| ProviderNotFound(id.to_string()))?;
        inst.status = InstanceState::Active;
        Ok(())
    }

    async fn stop_instance(&self, id: &str) -> Result<()> {
        let mut instances = self.instances.lock().unwrap();
        let inst = instances
            .get_mut(id)
            .ok_or_else(|| ProviderNotFound(id.to_string()))?;
        inst.status = InstanceState::Stopped;
        Ok(())
    }

    async fn list_raw(&self, region: &str) -> Result<Vec<crate::inventory::DiscoveredInstance>> {
        let instances = self.instances.lock().unwrap();
        Ok(instances
            .iter()
            .filter(|(_, v)| v.region == region)
            .map(|(id, v)| crate::inventory::DiscoveredInstance {
                provider_id: id.clone(),
                label: v.label.clone(),
                zone: v.region.clone(),
                status: match v.status {
                    InstanceState::Active => "active".to_string(),
                    InstanceState::Pending => "pending".to_string(),
                    InstanceState::Stopped => "stopped".to_string(),
                    InstanceState::Unknown => "unknown".to_string(),
                },
                ip_address: Some(v.ip.clone()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_destroy_round_trip() {
        let p = MockProvider::new();
        let inst = p
            .create_instance("local", "small", "img", "t1", &[])
            .await
            .unwrap();
        assert_eq!(inst.status, InstanceState::Active);
        assert!(p.get_instance(&inst.id).await.is_ok());

        p.destroy_instance(&inst.id).await.unwrap();
        let err = p.get_instance(&inst.id).await.unwrap_err();
        assert!(err.downcast_ref::<ProviderNotFound>().is_some());
    }

    #[tokio::test]
    async fn fail_next_create_then_succeeds() {
        let p = MockProvider::new();
        p.fail_next_create();
        assert!(p
            .create_instance("local", "small", "img", "t1", &[])
            .await
            .is_err());
        assert!(p
            .create_instance("local", "small", "img", "t1", &[])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn destroy_missing_instance_fails() {
        let p = MockProvider::new();
        assert!(p.destroy_instance("nope").await.is_err());
    }

    #[tokio::test]
    async fn wait_for_ready_polls_until_clear() {
        let p = MockProvider::new();
        let inst = p
            .create_instance("local", "small", "img", "t1", &[])
            .await
            .unwrap();
        p.set_pending_polls(&inst.id, 2);
        let ready = p
            .wait_for_ready(&inst.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(ready.id, inst.id);
    }
}
