//! VM Pool Manager (spec.md §4.F) — the heart of the system. Grounded on
//! the teacher's `state_machine.rs` (guarded, idempotent transitions),
//! `provisioning_job.rs`/`watch_dog_job.rs`/`terminator_job.rs`/
//! `recovery_job.rs` (the four separate claim-lease-process reapers,
//! consolidated here into the methods the spec names), and
//! `reconciliation.rs` (drift correction against the provider's own
//! `listInstances`). The teacher's reapers use Postgres
//! `FOR UPDATE SKIP LOCKED` to let multiple orchestrator replicas claim
//! disjoint rows; this store has exactly one writer connection, so two
//! reap passes in the same process can never race on the same row and
//! `SKIP LOCKED` has no counterpart here.

use chrono::{Duration as ChronoDuration, Utc};
use hal_common::{HalError, HalResult, ProviderSlot, Vm, VmStatus};
use hal_providers::{InstanceState, Provider};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::Store;

const MAX_PROVISION_ATTEMPTS: u32 = 2;
const MAX_BIND_ATTEMPTS: u32 = 5;

pub struct ReconcileReport {
    pub updated: u64,
    pub destroyed: u64,
}

pub struct VmPoolManager {
    store: Arc<Store>,
    providers: HashMap<String, Arc<dyn Provider>>,
    slots: Vec<ProviderSlot>,
    stale_task_max: Duration,
    stale_provision_max: ChronoDuration,
}

impl VmPoolManager {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        providers: HashMap<String, Arc<dyn Provider>>,
        mut slots: Vec<ProviderSlot>,
        stale_task_max: Duration,
        stale_provision_max: Duration,
    ) -> Self {
        slots.sort_by_key(|s| s.priority);
        Self {
            store,
            providers,
            slots,
            stale_task_max,
            stale_provision_max: ChronoDuration::from_std(stale_provision_max)
                .unwrap_or(ChronoDuration::minutes(10)),
        }
    }

    #[must_use]
    pub fn slots(&self) -> &[ProviderSlot] {
        &self.slots
    }

    fn provider_for(&self, name: &str) -> HalResult<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| HalError::ProviderNotFound(name.to_string()))
    }

    /// 1. Slot selection (spec.md §4.F-1): first slot in ascending
    /// priority whose active-state count is below `maxPoolSize`.
    pub async fn pick_slot(&self) -> HalResult<&ProviderSlot> {
        for slot in &self.slots {
            let n = self
                .store
                .count_vms_in_states(
                    &slot.name,
                    &[VmStatus::Provisioning, VmStatus::Ready, VmStatus::Assigned],
                )
                .await?;
            if (n as u32) < slot.max_pool_size {
                return Ok(slot);
            }
        }
        Err(HalError::Capacity {
            max: self.slots.iter().map(|s| s.max_pool_size).max().unwrap_or(0),
        })
    }

    /// 2. Provision (spec.md §4.F-2): two-phase insert-then-create so
    /// the row exists (and counts against capacity) during the
    /// possibly-slow provider call.
    pub async fn provision_vm_for_slot(&self, slot: &ProviderSlot) -> HalResult<Vm> {
        let temp_id = format!("pending-{}", Uuid::new_v4());
        let now = Utc::now();
        let row = Vm {
            id: temp_id.clone(),
            label: temp_id.clone(),
            provider: slot.name.clone(),
            ip_address: None,
            ssh_port: None,
            status: VmStatus::Provisioning,
            task_id: None,
            image_ref: slot.snapshot_id.clone(),
            region: slot.region.clone(),
            plan: slot.plan.clone(),
            created_at: now,
            updated_at: now,
            idle_since: None,
            last_error: None,
        };
        self.store.insert_vm(&row).await?;

        let provider = self.provider_for(&slot.provider)?;
        match provider
            .create_instance(&slot.region, &slot.plan, &slot.snapshot_id, &temp_id, &slot.ssh_key_ids)
            .await
        {
            Ok(instance) => {
                self.store
                    .rename_vm_id(&temp_id, &instance.id, instance.ip.as_deref(), instance.ssh_port.map(i64::from))
                    .await?;
                self.store.log_action(None, Some(&instance.id), "provision", None).await?;
                let mut vm = self.store.get_vm(&instance.id).await?;
                vm.label = temp_id;
                Ok(vm)
            }
            Err(e) => {
                self.store.set_vm_error(&temp_id, &e.to_string()).await?;
                Err(HalError::Provider(e.to_string()))
            }
        }
    }

    pub async fn provision_vm(&self) -> HalResult<Vm> {
        let slot = self.pick_slot().await?;
        self.provision_vm_for_slot(slot).await
    }

    /// 3. Wait (spec.md §4.F-3). On failure the row is left in
    /// `provisioning` for the caller to `destroy_vm`.
    pub async fn wait_for_vm(&self, vm: &Vm, timeout: Duration) -> HalResult<Vm> {
        let provider = self.provider_for(&vm.provider)?;
        let instance = provider
            .wait_for_ready(&vm.id, timeout)
            .await
            .map_err(|e| HalError::Timeout(e.to_string()))?;
        self.store
            .mark_vm_ready(&vm.id, instance.ip.as_deref(), instance.ssh_port.map(i64::from))
            .await?;
        self.store.get_vm(&vm.id).await
    }

    /// 4. Acquire (spec.md §4.F-4): pre-acquire housekeeping, reuse a
    /// warm VM if one exists, else provision-with-retry
    /// (`maxAttempts=2`). The pick-then-bind pair is not one atomic step,
    /// so a losing bind (another concurrent `acquire_vm` claimed the same
    /// ready VM first) retries rather than returning the now-stale VM —
    /// that would double-assign it, forbidden by B1.
    pub async fn acquire_vm(&self, task_id: Uuid, wait_timeout: Duration) -> HalResult<Vm> {
        self.release_orphans().await?;
        self.reap_stale_provisioning().await?;
        self.reap_idle_vms().await?;

        for attempt in 1..=MAX_BIND_ATTEMPTS {
            let vm = if let Some(vm) = self.store.find_any_ready_vm().await? {
                vm
            } else {
                self.provision_with_retry(wait_timeout).await?
            };

            if self.store.bind_vm_to_task(&vm.id, task_id).await? {
                return self.store.get_vm(&vm.id).await;
            }
            warn!(vm_id = %vm.id, attempt, "lost the bind race on a ready vm, retrying");
        }
        Err(HalError::Provider("could not bind a vm after repeated bind-race contention".to_string()))
    }

    async fn provision_with_retry(&self, wait_timeout: Duration) -> HalResult<Vm> {
        let mut last_err = None;
        for attempt in 1..=MAX_PROVISION_ATTEMPTS {
            match self.provision_vm().await {
                Ok(vm) => match self.wait_for_vm(&vm, wait_timeout).await {
                    Ok(ready) => return Ok(ready),
                    Err(e) => {
                        warn!(vm_id = %vm.id, attempt, error = %e, "wait_for_vm failed, destroying");
                        let _ = self.destroy_vm(&vm.id).await;
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    warn!(attempt, error = %e, "provision_vm failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(HalError::Provider("provisioning exhausted retries".to_string())))
    }

    /// 5. Release (spec.md §4.F-5).
    pub async fn release_vm(&self, vm_id: &str) -> HalResult<()> {
        let vm = self.store.get_vm(vm_id).await?;
        let slot = self.slots.iter().find(|s| s.name == vm.provider);
        let idle_timeout_ms = slot.map_or(0, |s| s.idle_timeout_ms);

        if idle_timeout_ms <= 0 {
            self.destroy_vm(vm_id).await?;
        } else {
            self.store.release_vm_to_idle(vm_id).await?;
        }
        Ok(())
    }

    /// 6. Reap idle (spec.md §4.F-6).
    pub async fn reap_idle_vms(&self) -> HalResult<u64> {
        let mut count = 0u64;
        for vm in self.store.list_vms_by_status(VmStatus::Ready).await? {
            let Some(idle_since) = vm.idle_since else { continue };
            let slot = self.slots.iter().find(|s| s.name == vm.provider);
            let idle_timeout_ms = slot.map_or(0, |s| s.idle_timeout_ms);
            let elapsed = (Utc::now() - idle_since).num_milliseconds();
            if elapsed >= idle_timeout_ms {
                if let Err(e) = self.destroy_vm(&vm.id).await {
                    warn!(vm_id = %vm.id, error = %e, "reap_idle_vms destroy failed");
                } else {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// 7. Reap stale provisioning (spec.md §4.F-7).
    pub async fn reap_stale_provisioning(&self) -> HalResult<u64> {
        let mut count = 0u64;
        for vm in self.store.list_vms_by_status(VmStatus::Provisioning).await? {
            if Utc::now() - vm.updated_at >= self.stale_provision_max {
                if let Err(e) = self.destroy_vm(&vm.id).await {
                    warn!(vm_id = %vm.id, error = %e, "reap_stale_provisioning destroy failed");
                } else {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// 8. Reap error (spec.md §4.F-8): the row must leave the accounting
    /// set regardless of whether the provider call itself succeeds.
    pub async fn reap_error_vms(&self) -> HalResult<u64> {
        let mut count = 0u64;
        for vm in self.store.list_vms_by_status(VmStatus::Error).await? {
            let provider = match self.provider_for(&vm.provider) {
                Ok(p) => p,
                Err(_) => {
                    self.store.set_vm_status(&vm.id, VmStatus::Destroyed, Some("unknown provider")).await?;
                    count += 1;
                    continue;
                }
            };
            let _ = provider.destroy_instance(&vm.id).await;
            self.store.set_vm_status(&vm.id, VmStatus::Destroyed, Some("reaped from error")).await?;
            count += 1;
        }
        Ok(count)
    }

    /// 9. Release orphans (spec.md §4.F-9): VMs assigned to a finished,
    /// missing, or stale-heartbeat task.
    pub async fn release_orphans(&self) -> HalResult<u64> {
        let mut count = 0u64;
        for vm in self.store.list_vms_by_status(VmStatus::Assigned).await? {
            let Some(task_id) = vm.task_id else { continue };
            let task = self.store.find_task(task_id).await?;

            let is_orphan = match &task {
                None => true,
                Some(t) if t.status.is_terminal() => true,
                Some(t) => {
                    let stale = ChronoDuration::from_std(self.stale_task_max).unwrap_or(ChronoDuration::minutes(10));
                    Utc::now() - t.updated_at >= stale
                }
            };

            if !is_orphan {
                continue;
            }

            if let Some(t) = &task {
                if !t.status.is_terminal() {
                    self.store.force_fail_task(t.id, "Stale task (process died)", None).await?;
                }
            }

            let slot = self.slots.iter().find(|s| s.name == vm.provider);
            let has_warm_pool = slot.is_some_and(|s| s.idle_timeout_ms > 0);
            if has_warm_pool {
                self.store.release_vm_to_idle(&vm.id).await?;
            } else if let Err(e) = self.destroy_vm(&vm.id).await {
                warn!(vm_id = %vm.id, error = %e, "release_orphans destroy failed");
            }
            count += 1;
        }
        Ok(count)
    }

    /// 10. Warm-pool top-up (spec.md §4.F-10). Pre-warm failures are
    /// logged, never fatal.
    pub async fn ensure_warm(&self) {
        for slot in &self.slots {
            if slot.min_ready == 0 {
                continue;
            }
            let ready = self
                .store
                .count_vms_in_states(&slot.name, &[VmStatus::Ready, VmStatus::Provisioning])
                .await
                .unwrap_or(0);
            let deficit = slot.min_ready.saturating_sub(ready.max(0) as u32);
            for _ in 0..deficit {
                if let Err(e) = self.provision_vm_for_slot(slot).await {
                    warn!(slot = %slot.name, error = %e, "ensure_warm provision failed");
                }
            }
        }
    }

    /// 11. Reconcile (spec.md §4.F-11): periodic drift correction.
    pub async fn reconcile(&self) -> HalResult<ReconcileReport> {
        let mut updated = 0u64;
        let mut destroyed = 0u64;
        let slot_names: std::collections::HashSet<&str> =
            self.slots.iter().map(|s| s.name.as_str()).collect();

        for vm in self.store.list_vms().await? {
            if vm.status.is_terminal() {
                continue;
            }
            if !slot_names.contains(vm.provider.as_str()) {
                self.store.set_vm_status(&vm.id, VmStatus::Destroyed, Some("unknown slot")).await?;
                destroyed += 1;
                continue;
            }

            let Ok(provider) = self.provider_for(&vm.provider) else { continue };
            match provider.get_instance(&vm.id).await {
                Ok(instance) if instance.status == InstanceState::Active && vm.status == VmStatus::Provisioning => {
                    self.store.mark_vm_ready(&vm.id, instance.ip.as_deref(), instance.ssh_port.map(i64::from)).await?;
                    updated += 1;
                }
                Ok(_) => {}
                Err(_) => {
                    self.store.set_vm_status(&vm.id, VmStatus::Destroyed, Some("not found on provider")).await?;
                    destroyed += 1;
                }
            }
        }

        destroyed += self.reap_idle_vms().await?;
        destroyed += self.reap_stale_provisioning().await?;
        destroyed += self.reap_error_vms().await?;
        self.release_orphans().await?;

        // Defense against leaked cloud resources (spec.md §9 Open
        // Question ii): destroying instances unknown to the DB is only
        // correct when this process is the sole owner of the provider
        // namespace. Documented in DESIGN.md; enabled unconditionally
        // here since every slot in this design is private per-process.
        for slot in &self.slots {
            let Ok(provider) = self.provider_for(&slot.provider) else { continue };
            let Ok(raw) = provider.list_raw(&slot.region).await else { continue };
            for discovered in raw {
                if self.store.find_vm(&discovered.provider_id).await?.is_none() {
                    info!(instance = %discovered.provider_id, "destroying unknown provider instance");
                    let _ = provider.destroy_instance(&discovered.provider_id).await;
                    destroyed += 1;
                }
            }
        }

        self.ensure_warm().await;
        Ok(ReconcileReport { updated, destroyed })
    }

    /// 12. Destroy (spec.md §4.F-12). Idempotent: a missing row or a
    /// provider `ErrNotFound` both resolve to `destroyed`.
    pub async fn destroy_vm(&self, vm_id: &str) -> HalResult<()> {
        let Some(vm) = self.store.find_vm(vm_id).await? else {
            return Ok(());
        };
        if vm.status == VmStatus::Destroyed {
            return Ok(());
        }

        self.store.set_vm_status(vm_id, VmStatus::Destroying, None).await?;

        let provider = self.provider_for(&vm.provider)?;
        match provider.destroy_instance(vm_id).await {
            Ok(()) => {
                self.store.set_vm_status(vm_id, VmStatus::Destroyed, None).await?;
                Ok(())
            }
            Err(e) => {
                if e.downcast_ref::<hal_providers::ProviderNotFound>().is_some() {
                    self.store.set_vm_status(vm_id, VmStatus::Destroyed, Some("not found on provider")).await?;
                    return Ok(());
                }
                self.store.set_vm_error(vm_id, &e.to_string()).await?;
                Err(HalError::Provider(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal_providers::mock::MockProvider;

    fn one_local_slot(max_pool_size: u32, idle_timeout_ms: i64, min_ready: u32) -> ProviderSlot {
        ProviderSlot {
            name: "local".to_string(),
            provider: "local".to_string(),
            snapshot_id: "img".to_string(),
            region: "local".to_string(),
            plan: "small".to_string(),
            max_pool_size,
            priority: 0,
            idle_timeout_ms,
            min_ready,
            ssh_key_ids: vec![],
        }
    }

    async fn manager(slot: ProviderSlot) -> (VmPoolManager, Arc<MockProvider>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mock = Arc::new(MockProvider::new());
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("local".to_string(), mock.clone());
        let pool = VmPoolManager::new(store, providers, vec![slot], Duration::from_secs(600), Duration::from_secs(600));
        (pool, mock)
    }

    #[tokio::test]
    async fn acquire_then_release_then_reacquire_reuses_vm() {
        let (pool, _mock) = manager(one_local_slot(5, 600_000, 0)).await;
        let task1 = Uuid::new_v4();
        let vm1 = pool.acquire_vm(task1, Duration::from_secs(5)).await.unwrap();
        pool.release_vm(&vm1.id).await.unwrap();

        let task2 = Uuid::new_v4();
        let vm2 = pool.acquire_vm(task2, Duration::from_secs(5)).await.unwrap();
        assert_eq!(vm1.id, vm2.id);
    }

    #[tokio::test]
    async fn capacity_exhaustion_surfaces_capacity_error() {
        let (pool, _mock) = manager(one_local_slot(1, 600_000, 0)).await;
        let _vm = pool.acquire_vm(Uuid::new_v4(), Duration::from_secs(5)).await.unwrap();
        let err = pool.acquire_vm(Uuid::new_v4(), Duration::from_secs(5)).await.unwrap_err();
        assert!(err.to_string().contains("at capacity (total max: 1)"));
    }

    #[tokio::test]
    async fn zero_idle_timeout_destroys_inline() {
        let (pool, _mock) = manager(one_local_slot(5, 0, 0)).await;
        let vm = pool.acquire_vm(Uuid::new_v4(), Duration::from_secs(5)).await.unwrap();
        pool.release_vm(&vm.id).await.unwrap();
        let refetched = pool.store.get_vm(&vm.id).await.unwrap();
        assert_eq!(refetched.status, VmStatus::Destroyed);
    }

    #[tokio::test]
    async fn provider_flake_then_success_still_acquires() {
        let (pool, mock) = manager(one_local_slot(5, 600_000, 0)).await;
        mock.fail_next_create();
        let vm = pool.acquire_vm(Uuid::new_v4(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(pool.store.get_vm(&vm.id).await.unwrap().status, VmStatus::Assigned);
    }

    #[tokio::test]
    async fn destroy_vm_is_idempotent() {
        let (pool, _mock) = manager(one_local_slot(5, 600_000, 0)).await;
        let vm = pool.acquire_vm(Uuid::new_v4(), Duration::from_secs(5)).await.unwrap();
        pool.destroy_vm(&vm.id).await.unwrap();
        pool.destroy_vm(&vm.id).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_bind_on_same_ready_vm_loses_the_race_not_the_guarantee() {
        let (pool, _mock) = manager(one_local_slot(5, 600_000, 0)).await;
        let vm = pool.provision_with_retry(Duration::from_secs(5)).await.unwrap();

        let task1 = Uuid::new_v4();
        let task2 = Uuid::new_v4();
        assert!(pool.store.bind_vm_to_task(&vm.id, task1).await.unwrap());
        assert!(!pool.store.bind_vm_to_task(&vm.id, task2).await.unwrap());

        let bound = pool.store.get_vm(&vm.id).await.unwrap();
        assert_eq!(bound.task_id, Some(task1));
    }

    #[tokio::test]
    async fn reap_idempotence_second_pass_reaps_nothing() {
        let (pool, _mock) = manager(one_local_slot(5, 0, 0)).await;
        let vm = pool.acquire_vm(Uuid::new_v4(), Duration::from_secs(5)).await.unwrap();
        pool.release_vm(&vm.id).await.unwrap();
        let first = pool.reap_idle_vms().await.unwrap();
        let second = pool.reap_idle_vms().await.unwrap();
        assert_eq!(first, 0); // already destroyed inline by release_vm
        assert_eq!(second, 0);
    }
}
