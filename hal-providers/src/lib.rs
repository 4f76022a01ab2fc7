//! The `Provider` contract (spec.md §4.B). Grounded on the teacher's
//! `inventiv-providers::CloudProvider` trait — same `async_trait` shape,
//! narrowed to exactly the surface the VM Pool Manager needs (creation,
//! readiness wait, inspection, destruction, snapshot ops out of scope) and
//! with the Scaleway-specific diskless-boot/Block-Storage machinery
//! dropped: that machinery lived entirely in the Scaleway implementation,
//! never in the contract itself, so the pool never depended on it.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// One instance as reported by a provider. `ip` may be empty immediately
/// after `create_instance` returns — IP assignment can lag instance
/// creation (spec.md §4.B).
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub ip: Option<String>,
    pub ssh_port: Option<u16>,
    pub status: InstanceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Active,
    Stopped,
    Unknown,
}

pub mod inventory {
    #[derive(Clone, Debug)]
    pub struct DiscoveredInstance {
        pub provider_id: String,
        pub label: String,
        pub zone: String,
        pub status: String,
        pub ip_address: Option<String>,
    }
}

/// Opaque backend capable of creating/destroying instances (spec.md §4.B).
/// The pool never touches cloud APIs directly — it only ever calls through
/// this trait, so a provider flake (spec.md scenario 3) or an entirely new
/// backend never touches `hal-orchestrator`'s pool logic.
#[async_trait]
pub trait Provider: Send + Sync {
    /// May return before IP assignment; `ip` may be `None`.
    async fn create_instance(
        &self,
        region: &str,
        plan: &str,
        snapshot_id: &str,
        label: &str,
        ssh_key_ids: &[String],
    ) -> Result<Instance>;

    /// Blocks until the instance reports `Active` with a non-loopback IP,
    /// or fails after `timeout`.
    async fn wait_for_ready(&self, id: &str, timeout: Duration) -> Result<Instance>;

    async fn get_instance(&self, id: &str) -> Result<Instance>;

    async fn list_instances(&self, label_filter: Option<&str>) -> Result<Vec<Instance>>;

    async fn destroy_instance(&self, id: &str) -> Result<()>;

    async fn start_instance(&self, id: &str) -> Result<()>;

    async fn stop_instance(&self, id: &str) -> Result<()>;

    /// For `reconcile`'s "list provider instances, destroy unknown ones"
    /// pass (spec.md §4.F-11).
    async fn list_raw(&self, region: &str) -> Result<Vec<inventory::DiscoveredInstance>> {
        let _ = region;
        Ok(vec![])
    }
}

/// Error used by `Provider` implementations to signal "instance absent on
/// the provider" (spec.md §4.B "Fails with `ErrNotFound`..."). Kept as a
/// downcast-able type rather than a string match so callers can
/// distinguish it from other provider failures.
#[derive(Debug, thiserror::Error)]
#[error("instance not found on provider: {0}")]
pub struct ProviderNotFound(pub String);

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "http")]
pub mod http;
