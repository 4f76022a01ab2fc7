//! Background job loops (spec.md §4.F housekeeping, consolidated).
//! Grounded on the teacher's four separate jobs —
//! `watch_dog_job.rs`/`terminator_job.rs`/`provisioning_job.rs`/
//! `recovery_job.rs`, each its own `tokio::time::interval` loop claiming
//! rows with Postgres `SKIP LOCKED` — folded here into a handful of
//! `VmPoolManager` methods run on their own intervals. `SKIP LOCKED` has
//! no counterpart: this store has exactly one writer connection, so two
//! loops in the same process never contend for the same row.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::pool::VmPoolManager;

const IDLE_REAP_INTERVAL: Duration = Duration::from_secs(30);
const STALE_PROVISIONING_INTERVAL: Duration = Duration::from_secs(30);
const ORPHAN_RELEASE_INTERVAL: Duration = Duration::from_secs(20);
const WARM_POOL_INTERVAL: Duration = Duration::from_secs(15);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

/// Spawns every periodic housekeeping loop and returns immediately;
/// loops run for the lifetime of the process (no shutdown handle —
/// spec.md names no graceful-drain requirement for these).
pub fn spawn_all(pool: Arc<VmPoolManager>) {
    spawn_loop("reap_idle_vms", IDLE_REAP_INTERVAL, Arc::clone(&pool), |p| async move {
        p.reap_idle_vms().await.map(|_| ())
    });
    spawn_loop("reap_stale_provisioning", STALE_PROVISIONING_INTERVAL, Arc::clone(&pool), |p| async move {
        p.reap_stale_provisioning().await.map(|_| ())
    });
    spawn_loop("release_orphans", ORPHAN_RELEASE_INTERVAL, Arc::clone(&pool), |p| async move {
        p.release_orphans().await.map(|_| ())
    });
    spawn_loop("reap_error_vms", STALE_PROVISIONING_INTERVAL, Arc::clone(&pool), |p| async move {
        p.reap_error_vms().await.map(|_| ())
    });

    let warm_pool = Arc::clone(&pool);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(WARM_POOL_INTERVAL);
        loop {
            ticker.tick().await;
            warm_pool.ensure_warm().await;
        }
    });

    let reconcile_pool = Arc::clone(&pool);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        loop {
            ticker.tick().await;
            match reconcile_pool.reconcile().await {
                Ok(report) => {
                    if report.updated > 0 || report.destroyed > 0 {
                        info!(updated = report.updated, destroyed = report.destroyed, "reconcile pass");
                    }
                }
                Err(e) => error!(error = %e, "reconcile pass failed"),
            }
        }
    });
}

fn spawn_loop<F, Fut>(name: &'static str, interval: Duration, pool: Arc<VmPoolManager>, f: F)
where
    F: Fn(Arc<VmPoolManager>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = hal_common::HalResult<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = f(Arc::clone(&pool)).await {
                error!(job = name, error = %e, "housekeeping job failed");
            }
        }
    });
}
