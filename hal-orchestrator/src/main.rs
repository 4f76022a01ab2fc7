//! Entrypoint. Wires `AppConfig` → `Store` → provider map → `VmPoolManager`
//! → `TaskManager` → `Orchestrator`, runs startup recovery, spawns the
//! housekeeping job loops, and serves the admin/task HTTP surface.
//! Grounded on the teacher's `main.rs` bootstrap sequence (load env, open
//! the pool, spawn jobs, serve axum) — replaced Postgres + Redis with the
//! embedded `Store` and dropped the worker-registration HTTP handlers,
//! which belonged to the teacher's self-registering vLLM workers and have
//! no counterpart in an SSH-pushed agent model.

use hal_orchestrator::admin::{self, AppState};
use hal_orchestrator::config::AppConfig;
use hal_orchestrator::orchestrator::Orchestrator;
use hal_orchestrator::pool::VmPoolManager;
use hal_orchestrator::store::Store;
use hal_orchestrator::task_manager::TaskManager;
use hal_orchestrator::jobs;
use hal_providers::Provider;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(AppConfig::from_env().map_err(|e| anyhow::anyhow!(e))?);
    tracing::info!(slots = config.slots.len(), "starting hal9999 orchestrator");

    let store = Arc::new(Store::open(&config.db_path()).await?);
    let providers = build_providers(&config)?;

    let pool = Arc::new(VmPoolManager::new(
        Arc::clone(&store),
        providers,
        config.slots.clone(),
        config.stale_task_max,
        config.stale_provision_max,
    ));
    let tasks = Arc::new(TaskManager::new(Arc::clone(&store)));

    let shell: Arc<dyn hal_remoteshell::RemoteShell> = Arc::new(hal_remoteshell::SshRemoteShell::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&tasks),
        Arc::clone(&pool),
        shell,
        Arc::clone(&config),
    ));

    orchestrator.recover().await?;
    jobs::spawn_all(Arc::clone(&pool));

    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        pool: Arc::clone(&pool),
        tasks: Arc::clone(&tasks),
        orchestrator: Arc::clone(&orchestrator),
    });
    let app = admin::router(state);

    let addr: SocketAddr = config.listen_addr.parse()?;
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Builds the provider map from configured slots (spec.md §3 "the set of
/// slots is fixed for a process lifetime"). Unknown provider kinds are a
/// fatal `ConfigError` at startup rather than a deferred runtime failure.
fn build_providers(config: &AppConfig) -> anyhow::Result<HashMap<String, Arc<dyn Provider>>> {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    for slot in &config.slots {
        let provider: Arc<dyn Provider> = match slot.provider.as_str() {
            #[cfg(feature = "mock")]
            "local" | "mock" => Arc::new(hal_providers::mock::MockProvider::new()),
            #[cfg(feature = "http")]
            other => {
                let upper = other.to_uppercase();
                let base_url = std::env::var(format!("HAL_{upper}_API_URL"))
                    .map_err(|_| anyhow::anyhow!("HAL_{upper}_API_URL must be set for slot '{other}'"))?;
                let auth_token = std::env::var(format!("HAL_{upper}_API_TOKEN"))
                    .map_err(|_| anyhow::anyhow!("HAL_{upper}_API_TOKEN must be set for slot '{other}'"))?;
                Arc::new(hal_providers::http::HttpProvider::new(
                    base_url,
                    "Authorization".to_string(),
                    auth_token,
                )?)
            }
            #[cfg(not(feature = "http"))]
            other => anyhow::bail!("unknown provider kind '{other}' (http feature disabled)"),
        };
        providers.insert(slot.name.clone(), provider);
    }
    Ok(providers)
}
