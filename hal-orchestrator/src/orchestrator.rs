//! Task execution (spec.md §4.H). Ties the pool, the task manager, SSH,
//! and the wrapper renderer together into the setup → poll → collect
//! pipeline. Grounded on the teacher's `provisioning_job.rs` for the
//! overall "acquire resource, do remote setup, watch, tear down in a
//! guaranteed finally" shape, generalized from "boot a vLLM worker and
//! wait for its HTTP heartbeat" to "run an agent over SSH and watch its
//! sentinel file."

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hal_common::{
    FinalStatus, HalError, HalResult, OutputStream, Phase, Task, TaskEvent, TaskStatus, Vm,
};
use hal_remoteshell::{CommandOutput, RemoteShell, SshTarget};
use hal_wrapper::{render_wrapper, CredentialSet, WrapperContext};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::event_writer::TaskEventWriter;
use crate::log_writer::TaskLogWriter;
use crate::pool::VmPoolManager;
use crate::store::Store;
use crate::task_manager::{NewTask, TaskManager};

const SSH_WAIT_BUDGET: Duration = Duration::from_secs(180);
const REMOTE_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Whether `execute_task` needs to run the one-time setup phase or is
/// resuming an already-launched task after a crash (spec.md §4.H
/// `Recover`).
enum ExecuteMode {
    FullSetup,
    ResumePoll,
}

pub struct Orchestrator {
    store: Arc<Store>,
    tasks: Arc<TaskManager>,
    pool: Arc<VmPoolManager>,
    shell: Arc<dyn RemoteShell>,
    config: Arc<AppConfig>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        tasks: Arc<TaskManager>,
        pool: Arc<VmPoolManager>,
        shell: Arc<dyn RemoteShell>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self { store, tasks, pool, shell, config }
    }

    /// `StartTask` (spec.md §4.H): creates the task row and fires the
    /// background run without waiting for it — the caller gets the
    /// `pending` task back immediately.
    pub async fn start_task(self: &Arc<Self>, new: NewTask) -> HalResult<Task> {
        let task = self.tasks.create(new).await?;
        let this = Arc::clone(self);
        let task_id = task.id;
        tokio::spawn(async move {
            this.run_task(task_id, ExecuteMode::FullSetup).await;
        });
        Ok(task)
    }

    /// `Recover` (spec.md §4.H): called once at startup. Tasks left in
    /// `assigned`/`running` by a crashed process either resume polling
    /// against their bound VM or are force-failed if that VM is gone.
    pub async fn recover(self: &Arc<Self>) -> HalResult<()> {
        let mut stranded = self.tasks.list_by_status(TaskStatus::Running).await?;
        stranded.extend(self.tasks.list_by_status(TaskStatus::Assigned).await?);

        for task in stranded {
            let Some(vm_id) = task.vm_id.clone() else {
                self.tasks.force_fail(task.id, "recovered task had no bound vm").await?;
                continue;
            };
            match self.store.find_vm(&vm_id).await? {
                Some(vm) if !vm.status.is_terminal() => {
                    info!(task_id = %task.id, vm_id = %vm_id, "resuming polling after recovery");
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        this.run_task(task.id, ExecuteMode::ResumePoll).await;
                    });
                }
                _ => {
                    warn!(task_id = %task.id, vm_id = %vm_id, "recovered task's vm is gone, failing");
                    self.tasks.force_fail(task.id, "bound vm missing or destroyed during recovery").await?;
                }
            }
        }
        Ok(())
    }

    async fn run_task(self: Arc<Self>, task_id: Uuid, mode: ExecuteMode) {
        let task = match self.tasks.get(task_id).await {
            Ok(t) => t,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "run_task: task vanished");
                return;
            }
        };

        let vm = match &mode {
            ExecuteMode::FullSetup => match self.pool.acquire_vm(task_id, SSH_WAIT_BUDGET).await {
                Ok(vm) => vm,
                Err(e) => {
                    let _ = self.tasks.force_fail(task_id, &format!("could not acquire vm: {e}")).await;
                    return;
                }
            },
            ExecuteMode::ResumePoll => match task.vm_id.as_deref() {
                Some(id) => match self.store.get_vm(id).await {
                    Ok(vm) => vm,
                    Err(e) => {
                        let _ = self.tasks.force_fail(task_id, &format!("vm lookup failed: {e}")).await;
                        return;
                    }
                },
                None => {
                    let _ = self.tasks.force_fail(task_id, "no bound vm to resume").await;
                    return;
                }
            },
        };

        let result = self.execute_task(&task, &vm, mode).await;
        if let Err(e) = &result {
            warn!(task_id = %task_id, error = %e, "execute_task failed");
            let _ = self.tasks.force_fail(task_id, &e.to_string()).await;
        }

        if let Err(e) = self.pool.release_vm(&vm.id).await {
            warn!(vm_id = %vm.id, error = %e, "release_vm failed after task completion");
        }
    }

    async fn execute_task(&self, task: &Task, vm: &Vm, mode: ExecuteMode) -> HalResult<()> {
        let mut target = SshTarget::new(
            vm.ip_address.clone().unwrap_or_default(),
            self.config.ssh_user.clone(),
        )
        .with_port(u16::try_from(vm.ssh_port.unwrap_or(22)).unwrap_or(22));
        if let Some(key) = &self.config.ssh_key_path {
            target = target.with_key(key.clone());
        }

        let mut events = TaskEventWriter::open(&self.config.events_dir(), task.id).await?;
        let mut log = TaskLogWriter::open(&self.config.logs_dir(), task.id).await?;
        let workdir = format!("/workspace/{}", task.slug);

        if matches!(mode, ExecuteMode::FullSetup) {
            events
                .emit(TaskEvent::TaskStart {
                    repo_url: task.repo_url.clone(),
                    context: task.context.clone(),
                    agent: task.agent.clone(),
                })
                .await?;
            events
                .emit(TaskEvent::VmAcquired {
                    vm_id: vm.id.clone(),
                    provider: vm.provider.clone(),
                    ip: vm.ip_address.clone(),
                })
                .await?;

            events.emit(TaskEvent::Phase { name: Phase::SshWait }).await?;
            self.wait_for_ssh(&target).await?;

            events.emit(TaskEvent::Phase { name: Phase::Clone }).await?;
            self.clone_repo(&target, &task.repo_url, &workdir).await?;

            events.emit(TaskEvent::Phase { name: Phase::AgentInstall }).await?;
            self.install_agent(&target, &task.agent).await?;

            let branch = task.branch.clone().unwrap_or_else(|| crate::task_manager::default_branch(task.id));
            events.emit(TaskEvent::Phase { name: Phase::BranchSetup }).await?;
            self.setup_branch(&target, &workdir, &branch).await?;

            events.emit(TaskEvent::Phase { name: Phase::AgentLaunch }).await?;
            self.launch_wrapper(&target, task, &workdir, &branch).await?;

            self.tasks.mark_running(task.id).await?;
            events.emit(TaskEvent::Phase { name: Phase::AgentRun }).await?;
        }

        self.poll_until_done(&target, task, &workdir, &mut events, &mut log).await
    }

    async fn wait_for_ssh(&self, target: &SshTarget) -> HalResult<()> {
        let deadline = Instant::now() + SSH_WAIT_BUDGET;
        loop {
            if self.shell.run(target, "true", Duration::from_secs(10)).await.map(|o| o.success()).unwrap_or(false) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HalError::Setup(format!("ssh never became reachable on {}", target.host)));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn clone_repo(&self, target: &SshTarget, repo_url: &str, workdir: &str) -> HalResult<()> {
        let cmd = format!(
            "rm -rf {workdir} && git clone --depth 1 {} {workdir}",
            shell_quote(repo_url)
        );
        let out = self.run_checked(target, &cmd, REMOTE_STEP_TIMEOUT).await?;
        if !out.success() {
            return Err(HalError::Setup(format!("git clone failed: {}", out.stderr_lossy())));
        }
        Ok(())
    }

    /// Agent-install command, keyed by the task's requested agent
    /// (spec.md §4.G "agent-specific bootstrap"). Idempotent — `-g`
    /// installs are no-ops if already present.
    async fn install_agent(&self, target: &SshTarget, agent: &str) -> HalResult<()> {
        let cmd = match agent {
            "claude" | "claude-code" => "npm install -g @anthropic-ai/claude-code 2>&1 | tail -n 5",
            "codex" => "npm install -g @openai/codex 2>&1 | tail -n 5",
            other => {
                return Err(HalError::Config(format!("unknown agent '{other}'")));
            }
        };
        let out = self.run_checked(target, cmd, REMOTE_STEP_TIMEOUT).await?;
        if !out.success() {
            return Err(HalError::Setup(format!("agent install failed: {}", out.stderr_lossy())));
        }
        Ok(())
    }

    async fn setup_branch(&self, target: &SshTarget, workdir: &str, branch: &str) -> HalResult<()> {
        let cmd = format!("cd {workdir} && git checkout -b {}", shell_quote(branch));
        let out = self.run_checked(target, &cmd, Duration::from_secs(30)).await?;
        if !out.success() {
            return Err(HalError::Setup(format!("branch setup failed: {}", out.stderr_lossy())));
        }
        Ok(())
    }

    fn agent_command(agent: &str) -> &'static str {
        match agent {
            "codex" => "codex exec --full-auto",
            _ => "claude --print --dangerously-skip-permissions",
        }
    }

    async fn launch_wrapper(&self, target: &SshTarget, task: &Task, workdir: &str, branch: &str) -> HalResult<()> {
        let ctx = WrapperContext {
            agent_command: Self::agent_command(&task.agent).to_string(),
            context: task.context.clone(),
            workdir: workdir.to_string(),
            tokens: CredentialSet {
                github_token: self.config.github_token.clone(),
                anthropic_api_key: self.config.anthropic_api_key.clone(),
                claude_code_oauth_token: self.config.claude_code_oauth_token.clone(),
                openai_api_key: self.config.openai_api_key.clone(),
                do_api_token: None,
                git_credentials: None,
            },
            branch: branch.to_string(),
            no_pr: false,
            plan_first: false,
        };
        let script = render_wrapper(&ctx);
        let encoded = BASE64.encode(script.as_bytes());

        let mkdir_cmd = format!("mkdir -p {workdir}/.hal");
        self.run_checked(target, &mkdir_cmd, Duration::from_secs(15)).await?;

        let upload_cmd = format!("base64 -d > {workdir}/.hal/run.sh && chmod +x {workdir}/.hal/run.sh");
        let out = self
            .shell
            .run_with_stdin(target, &upload_cmd, encoded.as_bytes(), Duration::from_secs(30))
            .await
            .map_err(|e| HalError::RemoteLaunch(e.to_string()))?;
        if !out.success() {
            return Err(HalError::RemoteLaunch(format!("wrapper upload failed: {}", out.stderr_lossy())));
        }

        let launch_cmd = format!("cd {workdir} && nohup bash .hal/run.sh >/dev/null 2>&1 < /dev/null & disown; echo launched");
        let out = self
            .shell
            .spawn_detached(target, &launch_cmd, Duration::from_secs(30))
            .await
            .map_err(|e| HalError::RemoteLaunch(e.to_string()))?;
        if !out.success() {
            return Err(HalError::RemoteLaunch(format!("wrapper launch failed: {}", out.stderr_lossy())));
        }
        Ok(())
    }

    /// Poll phase (spec.md §4.H, 5s interval). Resumes from the existing
    /// local log file's byte length so a recovered task never re-fetches
    /// bytes it already has (doubles as the `ResumePoll` continuation
    /// point — no separate offset bookkeeping needed).
    async fn poll_until_done(
        &self,
        target: &SshTarget,
        task: &Task,
        workdir: &str,
        events: &mut TaskEventWriter,
        log: &mut TaskLogWriter,
    ) -> HalResult<()> {
        let mut offset = tokio::fs::metadata(log.path()).await.map(|m| m.len()).unwrap_or(0);
        let start = Instant::now();

        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            self.tasks.heartbeat(task.id).await?;

            if start.elapsed() > self.config.agent_timeout {
                warn!(task_id = %task.id, "agent wall-clock timeout exceeded, killing remote process");
                let kill_cmd = format!("pkill -f run.sh; echo timeout > {workdir}/.hal/done");
                let _ = self.shell.run(target, &kill_cmd, Duration::from_secs(15)).await;
                // Fall through to the done-file collection below: the
                // `echo timeout` just written satisfies it on this same
                // pass, coercing to exit_code=1 via the non-numeric
                // fallback.
            }

            let tail_cmd = format!("tail -c +{} {workdir}/.hal/output.log 2>/dev/null", offset + 1);
            if let Ok(out) = self.shell.run(target, &tail_cmd, Duration::from_secs(15)).await {
                if !out.stdout.is_empty() {
                    log.append(&out.stdout).await?;
                    offset += out.stdout.len() as u64;
                    events
                        .emit(TaskEvent::Output { stream: OutputStream::Stdout, text: out.stdout_lossy() })
                        .await?;
                }
            }

            let done_cmd = format!("cat {workdir}/.hal/done 2>/dev/null");
            let done_out = match self.shell.run(target, &done_cmd, Duration::from_secs(15)).await {
                Ok(o) => o,
                Err(_) => continue,
            };
            let done_text = done_out.stdout_lossy();
            if done_text.trim().is_empty() {
                continue;
            }

            let exit_code: i64 = done_text.trim().parse().unwrap_or(1);
            log.write_sentinel(exit_code).await?;

            let diff_stat = self
                .shell
                .run(target, &format!("cat {workdir}/.hal/result/diff-stat.txt 2>/dev/null"), Duration::from_secs(15))
                .await
                .map(|o| o.stdout_lossy())
                .unwrap_or_default();
            let pr_url_raw = self
                .shell
                .run(target, &format!("cat {workdir}/.hal/result/pr-url.txt 2>/dev/null"), Duration::from_secs(15))
                .await
                .map(|o| o.stdout_lossy())
                .unwrap_or_default();
            let pr_url = {
                let trimmed = pr_url_raw.trim();
                if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
            };

            let status = if exit_code == 0 { TaskStatus::Completed } else { TaskStatus::Failed };
            self.tasks.complete(task.id, status, &diff_stat, Some(exit_code), pr_url.as_deref()).await?;
            events
                .emit(TaskEvent::TaskEnd {
                    status: if status == TaskStatus::Completed { FinalStatus::Completed } else { FinalStatus::Failed },
                    exit_code: Some(exit_code),
                    error: None,
                    pr_url,
                })
                .await?;
            return Ok(());
        }
    }

    async fn run_checked(&self, target: &SshTarget, cmd: &str, timeout: Duration) -> HalResult<CommandOutput> {
        self.shell
            .run(target, cmd, timeout)
            .await
            .map_err(|e| HalError::RemoteLaunch(e.to_string()))
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pool::VmPoolManager;
    use hal_common::ProviderSlot;
    use hal_providers::mock::MockProvider;
    use hal_providers::Provider;
    use hal_remoteshell::{CommandOutput, FakeRemoteShell};
    use std::collections::HashMap;

    fn slot() -> ProviderSlot {
        ProviderSlot {
            name: "local".to_string(),
            provider: "local".to_string(),
            snapshot_id: "img".to_string(),
            region: "local".to_string(),
            plan: "small".to_string(),
            max_pool_size: 5,
            priority: 0,
            idle_timeout_ms: 600_000,
            min_ready: 0,
            ssh_key_ids: vec![],
        }
    }

    fn test_config() -> AppConfig {
        AppConfig {
            slots: vec![slot()],
            data_dir: std::env::temp_dir().join(format!("hal-test-{}", Uuid::new_v4())),
            listen_addr: "127.0.0.1:0".to_string(),
            stale_task_max: Duration::from_secs(600),
            stale_provision_max: Duration::from_secs(600),
            agent_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(10),
            ssh_user: "root".to_string(),
            ssh_key_path: None,
            github_token: None,
            anthropic_api_key: None,
            claude_code_oauth_token: None,
            openai_api_key: None,
        }
    }

    async fn harness() -> (Arc<Orchestrator>, Arc<FakeRemoteShell>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let providers: HashMap<String, Arc<dyn Provider>> = {
            let mut m: HashMap<String, Arc<dyn Provider>> = HashMap::new();
            m.insert("local".to_string(), Arc::new(MockProvider::new()));
            m
        };
        let pool = Arc::new(VmPoolManager::new(
            Arc::clone(&store),
            providers,
            vec![slot()],
            Duration::from_secs(600),
            Duration::from_secs(600),
        ));
        let tasks = Arc::new(TaskManager::new(Arc::clone(&store)));
        let shell = Arc::new(FakeRemoteShell::new());
        let config = Arc::new(test_config());
        let orch = Arc::new(Orchestrator::new(store, tasks, pool, shell.clone(), config));
        (orch, shell)
    }

    #[tokio::test]
    async fn happy_path_completes_and_releases_vm() {
        let (orch, shell) = harness().await;
        shell.push_response(
            ".hal/done",
            CommandOutput { status: Some(0), stdout: b"0\n".to_vec(), stderr: vec![] },
        );

        let task = orch
            .tasks
            .create(NewTask {
                repo_url: "https://example.com/r.git".to_string(),
                context: "fix it".to_string(),
                agent: "claude".to_string(),
                branch: None,
            })
            .await
            .unwrap();

        let vm = orch.pool.acquire_vm(task.id, Duration::from_secs(5)).await.unwrap();
        let result = orch.execute_task(&task, &vm, ExecuteMode::FullSetup).await;
        assert!(result.is_ok());

        let fetched = orch.tasks.get(task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.exit_code, Some(0));
    }

    #[tokio::test]
    async fn nonzero_exit_marks_task_failed() {
        let (orch, shell) = harness().await;
        shell.push_response(
            ".hal/done",
            CommandOutput { status: Some(0), stdout: b"1\n".to_vec(), stderr: vec![] },
        );

        let task = orch
            .tasks
            .create(NewTask {
                repo_url: "r".to_string(),
                context: "c".to_string(),
                agent: "claude".to_string(),
                branch: None,
            })
            .await
            .unwrap();
        let vm = orch.pool.acquire_vm(task.id, Duration::from_secs(5)).await.unwrap();
        orch.execute_task(&task, &vm, ExecuteMode::FullSetup).await.unwrap();

        let fetched = orch.tasks.get(task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Failed);
        assert_eq!(fetched.exit_code, Some(1));
    }

    #[tokio::test]
    async fn unknown_agent_fails_setup() {
        let (orch, _shell) = harness().await;
        let task = orch
            .tasks
            .create(NewTask {
                repo_url: "r".to_string(),
                context: "c".to_string(),
                agent: "some-unknown-agent".to_string(),
                branch: None,
            })
            .await
            .unwrap();
        let vm = orch.pool.acquire_vm(task.id, Duration::from_secs(5)).await.unwrap();
        let err = orch.execute_task(&task, &vm, ExecuteMode::FullSetup).await.unwrap_err();
        assert!(err.to_string().contains("unknown agent"));
    }
}
