//! Remote command execution over SSH (spec.md §4.C, §5). The pool and
//! orchestrator never shell out directly — they go through this trait, the
//! same way the teacher's HTTP handlers never touch cloud APIs directly
//! and go through `CloudProvider` instead.
//!
//! Grounded on `odralabshq-polis/cli/src/command_runner.rs`'s
//! `TokioCommandRunner`: the teacher repo has no SSH layer of its own
//! (workers there self-register over HTTP), so this crate's shape comes
//! from `polis` instead. Kept verbatim: the `tokio::select!` +
//! `child.kill()` timeout pattern (plain `tokio::time::timeout` around
//! `.output().await` does not kill the child on Windows), concurrent
//! stdout/stderr draining via `tokio::join!` to avoid pipe-buffer deadlock,
//! and writing stdin from a spawned task so it doesn't block the stdout
//! read. Generalized from "run the local `multipass`/`ssh` binary with
//! fixed args" to "run `ssh` against an arbitrary `SshTarget`".

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Connection details for one VM (spec.md §4.C). Built from the VM
/// record's `ip` plus the slot's configured SSH user/key — never
/// persisted itself.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
}

impl SshTarget {
    #[must_use]
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: 22,
            key_path: None,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_key(mut self, key_path: PathBuf) -> Self {
        self.key_path = Some(key_path);
        self
    }
}

/// Result of a completed remote command. `status` is `None` when the
/// process was killed (timeout) rather than exiting normally.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Generic remote execution over SSH. Not tied to any particular VM
/// provider — the pool hands this a host/user/port and never cares how
/// the instance was provisioned (spec.md §4.C).
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` via `sh -c`, waiting up to `timeout` for completion.
    async fn run(&self, target: &SshTarget, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Run `command`, piping `input` to its stdin.
    async fn run_with_stdin(
        &self,
        target: &SshTarget,
        command: &str,
        input: &[u8],
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Launch `command` so it keeps running after the SSH session ends
    /// (spec.md §4.G "detached via nohup"). Returns once the launcher
    /// itself exits — not once `command` finishes.
    async fn spawn_detached(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput>;
}

/// Production `RemoteShell` — shells out to the system `ssh` binary.
pub struct SshRemoteShell;

impl Default for SshRemoteShell {
    fn default() -> Self {
        Self::new()
    }
}

impl SshRemoteShell {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// `ssh` args common to every invocation (spec.md §5): a short
    /// connect timeout so a dead host fails fast, `BatchMode=yes` so a
    /// stuck passphrase prompt can never hang the orchestrator, and host
    /// key checking disabled because pool VMs are short-lived and never
    /// reused under the same IP with a different identity.
    fn base_args(&self, target: &SshTarget) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-p".to_string(),
            target.port.to_string(),
        ];
        if let Some(key) = &target.key_path {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().into_owned());
        }
        args.push(format!("{}@{}", target.user, target.host));
        args
    }
}

#[async_trait]
impl RemoteShell for SshRemoteShell {
    async fn run(&self, target: &SshTarget, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let mut args = self.base_args(target);
        args.push(command.to_string());

        let mut child = tokio::process::Command::new("ssh")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn ssh")?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    drain(&mut stdout_handle),
                    drain(&mut stderr_handle),
                );
                Ok(CommandOutput {
                    status: status.context("waiting for ssh")?.code(),
                    stdout,
                    stderr,
                })
            } => result,
            () = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                anyhow::bail!("ssh command timed out after {}s: {command}", timeout.as_secs())
            }
        }
    }

    async fn run_with_stdin(
        &self,
        target: &SshTarget,
        command: &str,
        input: &[u8],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut args = self.base_args(target);
        args.push(command.to_string());

        let mut child = tokio::process::Command::new("ssh")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn ssh")?;

        let stdin_handle = child.stdin.take();
        let input_owned = input.to_vec();
        let stdin_task = tokio::spawn(async move {
            if let Some(mut stdin) = stdin_handle {
                let _ = stdin.write_all(&input_owned).await;
            }
        });

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    drain(&mut stdout_handle),
                    drain(&mut stderr_handle),
                );
                let _ = stdin_task.await;
                Ok(CommandOutput {
                    status: status.context("waiting for ssh")?.code(),
                    stdout,
                    stderr,
                })
            } => result,
            () = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                anyhow::bail!("ssh command timed out after {}s: {command}", timeout.as_secs())
            }
        }
    }

    async fn spawn_detached(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        // The wrapper script backgrounds itself with nohup and exits the
        // launcher fast, so this reuses the plain timed `run` path — the
        // timeout here only bounds the launch, never the task itself.
        self.run(target, command, timeout).await
    }
}

async fn drain(handle: &mut Option<impl tokio::io::AsyncRead + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.read_to_end(&mut buf).await;
    }
    buf
}

/// Test double returning canned responses keyed by a substring match on
/// the command, so callers can script a poll-loop sequence
/// (spec.md §8 scenario fixtures) without a real SSH connection.
pub struct FakeRemoteShell {
    responses: std::sync::Mutex<Vec<(String, CommandOutput)>>,
    calls: std::sync::Mutex<Vec<String>>,
}

impl Default for FakeRemoteShell {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemoteShell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(Vec::new()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Queue a canned response for the next command whose text contains
    /// `substring`. Matched in insertion order, first match wins, and
    /// each entry is consumed at most once.
    pub fn push_response(&self, substring: impl Into<String>, output: CommandOutput) {
        self.responses.lock().unwrap().push((substring.into(), output));
    }

    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn take_response(&self, command: &str) -> CommandOutput {
        let mut responses = self.responses.lock().unwrap();
        if let Some(pos) = responses.iter().position(|(sub, _)| command.contains(sub.as_str())) {
            responses.remove(pos).1
        } else {
            CommandOutput {
                status: Some(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            }
        }
    }
}

#[async_trait]
impl RemoteShell for FakeRemoteShell {
    async fn run(&self, _target: &SshTarget, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.to_string());
        Ok(self.take_response(command))
    }

    async fn run_with_stdin(
        &self,
        _target: &SshTarget,
        command: &str,
        _input: &[u8],
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.to_string());
        Ok(self.take_response(command))
    }

    async fn spawn_detached(
        &self,
        _target: &SshTarget,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.to_string());
        Ok(self.take_response(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_shell_replays_queued_response() {
        let shell = FakeRemoteShell::new();
        shell.push_response(
            "cat /workspace/.hal/done",
            CommandOutput {
                status: Some(0),
                stdout: b"done\n".to_vec(),
                stderr: Vec::new(),
            },
        );

        let target = SshTarget::new("10.0.0.1", "agent");
        let out = shell
            .run(&target, "cat /workspace/.hal/done", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_lossy(), "done\n");
        assert_eq!(shell.calls(), vec!["cat /workspace/.hal/done".to_string()]);
    }

    #[tokio::test]
    async fn fake_shell_defaults_to_success_when_unmatched() {
        let shell = FakeRemoteShell::new();
        let target = SshTarget::new("10.0.0.1", "agent");
        let out = shell.run(&target, "echo hi", Duration::from_secs(5)).await.unwrap();
        assert!(out.success());
    }
}
