//! The wrapper script the orchestrator uploads and launches detached on
//! a VM (spec.md §4.G). This crate is a pure string-template renderer —
//! no I/O, no process spawning — kept separate from `hal-orchestrator` so
//! R2 ("wrapper script generated from the same tuple is byte-identical")
//! is testable without an SSH connection or a VM.
//!
//! Grounded on the teacher's general shape of "build a script, then hand
//! it to the remote side" (the teacher's workers pull their own startup
//! script at boot rather than having one pushed via SSH, but the
//! principle of keeping script generation as plain string assembly,
//! separate from the transport step, matches `state_machine.rs`'s pattern
//! of isolating pure state transitions from their I/O callers).

use std::fmt::Write as _;

/// Absolute path prefix for everything the wrapper reads/writes
/// (spec.md §6 on-disk layout, on-VM side).
pub const HAL_DIR: &str = "/workspace/.hal";

/// Credentials available to the wrapper (spec.md §4.G "Wrapper MUST...
/// load sensitive env from a temporary file that is sourced and then
/// deleted"). All optional — an absent credential is simply not
/// exported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    pub github_token: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub claude_code_oauth_token: Option<String>,
    pub openai_api_key: Option<String>,
    pub do_api_token: Option<String>,
    pub git_credentials: Option<String>,
}

impl CredentialSet {
    fn export_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut push = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                lines.push(format!("export {key}={}", shell_quote(v)));
            }
        };
        push("GITHUB_TOKEN", &self.github_token);
        push("ANTHROPIC_API_KEY", &self.anthropic_api_key);
        push("CLAUDE_CODE_OAUTH_TOKEN", &self.claude_code_oauth_token);
        push("OPENAI_API_KEY", &self.openai_api_key);
        push("DO_API_TOKEN", &self.do_api_token);
        push("GIT_CREDENTIALS", &self.git_credentials);
        lines
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The `(agent, context, workdir, tokens, branch, noPr, planFirst)` tuple
/// that fully determines the rendered script (spec.md R2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperContext {
    /// Shell command that invokes the coding agent, e.g.
    /// `"claude --print"`. The rendered script substitutes `{{CONTEXT}}`
    /// inside it if present, otherwise appends the context as a final
    /// positional argument.
    pub agent_command: String,
    /// User instructions / task prompt passed to the agent.
    pub context: String,
    /// Absolute path to the cloned repository on the VM.
    pub workdir: String,
    pub tokens: CredentialSet,
    pub branch: String,
    pub no_pr: bool,
    pub plan_first: bool,
}

const CRED_BLOCK_START: &str = "# HAL_CRED_BLOCK_START";
const CRED_BLOCK_END: &str = "# HAL_CRED_BLOCK_END";

/// Render the wrapper script. Pure function of `ctx` — same input always
/// produces the same output (spec.md R2).
#[must_use]
pub fn render_wrapper(ctx: &WrapperContext) -> String {
    let mut out = String::new();

    writeln!(out, "#!/usr/bin/env bash").unwrap();
    writeln!(out, "set +e").unwrap();
    writeln!(out, "cd {} || exit 1", shell_quote(&ctx.workdir)).unwrap();
    writeln!(out).unwrap();

    writeln!(out, "export PATH=\"$PATH\"").unwrap();
    writeln!(out).unwrap();

    // Credentials load from a temp file, sourced then deleted — keeps
    // secrets out of `ps`/`/proc/*/environ` of the agent's parent shell
    // for longer than strictly necessary, and lets the block below
    // self-scrub from the on-disk copy of this very script.
    writeln!(out, "{CRED_BLOCK_START}").unwrap();
    writeln!(out, "cat > /tmp/.hal_creds <<'HAL_CREDS_EOF'").unwrap();
    for line in ctx.tokens.export_lines() {
        writeln!(out, "{line}").unwrap();
    }
    writeln!(out, "HAL_CREDS_EOF").unwrap();
    writeln!(out, "chmod 600 /tmp/.hal_creds").unwrap();
    writeln!(out, "source /tmp/.hal_creds").unwrap();
    writeln!(out, "rm -f /tmp/.hal_creds").unwrap();
    writeln!(out, "{CRED_BLOCK_END}").unwrap();
    writeln!(
        out,
        "sed -i \"/{CRED_BLOCK_START}/,/{CRED_BLOCK_END}/d\" \"$0\" 2>/dev/null || true"
    )
    .unwrap();
    writeln!(out).unwrap();

    writeln!(out, "mkdir -p {HAL_DIR}/result").unwrap();
    writeln!(out, ": > {HAL_DIR}/output.log").unwrap();
    writeln!(out).unwrap();

    if ctx.plan_first {
        write_plan_first(&mut out, ctx);
    } else {
        write_single_shot(&mut out, ctx, &ctx.context, "EXIT_CODE");
    }

    writeln!(out).unwrap();
    write_finalize(&mut out, ctx);

    out
}

fn write_single_shot(out: &mut String, ctx: &WrapperContext, context: &str, exit_var: &str) {
    writeln!(out, "{} {} >> {HAL_DIR}/output.log 2>&1", ctx.agent_command, shell_quote(context)).unwrap();
    writeln!(out, "{exit_var}=$?").unwrap();
}

fn write_plan_first(out: &mut String, ctx: &WrapperContext) {
    let plan_context = format!(
        "PLAN ONLY. Do not modify the repository. Write your plan to {HAL_DIR}/plan.md. Task: {}",
        ctx.context
    );
    write_single_shot(out, ctx, &plan_context, "PLAN_EXIT_CODE");
    writeln!(out).unwrap();
    writeln!(out, "if [ -f {HAL_DIR}/plan.md ]; then").unwrap();
    writeln!(out, "  git checkout -- . 2>/dev/null || true").unwrap();
    writeln!(out, "  git clean -fd 2>/dev/null || true").unwrap();
    let execute_context = format!(
        "EXECUTE per the plan at {HAL_DIR}/plan.md. Task: {}",
        ctx.context
    );
    write_single_shot(out, ctx, &execute_context, "EXIT_CODE");
    writeln!(out, "else").unwrap();
    writeln!(out, "  EXIT_CODE=$PLAN_EXIT_CODE").unwrap();
    writeln!(out, "fi").unwrap();
}

fn write_finalize(out: &mut String, ctx: &WrapperContext) {
    writeln!(out, "if ! git diff --quiet HEAD 2>/dev/null || ! git diff --cached --quiet 2>/dev/null; then").unwrap();
    writeln!(out, "  git add -A").unwrap();
    writeln!(out, "  git -c user.name=hal9999 -c user.email=hal9999@localhost commit -m 'hal9999: agent changes' >/dev/null 2>&1 || true").unwrap();
    writeln!(out, "  git push origin {} >/dev/null 2>&1 || true", shell_quote(&ctx.branch)).unwrap();
    writeln!(out, "fi").unwrap();
    writeln!(out).unwrap();

    if !ctx.no_pr {
        writeln!(out, "gh pr view --json url -q .url > {HAL_DIR}/result/pr-url.txt 2>/dev/null || true").unwrap();
    }
    writeln!(out).unwrap();

    writeln!(out, "git diff --stat HEAD 2>/dev/null | head -n 20 > {HAL_DIR}/result/diff-stat.txt || true").unwrap();
    writeln!(out, "git diff HEAD > {HAL_DIR}/result/diff.patch 2>/dev/null || true").unwrap();
    writeln!(out).unwrap();

    writeln!(out, "echo \"$EXIT_CODE\" > {HAL_DIR}/done").unwrap();
    writeln!(out, "exit 0").unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ctx() -> WrapperContext {
        WrapperContext {
            agent_command: "claude --print".to_string(),
            context: "fix the flaky test".to_string(),
            workdir: "/workspace/myrepo".to_string(),
            tokens: CredentialSet {
                github_token: Some("ghp_abc".to_string()),
                anthropic_api_key: Some("sk-ant-xyz".to_string()),
                ..Default::default()
            },
            branch: "hal/abcd1234".to_string(),
            no_pr: false,
            plan_first: false,
        }
    }

    #[test]
    fn render_is_deterministic() {
        let ctx = sample_ctx();
        assert_eq!(render_wrapper(&ctx), render_wrapper(&ctx));
    }

    #[test]
    fn different_tokens_change_output() {
        let mut ctx = sample_ctx();
        let a = render_wrapper(&ctx);
        ctx.tokens.github_token = Some("ghp_different".to_string());
        let b = render_wrapper(&ctx);
        assert_ne!(a, b);
    }

    #[test]
    fn writes_sentinel_and_result_files() {
        let out = render_wrapper(&sample_ctx());
        assert!(out.contains(&format!("> {HAL_DIR}/done")));
        assert!(out.contains("result/diff-stat.txt"));
        assert!(out.contains("result/diff.patch"));
        assert!(out.contains("result/pr-url.txt"));
    }

    #[test]
    fn no_pr_skips_pr_lookup() {
        let mut ctx = sample_ctx();
        ctx.no_pr = true;
        let out = render_wrapper(&ctx);
        assert!(!out.contains("gh pr view"));
    }

    #[test]
    fn plan_first_runs_agent_twice_with_reset_between() {
        let mut ctx = sample_ctx();
        ctx.plan_first = true;
        let out = render_wrapper(&ctx);
        assert!(out.contains("PLAN ONLY"));
        assert!(out.contains("EXECUTE per the plan"));
        assert!(out.contains("git clean -fd"));
    }

    #[test]
    fn credential_block_is_self_scrubbing() {
        let out = render_wrapper(&sample_ctx());
        assert!(out.contains(CRED_BLOCK_START));
        assert!(out.contains(CRED_BLOCK_END));
        assert!(out.contains("sed -i"));
        assert!(out.contains("rm -f /tmp/.hal_creds"));
    }

    #[test]
    fn absent_credentials_are_not_exported() {
        let ctx = WrapperContext {
            tokens: CredentialSet::default(),
            ..sample_ctx()
        };
        let out = render_wrapper(&ctx);
        assert!(!out.contains("export GITHUB_TOKEN"));
        assert!(!out.contains("export ANTHROPIC_API_KEY"));
    }
}
