//! One-shot command execution: the array-form `shell` tool (direct exec,
//! no shell interpretation) and the string-form `shell_command` tool
//! (wrapped through the user's detected shell).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::command_safety;
use crate::error::Result;
use crate::error::TetherErr;
use crate::shell;
use crate::tools::context::NoopSandbox;
use crate::tools::context::SandboxMode;
use crate::tools::context::SandboxWrapper;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolOutput;
use crate::tools::handlers::resolve_workdir;
use crate::tools::registry::ToolHandler;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

fn default_login() -> bool {
    true
}

#[derive(Deserialize)]
struct ShellArgs {
    command: Vec<String>,
}

#[derive(Deserialize)]
struct ShellCommandArgs {
    command: String,
    #[serde(default = "default_login")]
    login: bool,
}

pub struct ShellHandler {
    sandbox: Arc<dyn SandboxWrapper>,
}

impl Default for ShellHandler {
    fn default() -> Self {
        Self {
            sandbox: Arc::new(NoopSandbox),
        }
    }
}

impl ShellHandler {
    pub fn with_sandbox(sandbox: Arc<dyn SandboxWrapper>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl ToolHandler for ShellHandler {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn is_mutating(&self, inv: &ToolInvocation) -> bool {
        match serde_json::from_value::<ShellArgs>(inv.arguments.clone()) {
            Ok(args) if !args.command.is_empty() => {
                !command_safety::is_known_safe_command(&args.command)
            }
            _ => true,
        }
    }

    async fn handle(&self, inv: ToolInvocation) -> Result<ToolOutput> {
        let args: ShellArgs = serde_json::from_value(inv.arguments.clone())
            .map_err(|err| TetherErr::Validation(format!("invalid shell arguments: {err}")))?;
        if args.command.is_empty() {
            return Err(TetherErr::Validation("command array cannot be empty".into()));
        }
        run_command(args.command, &inv, self.sandbox.as_ref()).await
    }
}

pub struct ShellCommandHandler {
    sandbox: Arc<dyn SandboxWrapper>,
}

impl Default for ShellCommandHandler {
    fn default() -> Self {
        Self {
            sandbox: Arc::new(NoopSandbox),
        }
    }
}

impl ShellCommandHandler {
    pub fn with_sandbox(sandbox: Arc<dyn SandboxWrapper>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl ToolHandler for ShellCommandHandler {
    fn name(&self) -> &'static str {
        "shell_command"
    }

    fn is_mutating(&self, inv: &ToolInvocation) -> bool {
        match serde_json::from_value::<ShellCommandArgs>(inv.arguments.clone()) {
            Ok(args) if !args.command.is_empty() => {
                let command = shell::detect_user_shell().derive_exec_args(&args.command, args.login);
                !command_safety::is_known_safe_command(&command)
            }
            _ => true,
        }
    }

    async fn handle(&self, inv: ToolInvocation) -> Result<ToolOutput> {
        let args: ShellCommandArgs = serde_json::from_value(inv.arguments.clone())
            .map_err(|err| {
                TetherErr::Validation(format!("invalid shell_command arguments: {err}"))
            })?;
        if args.command.is_empty() {
            return Err(TetherErr::Validation("command cannot be empty".into()));
        }
        let command = shell::detect_user_shell().derive_exec_args(&args.command, args.login);
        run_command(command, &inv, self.sandbox.as_ref()).await
    }
}

/// Shared execution path. The sandbox seam wraps the command vector when a
/// wrapper is deployed; escalated re-runs arrive with `SandboxMode::None`.
async fn run_command(
    command: Vec<String>,
    inv: &ToolInvocation,
    sandbox: &dyn SandboxWrapper,
) -> Result<ToolOutput> {
    let command = match inv.sandbox {
        SandboxMode::None => command,
        mode => sandbox.wrap(command, mode),
    };
    let cwd = resolve_workdir(inv);

    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..])
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|err| TetherErr::Validation(format!("failed to start command: {err}")))?;

    let output = match tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Ok(ToolOutput::failed(format!(
                "command timed out after {}s",
                COMMAND_TIMEOUT.as_secs()
            )));
        }
    };

    let content = aggregate_output(&output.stdout, &output.stderr);
    if output.status.success() {
        Ok(ToolOutput::ok(content))
    } else {
        Ok(ToolOutput::failed(content))
    }
}

/// Stdout followed by stderr, without inventing separators for empty
/// streams.
fn aggregate_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut out = String::from_utf8_lossy(stdout).to_string();
    if !stderr.is_empty() {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&String::from_utf8_lossy(stderr));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::context::SandboxMode;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::PathBuf;

    fn inv(tool: &str, arguments: serde_json::Value) -> ToolInvocation {
        ToolInvocation {
            call_id: "c1".into(),
            tool_name: tool.into(),
            arguments,
            cwd: PathBuf::from("."),
            sandbox: SandboxMode::None,
            heartbeat: None,
        }
    }

    #[tokio::test]
    async fn shell_runs_argument_vector() {
        let output = ShellHandler::default()
            .handle(inv("shell", json!({"command": ["echo", "array form"]})))
            .await
            .expect("run");
        assert!(output.success);
        assert!(output.content.contains("array form"));
    }

    #[tokio::test]
    async fn shell_command_runs_through_a_shell() {
        let output = ShellCommandHandler::default()
            .handle(inv(
                "shell_command",
                json!({"command": "echo one && echo two", "login": false}),
            ))
            .await
            .expect("run");
        assert!(output.success);
        assert!(output.content.contains("one"));
        assert!(output.content.contains("two"));
    }

    #[tokio::test]
    async fn failing_command_reports_failure_with_stderr() {
        let output = ShellCommandHandler::default()
            .handle(inv(
                "shell_command",
                json!({"command": "echo oops >&2; exit 3", "login": false}),
            ))
            .await
            .expect("run");
        assert!(!output.success);
        assert!(output.content.contains("oops"));
    }

    #[tokio::test]
    async fn empty_command_is_a_validation_error() {
        let err = ShellHandler::default()
            .handle(inv("shell", json!({"command": []})))
            .await
            .expect_err("reject");
        assert!(matches!(err, TetherErr::Validation(_)));
    }

    #[test]
    fn mutating_classification_uses_the_safe_list() {
        let handler = ShellHandler::default();
        assert!(!handler.is_mutating(&inv("shell", json!({"command": ["ls"]}))));
        assert!(handler.is_mutating(&inv("shell", json!({"command": ["rm", "-rf", "x"]}))));
        assert!(handler.is_mutating(&inv("shell", json!({"bogus": true}))));
    }

    #[test]
    fn aggregates_stdout_then_stderr() {
        assert_eq!(aggregate_output(b"out\n", b"err\n"), "out\nerr\n");
        assert_eq!(aggregate_output(b"", b"err\n"), "err\n");
        assert_eq!(aggregate_output(b"out", b"err"), "out\nerr");
    }
}
