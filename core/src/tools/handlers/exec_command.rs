//! Handlers bridging the `exec_command` / `write_stdin` tools to the
//! session manager.

use std::sync::Arc;

use async_trait::async_trait;

use crate::command_safety;
use crate::error::Result;
use crate::error::TetherErr;
use crate::exec_sessions::ExecCommandParams;
use crate::exec_sessions::ExecSessionManager;
use crate::exec_sessions::WriteStdinParams;
use crate::shell;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolOutput;
use crate::tools::handlers::resolve_workdir;
use crate::tools::registry::ToolHandler;

pub struct ExecCommandHandler {
    manager: Arc<ExecSessionManager>,
}

impl ExecCommandHandler {
    pub fn new(manager: Arc<ExecSessionManager>) -> Self {
        Self { manager }
    }
}

fn shell_supports_lc(shell_bin: &str) -> bool {
    let lower = shell_bin.to_ascii_lowercase();
    !(lower.contains("powershell") || lower.contains("pwsh"))
}

#[async_trait]
impl ToolHandler for ExecCommandHandler {
    fn name(&self) -> &'static str {
        "exec_command"
    }

    fn is_mutating(&self, inv: &ToolInvocation) -> bool {
        let Some(cmd) = inv.arguments.get("cmd").and_then(serde_json::Value::as_str) else {
            return true;
        };
        let login = inv
            .arguments
            .get("login")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);
        let command = shell::detect_user_shell().derive_exec_args(cmd, login);
        !command_safety::is_known_safe_command(&command)
    }

    async fn handle(&self, inv: ToolInvocation) -> Result<ToolOutput> {
        let mut params: ExecCommandParams = serde_json::from_value(inv.arguments.clone())
            .map_err(|err| {
                TetherErr::Validation(format!("invalid exec_command arguments: {err}"))
            })?;

        if let Some(shell_bin) = &params.shell {
            if !shell_supports_lc(shell_bin) {
                return Err(TetherErr::Validation(format!(
                    "exec_command shell `{shell_bin}` is not supported (requires -lc/-c \
                     semantics); use bash, zsh, or sh"
                )));
            }
        }

        // Default the workdir to the invocation cwd.
        let workdir = resolve_workdir(&inv);
        params.workdir = Some(workdir.to_string_lossy().to_string());

        let outcome = self
            .manager
            .exec_command(params, &inv.cwd, inv.heartbeat_ref())
            .await?;
        Ok(ToolOutput {
            content: outcome.render(),
            success: outcome.success(),
        })
    }
}

pub struct WriteStdinHandler {
    manager: Arc<ExecSessionManager>,
}

impl WriteStdinHandler {
    pub fn new(manager: Arc<ExecSessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolHandler for WriteStdinHandler {
    fn name(&self) -> &'static str {
        "write_stdin"
    }

    fn is_mutating(&self, _inv: &ToolInvocation) -> bool {
        false
    }

    async fn handle(&self, inv: ToolInvocation) -> Result<ToolOutput> {
        let params: WriteStdinParams = serde_json::from_value(inv.arguments.clone())
            .map_err(|err| TetherErr::Validation(format!("invalid write_stdin arguments: {err}")))?;

        match self
            .manager
            .write_stdin(params, inv.heartbeat_ref())
            .await
        {
            Ok(outcome) => Ok(ToolOutput {
                content: outcome.render(),
                success: outcome.success(),
            }),
            Err(TetherErr::UnknownSessionId(id)) => Ok(ToolOutput::failed(format!(
                "Unknown session ID: {id}. The process may have already exited."
            ))),
            Err(TetherErr::StdinClosed) => Ok(ToolOutput::failed(
                "Failed to write to stdin: this session does not accept input (pipe mode).",
            )),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::context::SandboxMode;
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
    async fn exec_command_formats_exited_process() {
        let handler = ExecCommandHandler::new(Arc::new(ExecSessionManager::new()));
        let output = handler
            .handle(inv(
                "exec_command",
                json!({"cmd": "echo from tool", "login": false, "yield_time_ms": 5000}),
            ))
            .await
            .expect("run");

        assert!(output.success);
        assert!(output.content.contains("--- Exit code: 0 ---"));
        assert!(output.content.contains("from tool"));
        assert!(!output.content.contains("Session ID"));
    }

    #[tokio::test]
    async fn long_running_command_returns_session_id() {
        let manager = Arc::new(ExecSessionManager::new());
        let handler = ExecCommandHandler::new(Arc::clone(&manager));
        let output = handler
            .handle(inv(
                "exec_command",
                json!({"cmd": "sleep 60", "login": false, "yield_time_ms": 300}),
            ))
            .await
            .expect("run");

        assert!(output.success);
        assert!(output.content.contains("--- Session ID: "));
        assert!(!output.content.contains("Exit code"));
        assert_eq!(manager.store().count(), 1);
    }

    #[tokio::test]
    async fn write_stdin_unknown_session_reports_failure() {
        let handler = WriteStdinHandler::new(Arc::new(ExecSessionManager::new()));
        let output = handler
            .handle(inv("write_stdin", json!({"session_id": 1234, "chars": ""})))
            .await
            .expect("run");

        assert!(!output.success);
        assert!(output.content.contains("Unknown session ID"));
    }

    #[tokio::test]
    async fn powershell_is_rejected() {
        let handler = ExecCommandHandler::new(Arc::new(ExecSessionManager::new()));
        let err = handler
            .handle(inv(
                "exec_command",
                json!({"cmd": "ls", "shell": "powershell.exe"}),
            ))
            .await
            .expect_err("reject");
        assert!(matches!(err, TetherErr::Validation(_)));
    }
}
