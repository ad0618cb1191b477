//! Tool handler trait and the name-keyed registry the dispatcher uses.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::error::TetherErr;
use crate::exec_sessions::ExecSessionManager;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolKind;
use crate::tools::context::ToolOutput;
use crate::tools::handlers;
use tether_protocol::FunctionCallOutputPayload;
use tether_protocol::ToolsConfig;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> ToolKind {
        ToolKind::Function
    }

    /// Whether this invocation can change the environment. Consulted by
    /// the approval gate; defaults to the safe answer.
    fn is_mutating(&self, _inv: &ToolInvocation) -> bool {
        true
    }

    async fn handle(&self, inv: ToolInvocation) -> Result<ToolOutput>;
}

pub struct ToolRegistry {
    handlers: HashMap<&'static str, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    /// Build the registry for the enabled tool families.
    pub fn new(config: &ToolsConfig, exec_manager: Arc<ExecSessionManager>) -> Self {
        let mut handlers: HashMap<&'static str, Arc<dyn ToolHandler>> = HashMap::new();
        let mut add = |handler: Arc<dyn ToolHandler>| {
            handlers.insert(handler.name(), handler);
        };

        if config.shell {
            add(Arc::new(handlers::shell::ShellHandler::default()));
            add(Arc::new(handlers::shell::ShellCommandHandler::default()));
        }
        if config.exec_sessions {
            add(Arc::new(handlers::exec_command::ExecCommandHandler::new(
                Arc::clone(&exec_manager),
            )));
            add(Arc::new(handlers::exec_command::WriteStdinHandler::new(
                exec_manager,
            )));
        }
        if config.read_file {
            add(Arc::new(handlers::read_file::ReadFileHandler));
        }
        if config.write_file {
            add(Arc::new(handlers::write_file::WriteFileHandler));
        }
        if config.list_dir {
            add(Arc::new(handlers::list_dir::ListDirHandler));
        }
        if config.grep_files {
            add(Arc::new(handlers::grep_files::GrepFilesHandler));
        }
        if config.apply_patch {
            add(Arc::new(handlers::apply_patch::ApplyPatchHandler));
        }

        Self { handlers }
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).map(Arc::clone)
    }

    /// Run one invocation to completion, folding every failure mode into
    /// a `function_call_output` payload. Nothing escapes as an error.
    pub async fn dispatch(&self, inv: ToolInvocation) -> FunctionCallOutputPayload {
        let handler = match self.handler(&inv.tool_name) {
            Some(handler) => handler,
            None => {
                return FunctionCallOutputPayload::failed(format!(
                    "unsupported call: {}",
                    inv.tool_name
                ));
            }
        };

        match handler.handle(inv).await {
            Ok(output) => FunctionCallOutputPayload {
                content: output.content,
                success: Some(output.success),
            },
            Err(TetherErr::Validation(message)) => {
                warn!(message = %message, "tool call rejected");
                FunctionCallOutputPayload::failed(message)
            }
            Err(err) => FunctionCallOutputPayload::failed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use crate::tools::context::SandboxMode;

    fn registry() -> ToolRegistry {
        ToolRegistry::new(
            &ToolsConfig::default(),
            Arc::new(ExecSessionManager::new()),
        )
    }

    #[tokio::test]
    async fn unknown_tool_yields_failed_output() {
        let reg = registry();
        let output = reg
            .dispatch(ToolInvocation {
                call_id: "c1".into(),
                tool_name: "browse_web".into(),
                arguments: json!({}),
                cwd: PathBuf::from("."),
                sandbox: SandboxMode::None,
                heartbeat: None,
            })
            .await;
        assert_eq!(output.success, Some(false));
        assert!(output.content.contains("unsupported call"));
    }

    #[test]
    fn disabled_tools_are_not_registered() {
        let config = ToolsConfig {
            shell: false,
            ..Default::default()
        };
        let reg = ToolRegistry::new(&config, Arc::new(ExecSessionManager::new()));
        assert!(reg.handler("shell").is_none());
        assert!(reg.handler("read_file").is_some());
    }
}
