//! Create or overwrite a file, making parent directories as needed.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::error::TetherErr;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolOutput;
use crate::tools::handlers::resolve_path;
use crate::tools::registry::ToolHandler;

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

pub struct WriteFileHandler;

#[async_trait]
impl ToolHandler for WriteFileHandler {
    fn name(&self) -> &'static str {
        "write_file"
    }

    async fn handle(&self, inv: ToolInvocation) -> Result<ToolOutput> {
        let args: WriteFileArgs = serde_json::from_value(inv.arguments.clone())
            .map_err(|err| TetherErr::Validation(format!("invalid write_file arguments: {err}")))?;
        if args.path.is_empty() {
            return Err(TetherErr::Validation("path cannot be empty".into()));
        }

        let path = resolve_path(&inv.cwd, &args.path);
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                return Ok(ToolOutput::failed(format!(
                    "Failed to create directory {}: {err}",
                    parent.display()
                )));
            }
        }

        match tokio::fs::write(&path, args.content.as_bytes()).await {
            Ok(()) => Ok(ToolOutput::ok(format!(
                "Successfully wrote {} bytes to {}",
                args.content.len(),
                path.display()
            ))),
            Err(err) => Ok(ToolOutput::failed(format!("Failed to write file: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::context::SandboxMode;
    use serde_json::json;

    fn inv(cwd: &std::path::Path, arguments: serde_json::Value) -> ToolInvocation {
        ToolInvocation {
            call_id: "c1".into(),
            tool_name: "write_file".into(),
            arguments,
            cwd: cwd.to_path_buf(),
            sandbox: SandboxMode::None,
            heartbeat: None,
        }
    }

    #[tokio::test]
    async fn writes_file_and_creates_parents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = WriteFileHandler
            .handle(inv(
                dir.path(),
                json!({"path": "nested/dir/out.txt", "content": "payload"}),
            ))
            .await
            .expect("write");
        assert!(output.success);

        let written = tokio::fs::read_to_string(dir.path().join("nested/dir/out.txt"))
            .await
            .expect("read back");
        assert_eq!(written, "payload");
    }

    #[tokio::test]
    async fn overwrites_existing_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("f.txt"), "old")
            .await
            .expect("seed");

        let output = WriteFileHandler
            .handle(inv(dir.path(), json!({"path": "f.txt", "content": "new"})))
            .await
            .expect("write");
        assert!(output.success);

        let written = tokio::fs::read_to_string(dir.path().join("f.txt"))
            .await
            .expect("read back");
        assert_eq!(written, "new");
    }

    #[tokio::test]
    async fn missing_content_is_a_validation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = WriteFileHandler
            .handle(inv(dir.path(), json!({"path": "f.txt"})))
            .await
            .expect_err("reject");
        assert!(matches!(err, TetherErr::Validation(_)));
    }
}
