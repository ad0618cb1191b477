//! Line-windowed file reads.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::error::TetherErr;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolOutput;
use crate::tools::handlers::resolve_path;
use crate::tools::registry::ToolHandler;

const DEFAULT_LIMIT: usize = 2000;
const MAX_LINE_LEN: usize = 2000;

fn default_offset() -> usize {
    1
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
    /// 1-based first line.
    #[serde(default = "default_offset")]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

pub struct ReadFileHandler;

#[async_trait]
impl ToolHandler for ReadFileHandler {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn is_mutating(&self, _inv: &ToolInvocation) -> bool {
        false
    }

    async fn handle(&self, inv: ToolInvocation) -> Result<ToolOutput> {
        let args: ReadFileArgs = serde_json::from_value(inv.arguments.clone())
            .map_err(|err| TetherErr::Validation(format!("invalid read_file arguments: {err}")))?;
        if args.path.is_empty() {
            return Err(TetherErr::Validation("path cannot be empty".into()));
        }
        if args.limit == 0 {
            return Err(TetherErr::Validation("limit must be greater than zero".into()));
        }
        let offset = args.offset.max(1);

        let path = resolve_path(&inv.cwd, &args.path);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) => {
                return Ok(ToolOutput::failed(format!(
                    "unable to read `{}`: {err}",
                    path.display()
                )));
            }
        };

        let mut out = String::new();
        let mut shown = 0usize;
        let mut total = 0usize;
        for (index, line) in raw.lines().enumerate() {
            total += 1;
            let lineno = index + 1;
            if lineno < offset || shown >= args.limit {
                continue;
            }
            let mut line = line.to_string();
            if line.len() > MAX_LINE_LEN {
                let mut cut = MAX_LINE_LEN;
                while !line.is_char_boundary(cut) {
                    cut -= 1;
                }
                line.truncate(cut);
                line.push('…');
            }
            out.push_str(&format!("{lineno}: {line}\n"));
            shown += 1;
        }

        if total == 0 {
            return Ok(ToolOutput::ok("(empty file)"));
        }
        if shown == 0 {
            return Ok(ToolOutput::failed(format!(
                "offset {offset} is past the end of the file ({total} lines)"
            )));
        }
        Ok(ToolOutput::ok(out))
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
            tool_name: "read_file".into(),
            arguments,
            cwd: cwd.to_path_buf(),
            sandbox: SandboxMode::None,
            heartbeat: None,
        }
    }

    #[tokio::test]
    async fn reads_whole_file_with_line_numbers() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("f.txt"), "alpha\nbeta\ngamma\n")
            .await
            .expect("write");

        let output = ReadFileHandler
            .handle(inv(dir.path(), json!({"path": "f.txt"})))
            .await
            .expect("read");
        assert!(output.success);
        assert!(output.content.contains("1: alpha"));
        assert!(output.content.contains("3: gamma"));
    }

    #[tokio::test]
    async fn window_respects_offset_and_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body: String = (1..=10).map(|i| format!("line{i}\n")).collect();
        tokio::fs::write(dir.path().join("f.txt"), body)
            .await
            .expect("write");

        let output = ReadFileHandler
            .handle(inv(dir.path(), json!({"path": "f.txt", "offset": 4, "limit": 2})))
            .await
            .expect("read");
        assert!(output.success);
        assert!(output.content.contains("4: line4"));
        assert!(output.content.contains("5: line5"));
        assert!(!output.content.contains("line6"));
        assert!(!output.content.contains("line3"));
    }

    #[tokio::test]
    async fn missing_file_is_a_failed_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = ReadFileHandler
            .handle(inv(dir.path(), json!({"path": "nope.txt"})))
            .await
            .expect("handled");
        assert!(!output.success);
        assert!(output.content.contains("unable to read"));
    }

    #[tokio::test]
    async fn offset_past_end_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("f.txt"), "only\n")
            .await
            .expect("write");
        let output = ReadFileHandler
            .handle(inv(dir.path(), json!({"path": "f.txt", "offset": 10})))
            .await
            .expect("handled");
        assert!(!output.success);
    }
}
