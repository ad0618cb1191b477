//! Depth-bounded directory listing, directories first.

use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::error::TetherErr;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolOutput;
use crate::tools::handlers::resolve_path;
use crate::tools::registry::ToolHandler;

const MAX_ENTRIES: usize = 1000;

fn default_depth() -> usize {
    1
}

#[derive(Deserialize)]
struct ListDirArgs {
    path: String,
    #[serde(default = "default_depth")]
    depth: usize,
}

pub struct ListDirHandler;

#[async_trait]
impl ToolHandler for ListDirHandler {
    fn name(&self) -> &'static str {
        "list_dir"
    }

    fn is_mutating(&self, _inv: &ToolInvocation) -> bool {
        false
    }

    async fn handle(&self, inv: ToolInvocation) -> Result<ToolOutput> {
        let args: ListDirArgs = serde_json::from_value(inv.arguments.clone())
            .map_err(|err| TetherErr::Validation(format!("invalid list_dir arguments: {err}")))?;
        if args.path.is_empty() {
            return Err(TetherErr::Validation("path cannot be empty".into()));
        }
        let depth = args.depth.clamp(1, 8);

        let root = resolve_path(&inv.cwd, &args.path);
        if !root.is_dir() {
            return Ok(ToolOutput::failed(format!(
                "`{}` is not a directory",
                root.display()
            )));
        }

        let mut lines = Vec::new();
        let mut truncated = false;
        list_level(&root, &root, depth, &mut lines, &mut truncated).await;
        if truncated {
            lines.push(format!("… truncated at {MAX_ENTRIES} entries"));
        }
        if lines.is_empty() {
            return Ok(ToolOutput::ok("(empty directory)"));
        }
        Ok(ToolOutput::ok(lines.join("\n")))
    }
}

/// Iterative BFS so the future stays `Send` without boxed recursion.
async fn list_level(
    root: &Path,
    start: &Path,
    max_depth: usize,
    lines: &mut Vec<String>,
    truncated: &mut bool,
) {
    let mut queue: Vec<(PathBuf, usize)> = vec![(start.to_path_buf(), 0)];

    while let Some((dir, level)) = queue.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                files.push(path);
            }
        }
        dirs.sort();
        files.sort();

        for path in dirs {
            if lines.len() >= MAX_ENTRIES {
                *truncated = true;
                return;
            }
            lines.push(format!("{}/", relative_display(root, &path)));
            if level + 1 < max_depth {
                queue.push((path, level + 1));
            }
        }
        for path in files {
            if lines.len() >= MAX_ENTRIES {
                *truncated = true;
                return;
            }
            lines.push(relative_display(root, &path));
        }
    }
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::context::SandboxMode;
    use serde_json::json;

    fn inv(cwd: &std::path::Path, arguments: serde_json::Value) -> ToolInvocation {
        ToolInvocation {
            call_id: "c1".into(),
            tool_name: "list_dir".into(),
            arguments,
            cwd: cwd.to_path_buf(),
            sandbox: SandboxMode::None,
            heartbeat: None,
        }
    }

    #[tokio::test]
    async fn lists_directories_before_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::create_dir(dir.path().join("sub")).await.expect("mkdir");
        tokio::fs::write(dir.path().join("a.txt"), "x").await.expect("write");

        let output = ListDirHandler
            .handle(inv(dir.path(), json!({"path": "."})))
            .await
            .expect("list");
        assert!(output.success);
        let sub_pos = output.content.find("sub/").expect("sub listed");
        let file_pos = output.content.find("a.txt").expect("file listed");
        assert!(sub_pos < file_pos);
    }

    #[tokio::test]
    async fn depth_two_descends_one_level() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::create_dir_all(dir.path().join("a/b")).await.expect("mkdir");
        tokio::fs::write(dir.path().join("a/inner.txt"), "x")
            .await
            .expect("write");

        let shallow = ListDirHandler
            .handle(inv(dir.path(), json!({"path": ".", "depth": 1})))
            .await
            .expect("list");
        assert!(!shallow.content.contains("inner.txt"));

        let deep = ListDirHandler
            .handle(inv(dir.path(), json!({"path": ".", "depth": 2})))
            .await
            .expect("list");
        assert!(deep.content.contains("a/inner.txt"));
        assert!(deep.content.contains("a/b/"));
    }

    #[tokio::test]
    async fn non_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("f.txt"), "x").await.expect("write");
        let output = ListDirHandler
            .handle(inv(dir.path(), json!({"path": "f.txt"})))
            .await
            .expect("handled");
        assert!(!output.success);
    }
}
