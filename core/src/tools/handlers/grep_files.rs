//! Content search: `rg --files-with-matches` when ripgrep is available,
//! with a plain substring scan as the fallback.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::Result;
use crate::error::TetherErr;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolOutput;
use crate::tools::handlers::resolve_path;
use crate::tools::registry::ToolHandler;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 2000;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
/// Fallback scan bails out of binary-looking or oversized files.
const FALLBACK_MAX_FILE_BYTES: u64 = 4 * 1024 * 1024;

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Deserialize)]
struct GrepFilesArgs {
    pattern: String,
    #[serde(default)]
    include: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

pub struct GrepFilesHandler;

#[async_trait]
impl ToolHandler for GrepFilesHandler {
    fn name(&self) -> &'static str {
        "grep_files"
    }

    fn is_mutating(&self, _inv: &ToolInvocation) -> bool {
        false
    }

    async fn handle(&self, inv: ToolInvocation) -> Result<ToolOutput> {
        let args: GrepFilesArgs = serde_json::from_value(inv.arguments.clone())
            .map_err(|err| TetherErr::Validation(format!("invalid grep_files arguments: {err}")))?;

        let pattern = args.pattern.trim();
        if pattern.is_empty() {
            return Err(TetherErr::Validation("pattern must not be empty".into()));
        }
        if args.limit == 0 {
            return Err(TetherErr::Validation("limit must be greater than zero".into()));
        }
        let limit = args.limit.min(MAX_LIMIT);

        let search_path = match args.path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => resolve_path(&inv.cwd, path),
            None => inv.cwd.clone(),
        };
        if tokio::fs::metadata(&search_path).await.is_err() {
            return Ok(ToolOutput::failed(format!(
                "unable to access `{}`",
                search_path.display()
            )));
        }

        let include = args
            .include
            .as_deref()
            .map(str::trim)
            .filter(|glob| !glob.is_empty());

        let results = match run_rg(pattern, include, &search_path, limit, &inv.cwd).await {
            Ok(results) => results,
            Err(err) => {
                debug!(error = %err, "rg unavailable; falling back to in-process scan");
                fallback_scan(pattern, include, &search_path, limit).await
            }
        };

        if results.is_empty() {
            Ok(ToolOutput::failed("No matches found."))
        } else {
            Ok(ToolOutput::ok(results.join("\n")))
        }
    }
}

async fn run_rg(
    pattern: &str,
    include: Option<&str>,
    search_path: &Path,
    limit: usize,
    cwd: &Path,
) -> std::result::Result<Vec<String>, String> {
    let mut command = Command::new("rg");
    command
        .current_dir(cwd)
        .arg("--files-with-matches")
        .arg("--sortr=modified")
        .arg("--regexp")
        .arg(pattern)
        .arg("--no-messages")
        .stdin(Stdio::null())
        .kill_on_drop(true);

    if let Some(glob) = include {
        command.arg("--glob").arg(glob);
    }
    command.arg("--").arg(search_path);

    let output = tokio::time::timeout(COMMAND_TIMEOUT, command.output())
        .await
        .map_err(|_| "rg timed out after 30 seconds".to_string())?
        .map_err(|err| format!("failed to launch rg: {err}"))?;

    match output.status.code() {
        Some(0) => Ok(parse_results(&output.stdout, limit)),
        Some(1) => Ok(Vec::new()),
        _ => Err(format!(
            "rg failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )),
    }
}

fn parse_results(stdout: &[u8], limit: usize) -> Vec<String> {
    let mut results = Vec::new();
    for line in stdout.split(|byte| *byte == b'\n') {
        if line.is_empty() {
            continue;
        }
        if let Ok(text) = std::str::from_utf8(line) {
            results.push(text.to_string());
            if results.len() == limit {
                break;
            }
        }
    }
    results
}

/// Substring scan over the tree, newest files first. Only used when rg is
/// missing; patterns are treated literally.
async fn fallback_scan(
    pattern: &str,
    include: Option<&str>,
    search_path: &Path,
    limit: usize,
) -> Vec<String> {
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    let mut queue = vec![search_path.to_path_buf()];

    while let Some(dir) = queue.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            // A direct file argument lands here on the first iteration.
            if dir.is_file() {
                files.push((dir, std::time::SystemTime::UNIX_EPOCH));
            }
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if path.is_dir() {
                queue.push(path);
            } else {
                let modified = entry
                    .metadata()
                    .await
                    .and_then(|meta| meta.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                files.push((path, modified));
            }
        }
    }

    files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut results = Vec::new();
    for (path, _) in files {
        if let Some(glob) = include {
            if !glob_matches(glob, &path) {
                continue;
            }
        }
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };
        if meta.len() > FALLBACK_MAX_FILE_BYTES {
            continue;
        }
        let Ok(contents) = tokio::fs::read_to_string(&path).await else {
            continue;
        };
        if contents.contains(pattern) {
            results.push(path.display().to_string());
            if results.len() == limit {
                break;
            }
        }
    }
    results
}

/// Just enough globbing for the common `*.ext` and `name.*` filters.
fn glob_matches(glob: &str, path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if let Some(suffix) = glob.strip_prefix('*') {
        return name.ends_with(suffix);
    }
    if let Some(prefix) = glob.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    name == glob
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::context::SandboxMode;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn inv(cwd: &std::path::Path, arguments: serde_json::Value) -> ToolInvocation {
        ToolInvocation {
            call_id: "c1".into(),
            tool_name: "grep_files".into(),
            arguments,
            cwd: cwd.to_path_buf(),
            sandbox: SandboxMode::None,
            heartbeat: None,
        }
    }

    #[test]
    fn parses_basic_results() {
        let stdout = b"/tmp/file_a.rs\n/tmp/file_b.rs\n";
        assert_eq!(
            parse_results(stdout, 10),
            vec!["/tmp/file_a.rs".to_string(), "/tmp/file_b.rs".to_string()]
        );
    }

    #[test]
    fn parse_truncates_after_limit() {
        let stdout = b"/tmp/a.rs\n/tmp/b.rs\n/tmp/c.rs\n";
        assert_eq!(parse_results(stdout, 2).len(), 2);
    }

    #[test]
    fn simple_globs_match_names() {
        assert!(glob_matches("*.rs", Path::new("/x/lib.rs")));
        assert!(!glob_matches("*.rs", Path::new("/x/lib.go")));
        assert!(glob_matches("Cargo*", Path::new("/x/Cargo.toml")));
        assert!(glob_matches("exact.txt", Path::new("/x/exact.txt")));
    }

    #[tokio::test]
    async fn fallback_scan_finds_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("hit.rs"), "needle in here")
            .await
            .expect("write");
        tokio::fs::write(dir.path().join("miss.rs"), "nothing")
            .await
            .expect("write");

        let results = fallback_scan("needle", Some("*.rs"), dir.path(), 10).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].contains("hit.rs"));
    }

    #[tokio::test]
    async fn empty_pattern_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = GrepFilesHandler
            .handle(inv(dir.path(), json!({"pattern": "  "})))
            .await
            .expect_err("reject");
        assert!(matches!(err, TetherErr::Validation(_)));
    }

    #[tokio::test]
    async fn searches_for_content_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("target.txt"), "unique_marker_string")
            .await
            .expect("write");

        let output = GrepFilesHandler
            .handle(inv(dir.path(), json!({"pattern": "unique_marker_string"})))
            .await
            .expect("search");
        assert!(output.success, "output: {}", output.content);
        assert!(output.content.contains("target.txt"));
    }
}
