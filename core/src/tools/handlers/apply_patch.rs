//! The patch envelope tool: a single `*** Begin Patch` … `*** End Patch`
//! document adding, updating, and deleting files, with context-hunk
//! updates.

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

const BEGIN_MARKER: &str = "*** Begin Patch";
const END_MARKER: &str = "*** End Patch";
const EOF_MARKER: &str = "*** End of File";

#[derive(Deserialize)]
struct ApplyPatchArgs {
    input: String,
}

#[derive(Debug, PartialEq, Eq)]
enum FileOp {
    Add {
        path: String,
        contents: String,
    },
    Delete {
        path: String,
    },
    Update {
        path: String,
        move_to: Option<String>,
        hunks: Vec<Hunk>,
    },
}

/// One `@@` section: the old lines to find (context + removals) and the
/// new lines to put in their place (context + additions).
#[derive(Debug, Default, PartialEq, Eq)]
struct Hunk {
    old_lines: Vec<String>,
    new_lines: Vec<String>,
}

pub struct ApplyPatchHandler;

#[async_trait]
impl ToolHandler for ApplyPatchHandler {
    fn name(&self) -> &'static str {
        "apply_patch"
    }

    async fn handle(&self, inv: ToolInvocation) -> Result<ToolOutput> {
        let args: ApplyPatchArgs = serde_json::from_value(inv.arguments.clone())
            .map_err(|err| TetherErr::Validation(format!("invalid apply_patch arguments: {err}")))?;

        let ops = parse_patch(&args.input)?;
        if ops.is_empty() {
            return Err(TetherErr::Validation("patch contains no file operations".into()));
        }

        let mut applied = Vec::new();
        for op in ops {
            match apply_op(&inv.cwd, &op).await {
                Ok(summary) => applied.push(summary),
                Err(err) => {
                    // Earlier operations stay applied; report where it stopped.
                    let mut message = format!("{err}");
                    if !applied.is_empty() {
                        message.push_str(&format!(
                            "\nApplied before the failure:\n{}",
                            applied.join("\n")
                        ));
                    }
                    return Ok(ToolOutput::failed(message));
                }
            }
        }

        Ok(ToolOutput::ok(format!("Done!\n{}", applied.join("\n"))))
    }
}

fn parse_patch(input: &str) -> Result<Vec<FileOp>> {
    let mut lines = input.lines().peekable();

    match lines.next().map(str::trim_end) {
        Some(BEGIN_MARKER) => {}
        _ => {
            return Err(TetherErr::Validation(format!(
                "patch must start with `{BEGIN_MARKER}`"
            )));
        }
    }

    let mut ops = Vec::new();
    while let Some(line) = lines.next() {
        let line = line.trim_end();
        if line == END_MARKER {
            return Ok(ops);
        }

        if let Some(path) = line.strip_prefix("*** Add File: ") {
            let mut contents = String::new();
            while let Some(next) = lines.peek() {
                if next.starts_with("***") {
                    break;
                }
                let body = lines.next().unwrap_or_default();
                let Some(added) = body.strip_prefix('+') else {
                    return Err(TetherErr::Validation(format!(
                        "added file `{path}` has a line without a `+` prefix"
                    )));
                };
                contents.push_str(added);
                contents.push('\n');
            }
            ops.push(FileOp::Add {
                path: path.trim().to_string(),
                contents,
            });
        } else if let Some(path) = line.strip_prefix("*** Delete File: ") {
            ops.push(FileOp::Delete {
                path: path.trim().to_string(),
            });
        } else if let Some(path) = line.strip_prefix("*** Update File: ") {
            let mut move_to = None;
            if let Some(next) = lines.peek() {
                if let Some(target) = next.strip_prefix("*** Move to: ") {
                    move_to = Some(target.trim().to_string());
                    lines.next();
                }
            }

            let mut hunks = Vec::new();
            let mut current = Hunk::default();
            let mut saw_body = false;
            while let Some(next) = lines.peek() {
                let next = next.trim_end();
                if next == EOF_MARKER {
                    lines.next();
                    continue;
                }
                if next.starts_with("*** ") || next == END_MARKER {
                    break;
                }
                let body = lines.next().unwrap_or_default();
                let body = body.strip_suffix('\n').unwrap_or(body);
                if body.starts_with("@@") {
                    if saw_body {
                        hunks.push(std::mem::take(&mut current));
                        saw_body = false;
                    }
                    continue;
                }
                saw_body = true;
                if let Some(added) = body.strip_prefix('+') {
                    current.new_lines.push(added.to_string());
                } else if let Some(removed) = body.strip_prefix('-') {
                    current.old_lines.push(removed.to_string());
                } else {
                    let context = body.strip_prefix(' ').unwrap_or(body);
                    current.old_lines.push(context.to_string());
                    current.new_lines.push(context.to_string());
                }
            }
            if saw_body {
                hunks.push(current);
            }
            if hunks.is_empty() {
                return Err(TetherErr::Validation(format!(
                    "update for `{path}` contains no hunks"
                )));
            }
            ops.push(FileOp::Update {
                path: path.trim().to_string(),
                move_to,
                hunks,
            });
        } else if !line.is_empty() {
            return Err(TetherErr::Validation(format!(
                "unrecognized patch line: `{line}`"
            )));
        }
    }

    Err(TetherErr::Validation(format!(
        "patch is missing `{END_MARKER}`"
    )))
}

async fn apply_op(cwd: &Path, op: &FileOp) -> Result<String> {
    match op {
        FileOp::Add { path, contents } => {
            let full = resolve_path(cwd, path);
            if full.exists() {
                return Err(TetherErr::Validation(format!(
                    "cannot add `{path}`: file already exists"
                )));
            }
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full, contents).await?;
            Ok(format!("A {path}"))
        }
        FileOp::Delete { path } => {
            let full = resolve_path(cwd, path);
            tokio::fs::remove_file(&full)
                .await
                .map_err(|err| TetherErr::Validation(format!("cannot delete `{path}`: {err}")))?;
            Ok(format!("D {path}"))
        }
        FileOp::Update {
            path,
            move_to,
            hunks,
        } => {
            let full = resolve_path(cwd, path);
            let original = tokio::fs::read_to_string(&full)
                .await
                .map_err(|err| TetherErr::Validation(format!("cannot update `{path}`: {err}")))?;

            let updated = apply_hunks(&original, hunks).map_err(|err| {
                TetherErr::Validation(format!("cannot update `{path}`: {err}"))
            })?;

            let destination: PathBuf = match move_to {
                Some(target) => resolve_path(cwd, target),
                None => full.clone(),
            };
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&destination, updated).await?;
            if destination != full {
                tokio::fs::remove_file(&full).await?;
                return Ok(format!("M {path} -> {}", move_to.as_deref().unwrap_or("")));
            }
            Ok(format!("M {path}"))
        }
    }
}

fn apply_hunks(original: &str, hunks: &[Hunk]) -> std::result::Result<String, String> {
    let had_trailing_newline = original.ends_with('\n');
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();
    let mut search_from = 0usize;

    for (index, hunk) in hunks.iter().enumerate() {
        if hunk.old_lines.is_empty() {
            // Pure insertion with no context: append at the end.
            lines.extend(hunk.new_lines.iter().cloned());
            search_from = lines.len();
            continue;
        }

        let position = find_subsequence(&lines, &hunk.old_lines, search_from)
            .or_else(|| find_subsequence(&lines, &hunk.old_lines, 0))
            .ok_or_else(|| format!("hunk {} does not match the file contents", index + 1))?;

        lines.splice(
            position..position + hunk.old_lines.len(),
            hunk.new_lines.iter().cloned(),
        );
        search_from = position + hunk.new_lines.len();
    }

    let mut out = lines.join("\n");
    if had_trailing_newline || out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

fn find_subsequence(haystack: &[String], needle: &[String], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len())
        .find(|&start| haystack[start..start + needle.len()] == *needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::context::SandboxMode;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn inv(cwd: &std::path::Path, patch: &str) -> ToolInvocation {
        ToolInvocation {
            call_id: "c1".into(),
            tool_name: "apply_patch".into(),
            arguments: json!({"input": patch}),
            cwd: cwd.to_path_buf(),
            sandbox: SandboxMode::None,
            heartbeat: None,
        }
    }

    #[tokio::test]
    async fn adds_a_new_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let patch = "*** Begin Patch\n*** Add File: src/new.rs\n+fn main() {}\n*** End Patch";

        let output = ApplyPatchHandler
            .handle(inv(dir.path(), patch))
            .await
            .expect("apply");
        assert!(output.success, "{}", output.content);

        let written = tokio::fs::read_to_string(dir.path().join("src/new.rs"))
            .await
            .expect("read back");
        assert_eq!(written, "fn main() {}\n");
    }

    #[tokio::test]
    async fn updates_with_context_hunk() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("f.txt"), "one\ntwo\nthree\n")
            .await
            .expect("seed");

        let patch = "*** Begin Patch\n\
                     *** Update File: f.txt\n\
                     @@\n \
                     one\n\
                     -two\n\
                     +TWO\n \
                     three\n\
                     *** End Patch";

        let output = ApplyPatchHandler
            .handle(inv(dir.path(), patch))
            .await
            .expect("apply");
        assert!(output.success, "{}", output.content);

        let updated = tokio::fs::read_to_string(dir.path().join("f.txt"))
            .await
            .expect("read back");
        assert_eq!(updated, "one\nTWO\nthree\n");
    }

    #[tokio::test]
    async fn deletes_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("gone.txt"), "x")
            .await
            .expect("seed");

        let patch = "*** Begin Patch\n*** Delete File: gone.txt\n*** End Patch";
        let output = ApplyPatchHandler
            .handle(inv(dir.path(), patch))
            .await
            .expect("apply");
        assert!(output.success);
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[tokio::test]
    async fn mismatched_hunk_reports_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("f.txt"), "alpha\n")
            .await
            .expect("seed");

        let patch = "*** Begin Patch\n\
                     *** Update File: f.txt\n\
                     @@\n\
                     -does not exist\n\
                     +replacement\n\
                     *** End Patch";

        let output = ApplyPatchHandler
            .handle(inv(dir.path(), patch))
            .await
            .expect("handled");
        assert!(!output.success);
        assert!(output.content.contains("does not match"));
    }

    #[tokio::test]
    async fn missing_envelope_is_a_validation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ApplyPatchHandler
            .handle(inv(dir.path(), "+not a patch"))
            .await
            .expect_err("reject");
        assert!(matches!(err, TetherErr::Validation(_)));
    }

    #[test]
    fn parses_multiple_operations() {
        let patch = "*** Begin Patch\n\
                     *** Add File: a.txt\n\
                     +hello\n\
                     *** Delete File: b.txt\n\
                     *** End Patch";
        let ops = parse_patch(patch).expect("parse");
        assert_eq!(ops.len(), 2);
        assert_eq!(
            ops[0],
            FileOp::Add {
                path: "a.txt".into(),
                contents: "hello\n".into()
            }
        );
        assert_eq!(
            ops[1],
            FileOp::Delete {
                path: "b.txt".into()
            }
        );
    }

    #[test]
    fn second_hunk_applies_after_the_first() {
        let original = "a\nb\nc\nd\ne\n";
        let hunks = vec![
            Hunk {
                old_lines: vec!["a".into(), "b".into()],
                new_lines: vec!["a".into(), "B".into()],
            },
            Hunk {
                old_lines: vec!["d".into()],
                new_lines: vec!["D".into(), "D2".into()],
            },
        ];
        let result = apply_hunks(original, &hunks).expect("apply");
        assert_eq!(result, "a\nB\nc\nD\nD2\ne\n");
    }
}
