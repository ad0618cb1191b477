//! Instruction stack assembly: base prompt, developer prompt derived from
//! the session's approval mode and working directory, and project docs
//! discovered on disk.
//!
//! Resolution happens once at session startup; the merged result is frozen
//! into the configuration so a resumed session replays identically.

use std::path::Path;
use std::path::PathBuf;

use tracing::warn;

use tether_protocol::ApprovalMode;
use tether_protocol::SessionConfiguration;

/// Cap per project-doc file so a pathological AGENTS.md cannot swamp the
/// prompt.
const PROJECT_DOC_MAX_BYTES: usize = 32 * 1024;
const PROJECT_DOC_FILE_NAME: &str = "AGENTS.md";

const DEFAULT_BASE_INSTRUCTIONS: &str = "\
You are a software engineering assistant that helps users build, debug, and understand code.

Capabilities:
- Execute shell commands to explore the project, run tests, and perform operations.
- Read, write, and patch files using built-in tools.
- Search files by content or pattern.
- Run long-lived interactive commands in persistent exec sessions.

Guidelines:
- Read files before modifying them. Understand existing code first.
- Make minimal, focused changes. Do not refactor unrelated code.
- Prefer editing existing files over creating new ones.
- Write safe, secure code. Avoid introducing vulnerabilities (command injection, XSS, SQL injection).
- When a task is ambiguous, ask clarifying questions rather than guessing.
- Do not make destructive changes (deleting files, force-pushing, dropping tables) without confirmation.
- Explain your reasoning when performing multi-step operations.

Tool usage:
- Use shell for running commands, builds, tests, and git operations.
- Use read_file to inspect code before changes.
- Use apply_patch or write_file to modify code.
- Use grep_files and list_dir for codebase navigation.
- Use exec_command with a yield time for long-running commands, and write_stdin to interact with them.";

/// The base system prompt; a non-empty override replaces it entirely.
pub fn base_instructions(override_text: Option<&str>) -> String {
    match override_text {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => DEFAULT_BASE_INSTRUCTIONS.to_string(),
    }
}

/// Developer-role instructions derived from the approval mode and cwd.
pub fn compose_developer_instructions(mode: ApprovalMode, cwd: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();

    let cwd_display = cwd.display().to_string();
    if !cwd_display.is_empty() {
        parts.push(format!("Working directory: {cwd_display}"));
        parts.push(
            "All file paths in tool calls are relative to this directory unless absolute."
                .to_string(),
        );
    }

    match mode {
        ApprovalMode::Never => {
            parts.push(
                "Approval mode: full-auto. All tool calls execute without user confirmation."
                    .to_string(),
            );
        }
        ApprovalMode::OnFailure => {
            parts.push(
                "Approval mode: on-failure. Commands run inside a sandbox; if one fails due to \
                 sandbox restrictions the user may approve an unsandboxed retry."
                    .to_string(),
            );
        }
        ApprovalMode::UnlessTrusted => {
            parts.push(
                "Approval mode: unless-trusted. Read-only tools (read_file, list_dir, grep_files) \
                 and safe shell commands execute automatically. Mutating operations require user \
                 approval."
                    .to_string(),
            );
        }
    }

    parts.join("\n")
}

/// Walk from `cwd` up to the git root (or filesystem root), collecting
/// AGENTS.md files outermost-first.
pub async fn load_project_docs(cwd: &Path) -> Option<String> {
    let mut chain: Vec<PathBuf> = Vec::new();
    let mut dir = Some(cwd.to_path_buf());
    while let Some(current) = dir {
        chain.push(current.clone());
        if current.join(".git").exists() {
            break;
        }
        dir = current.parent().map(Path::to_path_buf);
    }

    let mut docs: Vec<String> = Vec::new();
    for dir in chain.iter().rev() {
        let candidate = dir.join(PROJECT_DOC_FILE_NAME);
        match tokio::fs::read_to_string(&candidate).await {
            Ok(mut text) => {
                if text.len() > PROJECT_DOC_MAX_BYTES {
                    text.truncate(PROJECT_DOC_MAX_BYTES);
                }
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    docs.push(trimmed.to_string());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %candidate.display(), error = %err, "failed to read project doc");
            }
        }
    }

    if docs.is_empty() {
        None
    } else {
        Some(docs.join("\n\n"))
    }
}

/// Resolve the full instruction stack into the configuration. Called once
/// before the first turn.
pub async fn resolve(config: &mut SessionConfiguration) {
    config.base_instructions = Some(base_instructions(config.base_instructions.as_deref()));

    if config.developer_instructions.is_none() {
        config.developer_instructions = Some(compose_developer_instructions(
            config.approval_mode,
            &config.cwd,
        ));
    }

    let disk_docs = load_project_docs(&config.cwd).await;
    config.project_docs = match (config.project_docs.take(), disk_docs) {
        (Some(cli), Some(disk)) => Some(format!("{disk}\n\n{cli}")),
        (Some(cli), None) => Some(cli),
        (None, Some(disk)) => Some(disk),
        (None, None) => None,
    };
}

/// User-facing instruction block: project docs followed by personal
/// instructions.
pub fn user_instruction_block(config: &SessionConfiguration) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(docs) = config.project_docs.as_deref() {
        if !docs.is_empty() {
            parts.push(docs);
        }
    }
    if let Some(user) = config.user_instructions.as_deref() {
        if !user.is_empty() {
            parts.push(user);
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn override_replaces_base_prompt_entirely() {
        assert_eq!(base_instructions(Some("custom")), "custom");
        assert!(base_instructions(None).contains("software engineering assistant"));
        assert!(base_instructions(Some("")).contains("software engineering assistant"));
    }

    #[test]
    fn developer_prompt_reflects_mode_and_cwd() {
        let text = compose_developer_instructions(
            ApprovalMode::UnlessTrusted,
            Path::new("/work/project"),
        );
        assert!(text.contains("Working directory: /work/project"));
        assert!(text.contains("unless-trusted"));

        let auto = compose_developer_instructions(ApprovalMode::Never, Path::new("/w"));
        assert!(auto.contains("full-auto"));
    }

    #[tokio::test]
    async fn project_docs_walk_stops_at_git_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        tokio::fs::create_dir_all(root.join(".git")).await.expect("git dir");
        tokio::fs::write(root.join("AGENTS.md"), "root doc").await.expect("write");

        let nested = root.join("a/b");
        tokio::fs::create_dir_all(&nested).await.expect("mkdir");
        tokio::fs::write(nested.join("AGENTS.md"), "leaf doc").await.expect("write");

        let docs = load_project_docs(&nested).await.expect("docs");
        let root_pos = docs.find("root doc").expect("root doc present");
        let leaf_pos = docs.find("leaf doc").expect("leaf doc present");
        assert!(root_pos < leaf_pos, "outermost docs come first");
    }

    #[tokio::test]
    async fn resolve_freezes_the_stack() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = SessionConfiguration {
            cwd: dir.path().to_path_buf(),
            user_instructions: Some("be terse".into()),
            ..Default::default()
        };
        resolve(&mut config).await;

        assert!(config.base_instructions.is_some());
        assert!(config.developer_instructions.is_some());
        assert_eq!(
            user_instruction_block(&config).as_deref(),
            Some("be terse")
        );
    }
}
