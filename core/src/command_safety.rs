//! Heuristic classification of commands that are safe to run without
//! asking the user.
//!
//! Used as the fallback when no exec-policy rules are loaded: a command is
//! auto-approved only when every segment of it resolves to a known
//! read-only binary (or read-only subcommand).

use crate::shell;

/// Binaries that only ever read.
const SAFE_BINARIES: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "pwd", "echo", "printf", "true", "false", "which", "type",
    "file", "stat", "du", "df", "date", "whoami", "id", "uname", "env", "printenv", "basename",
    "dirname", "realpath", "readlink", "sort", "uniq", "cut", "tr", "nl", "grep", "rg", "fd",
    "find",
];

/// `git` subcommands that only ever read.
const SAFE_GIT_SUBCOMMANDS: &[&str] = &["status", "log", "diff", "show", "branch", "rev-parse"];

/// Arguments that turn an otherwise read-only binary into a mutating one.
const UNSAFE_FIND_ARGS: &[&str] = &["-delete", "-exec", "-execdir", "-ok", "-okdir", "-fprint"];

/// Whether a fully resolved command vector is known to be read-only.
///
/// `["bash", "-lc", "<script>"]` style wrappers are unwrapped and every
/// pipeline segment of the script must itself be safe.
pub fn is_known_safe_command(command: &[String]) -> bool {
    if command.is_empty() {
        return false;
    }

    if let Some(script) = shell_wrapped_script(command) {
        return script_is_safe(script);
    }

    words_are_safe(command)
}

/// Recognize `<shell> -lc <script>` / `<shell> -c <script>` wrappers.
fn shell_wrapped_script(command: &[String]) -> Option<&str> {
    if command.len() != 3 {
        return None;
    }
    if shell::detect_shell_kind(&command[0]).is_none() {
        return None;
    }
    if command[1] != "-lc" && command[1] != "-c" {
        return None;
    }
    Some(&command[2])
}

/// A shell script is safe when it splits cleanly and every segment between
/// `&&`, `||`, `;`, and `|` is a safe command.
fn script_is_safe(script: &str) -> bool {
    // Reject substitution and redirection outright; splitting cannot see
    // inside them.
    if script.contains('`') || script.contains("$(") || script.contains('>') || script.contains('<')
    {
        return false;
    }

    let words = match shlex::split(script) {
        Some(words) if !words.is_empty() => words,
        _ => return false,
    };

    let mut segment: Vec<String> = Vec::new();
    for word in words {
        if matches!(word.as_str(), "&&" | "||" | ";" | "|") {
            if segment.is_empty() || !words_are_safe(&segment) {
                return false;
            }
            segment.clear();
        } else {
            segment.push(word);
        }
    }
    !segment.is_empty() && words_are_safe(&segment)
}

fn words_are_safe(words: &[String]) -> bool {
    let Some(first) = words.first() else {
        return false;
    };
    let program = std::path::Path::new(first)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(first.as_str());

    if program == "git" {
        return words
            .get(1)
            .map(|sub| SAFE_GIT_SUBCOMMANDS.contains(&sub.as_str()))
            .unwrap_or(false);
    }

    if program == "find" {
        return words
            .iter()
            .skip(1)
            .all(|arg| !UNSAFE_FIND_ARGS.contains(&arg.as_str()));
    }

    SAFE_BINARIES.contains(&program)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plain_read_only_commands_are_safe() {
        assert!(is_known_safe_command(&cmd(&["ls", "-la"])));
        assert!(is_known_safe_command(&cmd(&["cat", "/etc/hostname"])));
        assert!(is_known_safe_command(&cmd(&["git", "status"])));
        assert!(is_known_safe_command(&cmd(&["rg", "TODO", "src"])));
    }

    #[test]
    fn mutating_commands_are_not_safe() {
        assert!(!is_known_safe_command(&cmd(&["rm", "-rf", "/"])));
        assert!(!is_known_safe_command(&cmd(&["git", "push"])));
        assert!(!is_known_safe_command(&cmd(&["touch", "file"])));
        assert!(!is_known_safe_command(&cmd(&["find", ".", "-delete"])));
        assert!(!is_known_safe_command(&[]));
    }

    #[test]
    fn shell_wrapped_scripts_are_unwrapped() {
        assert!(is_known_safe_command(&cmd(&["/bin/bash", "-lc", "ls"])));
        assert!(is_known_safe_command(&cmd(&[
            "/bin/bash",
            "-lc",
            "ls && git status"
        ])));
        assert!(!is_known_safe_command(&cmd(&[
            "/bin/bash",
            "-lc",
            "ls && rm -rf /"
        ])));
    }

    #[test]
    fn redirection_and_substitution_are_rejected() {
        assert!(!is_known_safe_command(&cmd(&[
            "/bin/sh",
            "-c",
            "cat foo > bar"
        ])));
        assert!(!is_known_safe_command(&cmd(&[
            "/bin/sh",
            "-c",
            "echo $(rm -rf /)"
        ])));
    }

    #[test]
    fn pipelines_require_every_segment_safe() {
        assert!(is_known_safe_command(&cmd(&[
            "/bin/bash",
            "-c",
            "cat foo | grep bar | wc -l"
        ])));
        assert!(!is_known_safe_command(&cmd(&[
            "/bin/bash",
            "-c",
            "cat foo | xargs rm"
        ])));
    }
}
