//! User-shell detection and command argument derivation.

use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Zsh,
    Sh,
}

/// A detected shell with its binary path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserShell {
    pub kind: ShellKind,
    pub path: String,
}

impl UserShell {
    pub fn name(&self) -> &'static str {
        match self.kind {
            ShellKind::Bash => "bash",
            ShellKind::Zsh => "zsh",
            ShellKind::Sh => "sh",
        }
    }

    /// Argument vector to run `command` through this shell: `-lc` for a
    /// login shell, `-c` otherwise.
    pub fn derive_exec_args(&self, command: &str, login: bool) -> Vec<String> {
        let flag = if login { "-lc" } else { "-c" };
        vec![self.path.clone(), flag.to_string(), command.to_string()]
    }
}

/// Map a shell binary path (or bare name) to a kind.
pub fn detect_shell_kind(shell_path: &str) -> Option<ShellKind> {
    let base = Path::new(shell_path)
        .file_name()
        .and_then(|name| name.to_str())?;
    match base {
        "bash" => Some(ShellKind::Bash),
        "zsh" => Some(ShellKind::Zsh),
        "sh" => Some(ShellKind::Sh),
        _ => None,
    }
}

/// The user's default shell from `$SHELL`, falling back to bash and then
/// `/bin/sh`.
pub fn detect_user_shell() -> UserShell {
    if let Ok(shell_env) = std::env::var("SHELL") {
        if !shell_env.is_empty() {
            if let Some(kind) = detect_shell_kind(&shell_env) {
                return UserShell {
                    kind,
                    path: shell_env,
                };
            }
        }
    }

    for (name, kind) in [("bash", ShellKind::Bash), ("sh", ShellKind::Sh)] {
        if let Some(path) = look_path(name) {
            return UserShell {
                kind,
                path: path.to_string_lossy().to_string(),
            };
        }
    }

    UserShell {
        kind: ShellKind::Sh,
        path: "/bin/sh".to_string(),
    }
}

fn look_path(name: &str) -> Option<PathBuf> {
    let path_env = std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".into());
    for dir in std::env::split_paths(&path_env) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn detects_known_shells_by_path() {
        assert_eq!(detect_shell_kind("/bin/bash"), Some(ShellKind::Bash));
        assert_eq!(detect_shell_kind("/usr/bin/zsh"), Some(ShellKind::Zsh));
        assert_eq!(detect_shell_kind("sh"), Some(ShellKind::Sh));
        assert_eq!(detect_shell_kind("/usr/bin/fish"), None);
    }

    #[test]
    fn derives_login_and_plain_args() {
        let shell = UserShell {
            kind: ShellKind::Bash,
            path: "/bin/bash".into(),
        };
        assert_eq!(
            shell.derive_exec_args("echo hi", true),
            vec!["/bin/bash", "-lc", "echo hi"]
        );
        assert_eq!(
            shell.derive_exec_args("echo hi", false),
            vec!["/bin/bash", "-c", "echo hi"]
        );
    }

    #[test]
    fn detection_always_returns_something() {
        let shell = detect_user_shell();
        assert!(!shell.path.is_empty());
    }
}
