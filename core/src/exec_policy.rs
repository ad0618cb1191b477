//! Rule-based command gating loaded from the agent home directory.
//!
//! The rules file is line-oriented: `allow|prompt|forbid <tokens…>`, one
//! rule per line, `#` comments. A rule matches when its tokens are a
//! prefix of the resolved command vector; the longest matching rule wins.
//! Shell wrappers (`bash -lc "<script>"`) are unwrapped before matching.

use std::path::Path;

use tracing::warn;

use crate::command_safety;
use crate::shell;
use tether_protocol::ApprovalMode;

pub const POLICY_FILE_NAME: &str = "execpolicy.rules";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Prompt,
    Forbid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PolicyRule {
    decision: PolicyDecision,
    prefix: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecPolicy {
    rules: Vec<PolicyRule>,
}

/// Outcome of evaluating a command against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEvaluation {
    pub decision: PolicyDecision,
    pub justification: String,
}

impl ExecPolicy {
    /// Parse a rules source. Unparseable lines are skipped with a warning
    /// rather than failing the whole policy.
    pub fn parse(source: &str) -> Self {
        let mut rules = Vec::new();
        for (lineno, line) in source.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(words) = shlex::split(line) else {
                warn!(line = lineno + 1, "skipping unparseable exec policy rule");
                continue;
            };
            let Some((verb, prefix)) = words.split_first() else {
                continue;
            };
            let decision = match verb.as_str() {
                "allow" => PolicyDecision::Allow,
                "prompt" => PolicyDecision::Prompt,
                "forbid" => PolicyDecision::Forbid,
                other => {
                    warn!(
                        line = lineno + 1,
                        verb = other,
                        "skipping exec policy rule with unknown verb"
                    );
                    continue;
                }
            };
            if prefix.is_empty() {
                warn!(line = lineno + 1, "skipping exec policy rule with no command");
                continue;
            }
            rules.push(PolicyRule {
                decision,
                prefix: prefix.to_vec(),
            });
        }
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate a resolved command vector. Returns `None` when no rule
    /// matches, in which case the caller falls back to the heuristic.
    pub fn evaluate(&self, command: &[String]) -> Option<PolicyEvaluation> {
        let resolved = unwrap_shell_command(command);

        let mut best: Option<&PolicyRule> = None;
        for rule in &self.rules {
            if rule.prefix.len() <= resolved.len()
                && rule.prefix.iter().zip(resolved.iter()).all(|(a, b)| a == b)
            {
                let better = best
                    .map(|current| rule.prefix.len() > current.prefix.len())
                    .unwrap_or(true);
                if better {
                    best = Some(rule);
                }
            }
        }

        best.map(|rule| PolicyEvaluation {
            decision: rule.decision,
            justification: format!("matched rule `{}`", rule.prefix.join(" ")),
        })
    }

    /// Full gate decision for a command under the given approval mode,
    /// combining rules with the safe-command fallback.
    pub fn evaluate_with_mode(&self, command: &[String], mode: ApprovalMode) -> PolicyEvaluation {
        if let Some(eval) = self.evaluate(command) {
            return eval;
        }

        match mode {
            ApprovalMode::Never | ApprovalMode::OnFailure => PolicyEvaluation {
                decision: PolicyDecision::Allow,
                justification: String::new(),
            },
            ApprovalMode::UnlessTrusted => {
                if command_safety::is_known_safe_command(command) {
                    PolicyEvaluation {
                        decision: PolicyDecision::Allow,
                        justification: "known read-only command".into(),
                    }
                } else {
                    PolicyEvaluation {
                        decision: PolicyDecision::Prompt,
                        justification: "command is not known to be read-only".into(),
                    }
                }
            }
        }
    }
}

/// Unwrap `<shell> -lc <script>` into the script's own words so rules
/// match the command the user actually cares about.
fn unwrap_shell_command(command: &[String]) -> Vec<String> {
    if command.len() == 3
        && shell::detect_shell_kind(&command[0]).is_some()
        && (command[1] == "-lc" || command[1] == "-c")
    {
        if let Some(words) = shlex::split(&command[2]) {
            if !words.is_empty() {
                return words;
            }
        }
    }
    command.to_vec()
}

/// Load the policy from `<agent_home>/execpolicy.rules`. Missing files
/// yield an empty policy; read errors are non-fatal.
pub async fn load_policy(agent_home: &Path) -> ExecPolicy {
    let path = agent_home.join(POLICY_FILE_NAME);
    match tokio::fs::read_to_string(&path).await {
        Ok(source) => ExecPolicy::parse(&source),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => ExecPolicy::default(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read exec policy rules");
            ExecPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_rules_and_skips_junk() {
        let policy = ExecPolicy::parse(
            "# comment\n\
             allow git status\n\
             forbid rm -rf /\n\
             bogus verb here\n\
             prompt cargo\n",
        );
        assert_eq!(policy.rules.len(), 3);
    }

    #[test]
    fn longest_prefix_wins() {
        let policy = ExecPolicy::parse("prompt git\nallow git status\n");
        let eval = policy.evaluate(&cmd(&["git", "status"])).expect("match");
        assert_eq!(eval.decision, PolicyDecision::Allow);

        let eval = policy.evaluate(&cmd(&["git", "push"])).expect("match");
        assert_eq!(eval.decision, PolicyDecision::Prompt);
    }

    #[test]
    fn forbid_matches_through_shell_wrapper() {
        let policy = ExecPolicy::parse("forbid rm -rf /\n");
        let eval = policy
            .evaluate(&cmd(&["/bin/bash", "-lc", "rm -rf /"]))
            .expect("match");
        assert_eq!(eval.decision, PolicyDecision::Forbid);
    }

    #[test]
    fn unmatched_commands_fall_back_by_mode() {
        let policy = ExecPolicy::default();
        assert_eq!(
            policy
                .evaluate_with_mode(&cmd(&["rm", "-rf", "/tmp/x"]), ApprovalMode::Never)
                .decision,
            PolicyDecision::Allow
        );
        assert_eq!(
            policy
                .evaluate_with_mode(&cmd(&["rm", "-rf", "/tmp/x"]), ApprovalMode::OnFailure)
                .decision,
            PolicyDecision::Allow
        );
        assert_eq!(
            policy
                .evaluate_with_mode(&cmd(&["rm", "-rf", "/tmp/x"]), ApprovalMode::UnlessTrusted)
                .decision,
            PolicyDecision::Prompt
        );
        assert_eq!(
            policy
                .evaluate_with_mode(&cmd(&["ls"]), ApprovalMode::UnlessTrusted)
                .decision,
            PolicyDecision::Allow
        );
    }

    #[tokio::test]
    async fn loads_rules_from_agent_home() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join(POLICY_FILE_NAME), "forbid shutdown\n")
            .await
            .expect("write rules");

        let policy = load_policy(dir.path()).await;
        assert!(!policy.is_empty());

        let missing = load_policy(&dir.path().join("nope")).await;
        assert!(missing.is_empty());
    }
}
