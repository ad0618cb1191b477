//! Interactive command sessions (PTY or pipes) that persist across tool
//! invocations.
//!
//! `exec_command` starts a process and collects output until it exits or a
//! yield deadline passes; long-running processes are parked in the store
//! under a numeric session id and polled (or fed input) through
//! `write_stdin`.

pub mod buffer;
pub mod session;
pub mod store;

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::error::TetherErr;
use crate::exec_sessions::session::ExecSession;
use crate::exec_sessions::session::SessionOpts;
use crate::exec_sessions::store::SessionStore;
use crate::shell;

pub const MIN_YIELD_TIME_MS: u64 = 250;
pub const MAX_YIELD_TIME_MS: u64 = 30_000;
/// Empty `write_stdin` polls wait at least this long to discourage rapid
/// polling loops.
pub const MIN_EMPTY_YIELD_TIME_MS: u64 = 5_000;
pub const DEFAULT_EXEC_YIELD_MS: u64 = 10_000;
pub const DEFAULT_STDIN_YIELD_MS: u64 = 250;

/// Pause after a stdin write so the process has a chance to react before
/// output collection starts.
const POST_WRITE_PAUSE: Duration = Duration::from_millis(100);

/// Baseline overlay applied to every exec session so output stays plain
/// and unpaginated for model consumption.
pub const EXEC_SESSION_ENV: &[(&str, &str)] = &[
    ("NO_COLOR", "1"),
    ("TERM", "dumb"),
    ("LANG", "C.UTF-8"),
    ("LC_CTYPE", "C.UTF-8"),
    ("LC_ALL", "C.UTF-8"),
    ("COLORTERM", ""),
    ("PAGER", "cat"),
    ("GIT_PAGER", "cat"),
    ("GH_PAGER", "cat"),
];

fn default_login() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecCommandParams {
    pub cmd: String,
    #[serde(default)]
    pub workdir: Option<String>,
    /// Shell binary to wrap the command with; the detected user shell when
    /// absent.
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default = "default_login")]
    pub login: bool,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub yield_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteStdinParams {
    pub session_id: u64,
    #[serde(default)]
    pub chars: String,
    #[serde(default)]
    pub yield_time_ms: Option<u64>,
}

/// A finished (or parked) exec invocation, ready to be formatted into tool
/// output.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    pub output: Vec<u8>,
    pub wall_time: Duration,
    pub exit_code: Option<i32>,
    /// Present when the process is still running and was parked.
    pub session_id: Option<String>,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code.map(|code| code == 0).unwrap_or(true)
    }

    /// Render in the fixed tool-output layout.
    pub fn render(&self) -> String {
        let mut out = format!("--- Wall time: {:.3}s ---\n", self.wall_time.as_secs_f64());
        if let Some(code) = self.exit_code {
            out.push_str(&format!("--- Exit code: {code} ---\n"));
        }
        if let Some(id) = &self.session_id {
            out.push_str(&format!("--- Session ID: {id} ---\n"));
        }
        out.push_str("--- Output ---\n");
        out.push_str(&String::from_utf8_lossy(&self.output));
        out
    }
}

#[derive(Default)]
pub struct ExecSessionManager {
    store: SessionStore,
}

impl ExecSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Start a command, collect output until exit or the yield deadline,
    /// and park the session if the process is still running.
    pub async fn exec_command(
        &self,
        params: ExecCommandParams,
        default_cwd: &PathBuf,
        heartbeat: Option<&(dyn Fn() + Send + Sync)>,
    ) -> Result<ExecOutcome> {
        if params.cmd.is_empty() {
            return Err(TetherErr::Validation(
                "missing required argument: cmd".into(),
            ));
        }

        let yield_ms = clamp_yield_time(
            params.yield_time_ms.unwrap_or(DEFAULT_EXEC_YIELD_MS),
            MIN_YIELD_TIME_MS,
            MAX_YIELD_TIME_MS,
        );

        let command = match &params.shell {
            Some(bin) if !bin.is_empty() => {
                let flag = if params.login { "-lc" } else { "-c" };
                vec![bin.clone(), flag.to_string(), params.cmd.clone()]
            }
            _ => shell::detect_user_shell().derive_exec_args(&params.cmd, params.login),
        };

        let cwd = resolve_workdir(params.workdir.as_deref(), default_cwd);
        let session_id = self.store.allocate_id();

        let started = Instant::now();
        let session = match ExecSession::start(SessionOpts {
            id: session_id.clone(),
            command,
            cwd: Some(cwd),
            env: exec_session_env(),
            tty: params.tty,
        }) {
            Ok(session) => session,
            Err(err) => {
                self.store.release_id(&session_id);
                return Err(err);
            }
        };

        let deadline = started + Duration::from_millis(yield_ms);
        let output = session.collect_output(deadline, heartbeat).await;
        let wall_time = started.elapsed();

        if session.has_exited() {
            self.store.release_id(&session_id);
            return Ok(ExecOutcome {
                output,
                wall_time,
                exit_code: session.exit_code(),
                session_id: None,
            });
        }

        debug!(session_id = %session_id, "parking long-running exec session");
        self.store.store(session);
        Ok(ExecOutcome {
            output,
            wall_time,
            exit_code: None,
            session_id: Some(session_id),
        })
    }

    /// Feed input to a parked PTY session (or just poll it when `chars`
    /// is empty) and collect whatever output accumulated.
    pub async fn write_stdin(
        &self,
        params: WriteStdinParams,
        heartbeat: Option<&(dyn Fn() + Send + Sync)>,
    ) -> Result<ExecOutcome> {
        let requested = params.yield_time_ms.unwrap_or(DEFAULT_STDIN_YIELD_MS);
        let yield_ms = if params.chars.is_empty() {
            clamp_yield_time(requested, MIN_EMPTY_YIELD_TIME_MS, MAX_YIELD_TIME_MS)
        } else {
            clamp_yield_time(requested, MIN_YIELD_TIME_MS, MAX_YIELD_TIME_MS)
        };

        let session_id = params.session_id.to_string();
        let session = self.store.get(&session_id)?;

        let started = Instant::now();
        if !params.chars.is_empty() {
            session.write_stdin(params.chars.as_bytes())?;
            tokio::time::sleep(POST_WRITE_PAUSE).await;
        }

        let deadline = started + Duration::from_millis(yield_ms);
        let output = session.collect_output(deadline, heartbeat).await;
        let wall_time = started.elapsed();

        if session.has_exited() {
            self.store.remove(&session_id);
            return Ok(ExecOutcome {
                output,
                wall_time,
                exit_code: session.exit_code(),
                session_id: None,
            });
        }

        Ok(ExecOutcome {
            output,
            wall_time,
            exit_code: None,
            session_id: Some(session_id),
        })
    }
}

/// The inherited environment plus the plain-output overlay.
fn exec_session_env() -> Vec<(String, String)> {
    EXEC_SESSION_ENV
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn resolve_workdir(workdir: Option<&str>, default_cwd: &PathBuf) -> PathBuf {
    match workdir.map(str::trim).filter(|dir| !dir.is_empty()) {
        Some(dir) => {
            let path = PathBuf::from(dir);
            if path.is_absolute() {
                path
            } else {
                default_cwd.join(path)
            }
        }
        None => default_cwd.clone(),
    }
}

pub fn clamp_yield_time(ms: u64, min_ms: u64, max_ms: u64) -> u64 {
    ms.clamp(min_ms, max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn clamps_below_minimum() {
        assert_eq!(clamp_yield_time(0, MIN_YIELD_TIME_MS, MAX_YIELD_TIME_MS), 250);
        assert_eq!(
            clamp_yield_time(100, MIN_YIELD_TIME_MS, MAX_YIELD_TIME_MS),
            250
        );
    }

    #[test]
    fn clamps_above_maximum() {
        assert_eq!(
            clamp_yield_time(60_000, MIN_YIELD_TIME_MS, MAX_YIELD_TIME_MS),
            30_000
        );
    }

    #[test]
    fn passes_values_in_range() {
        assert_eq!(
            clamp_yield_time(1_000, MIN_YIELD_TIME_MS, MAX_YIELD_TIME_MS),
            1_000
        );
    }

    #[test]
    fn empty_stdin_polls_use_higher_minimum() {
        assert_eq!(
            clamp_yield_time(250, MIN_EMPTY_YIELD_TIME_MS, MAX_YIELD_TIME_MS),
            5_000
        );
    }

    #[test]
    fn renders_exited_outcome_without_session_line() {
        let outcome = ExecOutcome {
            output: b"hello\n".to_vec(),
            wall_time: Duration::from_millis(1234),
            exit_code: Some(0),
            session_id: None,
        };
        let rendered = outcome.render();
        assert_eq!(
            rendered,
            "--- Wall time: 1.234s ---\n--- Exit code: 0 ---\n--- Output ---\nhello\n"
        );
        assert!(outcome.success());
    }

    #[test]
    fn renders_parked_outcome_with_session_line() {
        let outcome = ExecOutcome {
            output: Vec::new(),
            wall_time: Duration::from_millis(500),
            exit_code: None,
            session_id: Some("12345".into()),
        };
        let rendered = outcome.render();
        assert!(rendered.contains("--- Session ID: 12345 ---"));
        assert!(!rendered.contains("Exit code"));
        assert!(outcome.success());
    }

    #[test]
    fn non_zero_exit_is_failure() {
        let outcome = ExecOutcome {
            output: Vec::new(),
            wall_time: Duration::from_millis(10),
            exit_code: Some(2),
            session_id: None,
        };
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn exec_command_short_lived_returns_exit_code() {
        let mgr = ExecSessionManager::new();
        let outcome = mgr
            .exec_command(
                ExecCommandParams {
                    cmd: "echo manager".into(),
                    workdir: None,
                    shell: None,
                    login: false,
                    tty: false,
                    yield_time_ms: Some(5_000),
                },
                &PathBuf::from("."),
                None,
            )
            .await
            .expect("exec");

        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.session_id, None);
        assert!(String::from_utf8_lossy(&outcome.output).contains("manager"));
        assert_eq!(mgr.store().count(), 0);
    }

    #[tokio::test]
    async fn exec_command_long_running_parks_session() {
        let mgr = ExecSessionManager::new();
        let outcome = mgr
            .exec_command(
                ExecCommandParams {
                    cmd: "sleep 60".into(),
                    workdir: None,
                    shell: None,
                    login: false,
                    tty: false,
                    yield_time_ms: Some(300),
                },
                &PathBuf::from("."),
                None,
            )
            .await
            .expect("exec");

        assert_eq!(outcome.exit_code, None);
        let id = outcome.session_id.clone().expect("session id");
        assert_eq!(mgr.store().count(), 1);

        let session = mgr.store().get(&id).expect("parked session");
        session.close();
        mgr.store().remove(&id);
    }

    #[tokio::test]
    async fn write_stdin_to_unknown_session_fails() {
        let mgr = ExecSessionManager::new();
        let err = mgr
            .write_stdin(
                WriteStdinParams {
                    session_id: 4242,
                    chars: String::new(),
                    yield_time_ms: Some(250),
                },
                None,
            )
            .await
            .expect_err("unknown session");
        assert!(matches!(err, TetherErr::UnknownSessionId(_)));
    }
}
