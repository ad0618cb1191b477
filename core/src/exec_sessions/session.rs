//! A single live child process owned by the exec-session store.
//!
//! PTY sessions keep a writable stdin and run their reader on a blocking
//! thread; pipe sessions read stdout/stderr through async tasks. Both feed
//! the session's head/tail buffer, which `collect_output` drains between
//! tool invocations.

use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use std::time::Instant as StdInstant;

use portable_pty::native_pty_system;
use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::Result;
use crate::error::TetherErr;
use crate::exec_sessions::buffer::HeadTailBuffer;
use crate::exec_sessions::buffer::DEFAULT_MAX_BYTES;

const READ_CHUNK: usize = 8192;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// How long to wait for readers to flush EOF output after exit.
const FLUSH_GRACE: Duration = Duration::from_millis(500);

pub struct SessionOpts {
    pub id: String,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub tty: bool,
}

pub struct ExecSession {
    id: String,
    command: Vec<String>,
    tty: bool,
    buffer: Arc<HeadTailBuffer>,
    exit_code: Arc<StdMutex<Option<i32>>>,
    exited_rx: watch::Receiver<bool>,
    readers_rx: watch::Receiver<usize>,
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    pty_killer: StdMutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    // Keeps the PTY fds open for the lifetime of the session.
    pty_master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    kill_notify: Arc<Notify>,
    last_used: StdMutex<StdInstant>,
}

impl ExecSession {
    /// Start a child process and begin capturing its output.
    pub fn start(opts: SessionOpts) -> Result<Arc<Self>> {
        if opts.command.is_empty() {
            return Err(TetherErr::Validation("command must not be empty".into()));
        }
        if opts.tty {
            Self::start_pty(opts)
        } else {
            Self::start_pipe(opts)
        }
    }

    fn start_pipe(opts: SessionOpts) -> Result<Arc<Self>> {
        let buffer = Arc::new(HeadTailBuffer::new(DEFAULT_MAX_BYTES));
        let exit_code = Arc::new(StdMutex::new(None));
        let (exited_tx, exited_rx) = watch::channel(false);
        let (readers_tx, readers_rx) = watch::channel(2usize);
        let readers_tx = Arc::new(readers_tx);
        let kill_notify = Arc::new(Notify::new());

        let mut cmd = tokio::process::Command::new(&opts.command[0]);
        cmd.args(&opts.command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| TetherErr::Validation(format!("failed to start command: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TetherErr::Validation("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TetherErr::Validation("child stderr unavailable".into()))?;

        spawn_pipe_reader(stdout, Arc::clone(&buffer), Arc::clone(&readers_tx));
        spawn_pipe_reader(stderr, Arc::clone(&buffer), Arc::clone(&readers_tx));

        let exit_cell = Arc::clone(&exit_code);
        let wait_kill = Arc::clone(&kill_notify);
        tokio::spawn(async move {
            let code = loop {
                tokio::select! {
                    status = child.wait() => {
                        break status.ok().and_then(|s| s.code()).unwrap_or(-1);
                    }
                    _ = wait_kill.notified() => {
                        let _ = child.start_kill();
                    }
                }
            };
            *exit_cell.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
            let _ = exited_tx.send(true);
        });

        Ok(Arc::new(Self {
            id: opts.id,
            command: opts.command,
            tty: false,
            buffer,
            exit_code,
            exited_rx,
            readers_rx,
            stdin_tx: None,
            pty_killer: StdMutex::new(None),
            pty_master: StdMutex::new(None),
            kill_notify,
            last_used: StdMutex::new(StdInstant::now()),
        }))
    }

    fn start_pty(opts: SessionOpts) -> Result<Arc<Self>> {
        let buffer = Arc::new(HeadTailBuffer::new(DEFAULT_MAX_BYTES));
        let exit_code = Arc::new(StdMutex::new(None));
        let (exited_tx, exited_rx) = watch::channel(false);
        let (readers_tx, readers_rx) = watch::channel(1usize);
        let readers_tx = Arc::new(readers_tx);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| TetherErr::Validation(format!("failed to open pty: {err}")))?;

        let mut builder = CommandBuilder::new(&opts.command[0]);
        for arg in &opts.command[1..] {
            builder.arg(arg);
        }
        if let Some(cwd) = &opts.cwd {
            builder.cwd(cwd);
        }
        for (key, value) in &opts.env {
            builder.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|err| TetherErr::Validation(format!("failed to start command: {err}")))?;
        let killer = child.clone_killer();
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| TetherErr::Validation(format!("failed to read pty: {err}")))?;
        let reader_buffer = Arc::clone(&buffer);
        let reader_done = Arc::clone(&readers_tx);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => reader_buffer.push(&buf[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            reader_done.send_modify(|n| *n = n.saturating_sub(1));
        });

        let mut writer = pair
            .master
            .take_writer()
            .map_err(|err| TetherErr::Validation(format!("failed to open pty writer: {err}")))?;
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::task::spawn_blocking(move || {
            while let Some(bytes) = stdin_rx.blocking_recv() {
                if writer.write_all(&bytes).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        let exit_cell = Arc::clone(&exit_code);
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(_) => -1,
            };
            *exit_cell.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
            let _ = exited_tx.send(true);
        });

        Ok(Arc::new(Self {
            id: opts.id,
            command: opts.command,
            tty: true,
            buffer,
            exit_code,
            exited_rx,
            readers_rx,
            stdin_tx: Some(stdin_tx),
            pty_killer: StdMutex::new(Some(killer)),
            pty_master: StdMutex::new(Some(pair.master)),
            kill_notify: Arc::new(Notify::new()),
            last_used: StdMutex::new(StdInstant::now()),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn is_tty(&self) -> bool {
        self.tty
    }

    pub fn has_exited(&self) -> bool {
        *self.exited_rx.borrow()
    }

    /// `None` while the process is still running.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_used(&self) -> StdInstant {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = StdInstant::now();
    }

    /// Queue bytes for the child's stdin. Rejected for pipe sessions and
    /// after the writer has shut down.
    pub fn write_stdin(&self, bytes: &[u8]) -> Result<()> {
        let tx = self.stdin_tx.as_ref().ok_or(TetherErr::StdinClosed)?;
        tx.try_send(bytes.to_vec())
            .map_err(|_| TetherErr::StdinClosed)
    }

    /// Collect output until the deadline passes or the process exits,
    /// invoking `heartbeat` at least every five seconds while waiting.
    /// Returns the bytes that accumulated since the previous collection.
    pub async fn collect_output(
        &self,
        deadline: Instant,
        heartbeat: Option<&(dyn Fn() + Send + Sync)>,
    ) -> Vec<u8> {
        let mut exited_rx = self.exited_rx.clone();
        let mut last_beat = Instant::now();

        while !*exited_rx.borrow() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wake = deadline.min(last_beat + HEARTBEAT_INTERVAL);
            tokio::select! {
                changed = exited_rx.changed() => {
                    if changed.is_err() {
                        // Exit notifier gone; pace on the deadline instead.
                        tokio::time::sleep_until(wake).await;
                    }
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
            if let Some(beat) = heartbeat {
                if last_beat.elapsed() >= HEARTBEAT_INTERVAL {
                    beat();
                    last_beat = Instant::now();
                }
            }
        }

        if *exited_rx.borrow() {
            self.wait_for_flush().await;
        }

        self.touch();
        self.buffer.drain()
    }

    /// Give the reader tasks a bounded window to push the output that was
    /// in flight when the process exited.
    async fn wait_for_flush(&self) {
        let mut readers_rx = self.readers_rx.clone();
        let flush_deadline = Instant::now() + FLUSH_GRACE;
        while *readers_rx.borrow() > 0 && Instant::now() < flush_deadline {
            tokio::select! {
                changed = readers_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(flush_deadline) => break,
            }
        }
    }

    /// Kill the child process. Reader and wait tasks unwind on their own.
    pub fn close(&self) {
        if self.tty {
            if let Some(killer) = self
                .pty_killer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_mut()
            {
                let _ = killer.kill();
            }
            // Dropping the master closes the PTY so readers see EOF.
            self.pty_master
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
        } else {
            self.kill_notify.notify_one();
        }
    }
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("tty", &self.tty)
            .field("exited", &self.has_exited())
            .finish()
    }
}

fn spawn_pipe_reader(
    mut source: impl AsyncReadExt + Unpin + Send + 'static,
    buffer: Arc<HeadTailBuffer>,
    done: Arc<watch::Sender<usize>>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match source.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.push(&buf[..n]),
            }
        }
        done.send_modify(|n| *n = n.saturating_sub(1));
    });
}
