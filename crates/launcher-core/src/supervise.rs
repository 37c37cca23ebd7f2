//! Child process supervision and the stdout heartbeat protocol.
//!
//! The supervisor launches the application executable from a slot directory
//! with all standard streams redirected and the console window hidden, then
//! runs three cooperating tasks per child:
//!
//! - a **stdout reader** that consumes lines until EOF or cancellation;
//!   `HEARTBEAT` lines update liveness state, everything else is forwarded
//!   to the log prefixed with `APP:`
//! - a **heartbeat timer** that periodically checks how long the child has
//!   been silent and publishes a "not responding" status when the timeout
//!   elapses (advisory only — the child is never killed for silence)
//! - a **wait task** that observes the child's exit and publishes the exit
//!   code exactly once
//!
//! The tasks share one [`CancellationToken`]; cancelling stops the reader
//! and the timer promptly while the wait task completes on its own when the
//! child exits naturally.
//!
//! Heartbeat lines begin with the literal prefix `HEARTBEAT`
//! (case-insensitive), optionally followed by the UTC instant at which the
//! child produced the line. When the instant parses, the supervisor records
//! the send-to-receive delay as the last heartbeat ping.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Literal prefix identifying a heartbeat line on the child's stdout.
pub const HEARTBEAT_PREFIX: &str = "HEARTBEAT";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Lifecycle phase of a supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPhase {
    /// The process is being spawned.
    Spawning,
    /// The process is running.
    Running,
    /// The process has exited.
    Exited,
}

impl std::fmt::Display for AppPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawning => write!(f, "spawning"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Errors launching the application.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The executable could not be spawned.
    #[error("failed to launch {executable}: {source}")]
    Spawn {
        /// Path of the executable that failed to start.
        executable: String,
        /// Underlying spawn error.
        source: std::io::Error,
    },
}

/// Supervision parameters.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// File name of the application executable inside a slot.
    pub executable: String,

    /// Cadence of the heartbeat liveness check.
    pub heartbeat_interval: Duration,

    /// Silence after which the child counts as not responding.
    pub heartbeat_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            executable: "MeineApp.exe".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

/// State shared between the supervision tasks.
///
/// The stdout reader is the only writer of the heartbeat fields and the
/// wait task is the only writer of the exit fields, so the lock is held
/// for single reads and writes only, never across an await.
#[derive(Debug)]
struct Shared {
    phase: AppPhase,
    last_heartbeat: Instant,
    heartbeat_seen: bool,
    last_ping: Duration,
    exit_code: Option<i32>,
}

/// Launches and supervises the application executable of a slot.
pub struct AppSupervisor {
    config: SupervisorConfig,
    status: watch::Sender<String>,
}

impl AppSupervisor {
    /// Creates a supervisor publishing status text to `status`.
    #[must_use]
    pub const fn new(config: SupervisorConfig, status: watch::Sender<String>) -> Self {
        Self { config, status }
    }

    /// Spawns the application from `slot_dir` and begins supervision.
    ///
    /// Must be called within a Tokio runtime: the supervision tasks are
    /// spawned onto the current runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Spawn`] if the process cannot be started.
    pub fn start(&self, slot_dir: &Path) -> Result<AppHandle, LaunchError> {
        let executable = slot_dir.join(&self.config.executable);
        let exe_display = executable.display().to_string();
        self.status.send_replace("starting application".to_string());

        let mut cmd = Command::new(&executable);
        cmd.current_dir(slot_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            executable: exe_display.clone(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| LaunchError::Spawn {
            executable: exe_display.clone(),
            source: std::io::Error::other("process exited before a PID could be read"),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let shared = Arc::new(Mutex::new(Shared {
            phase: AppPhase::Running,
            last_heartbeat: Instant::now(),
            heartbeat_seen: false,
            last_ping: Duration::ZERO,
            exit_code: None,
        }));
        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        info!(pid, executable = %exe_display, "application started");
        self.status
            .send_replace(format!("application started (pid {pid})"));

        if let Some(stdout) = stdout {
            tokio::spawn(read_stdout(
                stdout,
                Arc::clone(&shared),
                self.status.clone(),
                cancel.clone(),
            ));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(read_stderr(stderr, cancel.clone()));
        }
        tokio::spawn(heartbeat_timer(
            self.config.clone(),
            Arc::clone(&shared),
            self.status.clone(),
            cancel.clone(),
            exit_tx.subscribe(),
        ));
        tokio::spawn(wait_for_exit(
            child,
            Arc::clone(&shared),
            self.status.clone(),
            exit_tx,
        ));

        Ok(AppHandle {
            pid,
            cancel,
            exit_rx,
            shared,
        })
    }
}

/// Handle to a supervised child process.
#[derive(Debug)]
pub struct AppHandle {
    pid: u32,
    cancel: CancellationToken,
    exit_rx: watch::Receiver<Option<i32>>,
    shared: Arc<Mutex<Shared>>,
}

impl AppHandle {
    /// OS process ID of the child.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Current lifecycle phase.
    ///
    /// # Panics
    ///
    /// Panics if a supervision task panicked while holding the state lock.
    #[must_use]
    pub fn phase(&self) -> AppPhase {
        self.shared.lock().expect("supervision state poisoned").phase
    }

    /// Exit code, once the child has exited. Children terminated without a
    /// code (killed by a signal) report `-1`.
    ///
    /// # Panics
    ///
    /// Panics if a supervision task panicked while holding the state lock.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.shared
            .lock()
            .expect("supervision state poisoned")
            .exit_code
    }

    /// Send-to-receive delay of the most recent timestamped heartbeat;
    /// zero before the first one or when heartbeats carry no timestamp.
    ///
    /// # Panics
    ///
    /// Panics if a supervision task panicked while holding the state lock.
    #[must_use]
    pub fn last_heartbeat_ping(&self) -> Duration {
        self.shared
            .lock()
            .expect("supervision state poisoned")
            .last_ping
    }

    /// Whether at least one heartbeat line has arrived.
    ///
    /// # Panics
    ///
    /// Panics if a supervision task panicked while holding the state lock.
    #[must_use]
    pub fn heartbeat_seen(&self) -> bool {
        self.shared
            .lock()
            .expect("supervision state poisoned")
            .heartbeat_seen
    }

    /// Stops the heartbeat timer and the stdout reader.
    ///
    /// The child is not killed; [`wait`](Self::wait) still completes when
    /// it exits on its own.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the child to exit and returns its exit code.
    ///
    /// The exit notification is published exactly once; repeated calls
    /// return the same code without waiting again.
    pub async fn wait(&mut self) -> i32 {
        loop {
            if let Some(code) = *self.exit_rx.borrow_and_update() {
                return code;
            }
            if self.exit_rx.changed().await.is_err() {
                // Wait task gone; fall back to the recorded code.
                return self.exit_code().unwrap_or(-1);
            }
        }
    }
}

/// Consumes the child's stdout line by line until EOF or cancellation.
async fn read_stdout(
    stdout: impl AsyncRead + Unpin,
    shared: Arc<Mutex<Shared>>,
    status: watch::Sender<String>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("stdout reader cancelled");
                break;
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_stdout_line(&line, &shared, &status),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stdout read error");
                    break;
                },
            }
        }
    }
}

async fn read_stderr(stderr: impl AsyncRead + Unpin, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            line = lines.next_line() => match line {
                Ok(Some(line)) => warn!("APP: {line}"),
                Ok(None) | Err(_) => break,
            }
        }
    }
}

fn handle_stdout_line(line: &str, shared: &Mutex<Shared>, status: &watch::Sender<String>) {
    if let Some(rest) = strip_heartbeat_prefix(line) {
        let ping = parse_heartbeat_instant(rest)
            .and_then(|sent| (Utc::now() - sent).to_std().ok())
            .unwrap_or(Duration::ZERO);

        {
            let mut state = shared.lock().expect("supervision state poisoned");
            state.last_heartbeat = Instant::now();
            state.heartbeat_seen = true;
            state.last_ping = ping;
        }
        debug!(ping_ms = %ping.as_millis(), "heartbeat received");
        status.send_replace(format!("application alive (ping {} ms)", ping.as_millis()));
    } else {
        info!("APP: {line}");
    }
}

/// Returns the text after the heartbeat prefix, if the line is one.
fn strip_heartbeat_prefix(line: &str) -> Option<&str> {
    let prefix = line.get(..HEARTBEAT_PREFIX.len())?;
    if prefix.eq_ignore_ascii_case(HEARTBEAT_PREFIX) {
        line.get(HEARTBEAT_PREFIX.len()..)
    } else {
        None
    }
}

/// Parses the optional heartbeat timestamp.
///
/// The child emits the instant it produced the line, ISO-8601 in UTC,
/// conventionally wrapped in brackets.
fn parse_heartbeat_instant(rest: &str) -> Option<DateTime<Utc>> {
    let text = rest
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim();
    if text.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}

/// Periodically checks child liveness until exit or cancellation.
async fn heartbeat_timer(
    config: SupervisorConfig,
    shared: Arc<Mutex<Shared>>,
    status: watch::Sender<String>,
    cancel: CancellationToken,
    mut exit_rx: watch::Receiver<Option<i32>>,
) {
    let mut interval = tokio::time::interval(config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("heartbeat timer cancelled");
                break;
            }

            changed = exit_rx.changed() => {
                if changed.is_err() || exit_rx.borrow_and_update().is_some() {
                    break;
                }
            }

            _ = interval.tick() => {
                let silence = {
                    let state = shared.lock().expect("supervision state poisoned");
                    if state.phase == AppPhase::Exited {
                        break;
                    }
                    state.last_heartbeat.elapsed()
                };
                if silence > config.heartbeat_timeout {
                    warn!(silence_secs = silence.as_secs(), "application is not responding");
                    status.send_replace(format!(
                        "application not responding (no heartbeat for {} s)",
                        silence.as_secs()
                    ));
                }
            }
        }
    }
}

/// Awaits child exit and publishes the exit code exactly once.
async fn wait_for_exit(
    mut child: tokio::process::Child,
    shared: Arc<Mutex<Shared>>,
    status: watch::Sender<String>,
    exit_tx: watch::Sender<Option<i32>>,
) {
    let code = match child.wait().await {
        Ok(exit_status) => exit_status.code().unwrap_or(-1),
        Err(e) => {
            warn!(error = %e, "failed to await child exit");
            -1
        },
    };

    {
        let mut state = shared.lock().expect("supervision state poisoned");
        state.phase = AppPhase::Exited;
        state.exit_code = Some(code);
    }
    info!(code, "application exited");
    status.send_replace(format!("application exited with code {code}"));
    let _ = exit_tx.send(Some(code));
}
