//! Backend process supervisor.
//!
//! Owns the single backend child process: spawning it from the isolated
//! runtime, watching it for exit, forwarding its output, and driving the
//! graceful-then-forceful shutdown sequence. All state transitions are
//! broadcast as events so connected clients see launches, exits, and
//! crashes as they happen.
//!
//! A deliberate stop ends in `Stopped`; a process that dies on its own
//! ends in `Exited`. Both allow a fresh launch.

use parking_lot::{Mutex, RwLock};
use roost_core::{BackendState, Event, LogStream};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};

use crate::config::BackendConfig;
use crate::defaults::KILL_CONFIRM_TIMEOUT;
use crate::defaults::MONITOR_POLL_INTERVAL;
use crate::paths;
use crate::signal;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("backend is already {0}")]
    AlreadyActive(BackendState),

    #[error("backend executable not found at {}; install it first", .0.display())]
    NotInstalled(PathBuf),

    #[error("failed to spawn backend: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal backend: {source}")]
    Signal {
        #[source]
        source: std::io::Error,
    },
}

/// How a stop request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running.
    WasIdle,
    /// The process exited within the grace period.
    Graceful,
    /// The process ignored the request and its tree was killed.
    Forced,
}

/// State shared with the monitor task and output forwarders.
struct Shared {
    process: Mutex<Option<Child>>,
    state: RwLock<BackendState>,
    /// 0 when no process is running.
    pid: AtomicU32,
    last_exit: RwLock<Option<String>>,
    /// Bumped by the monitor each time the process is reaped.
    exit_generation: watch::Sender<u64>,
    events: broadcast::Sender<Event>,
}

impl Shared {
    fn state(&self) -> BackendState {
        *self.state.read()
    }

    fn pid(&self) -> Option<u32> {
        let pid = self.pid.load(Ordering::Relaxed);
        if pid > 0 { Some(pid) } else { None }
    }

    fn transition(&self, state: BackendState, message: Option<String>) {
        *self.state.write() = state;
        let _ = self.events.send(Event::Backend { state, message });
    }
}

pub struct Supervisor {
    config: BackendConfig,
    shared: Arc<Shared>,
    /// Serializes launch and stop so they cannot interleave.
    ops: tokio::sync::Mutex<()>,
}

impl Supervisor {
    pub fn new(config: BackendConfig, events: broadcast::Sender<Event>) -> Self {
        let (exit_generation, _) = watch::channel(0);
        Self {
            config,
            shared: Arc::new(Shared {
                process: Mutex::new(None),
                state: RwLock::new(BackendState::Idle),
                pid: AtomicU32::new(0),
                last_exit: RwLock::new(None),
                exit_generation,
                events,
            }),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> BackendState {
        self.shared.state()
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid()
    }

    pub fn last_exit(&self) -> Option<String> {
        self.shared.last_exit.read().clone()
    }

    /// Spawn the backend from the runtime and start supervising it.
    pub async fn launch(&self) -> Result<u32, SupervisorError> {
        let _ops = self.ops.lock().await;

        let current = self.shared.state();
        if !current.can_launch() {
            return Err(SupervisorError::AlreadyActive(current));
        }

        let executable = paths::runtime_executable(&self.config.runtime_dir, &self.config.executable);
        if !executable.exists() {
            return Err(SupervisorError::NotInstalled(executable));
        }

        *self.shared.last_exit.write() = None;
        self.shared.transition(
            BackendState::Launching,
            Some(format!("starting {}", executable.display())),
        );
        tracing::info!(executable = %executable.display(), port = self.config.port, "Launching backend");

        let mut child = Command::new(&executable)
            .args(&self.config.args)
            .env("PATH", paths::runtime_path(&self.config.runtime_dir))
            .env("VIRTUAL_ENV", self.config.runtime_dir.as_os_str())
            .env("PORT", self.config.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                self.shared
                    .transition(current, Some(format!("spawn failed: {source}")));
                SupervisorError::Spawn { source }
            })?;

        let pid = child.id().unwrap_or(0);
        self.shared.pid.store(pid, Ordering::Relaxed);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(
                stdout,
                LogStream::Stdout,
                self.shared.events.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(
                stderr,
                LogStream::Stderr,
                self.shared.events.clone(),
            ));
        }

        *self.shared.process.lock() = Some(child);
        self.shared
            .transition(BackendState::Running, Some(format!("pid {pid}")));
        tracing::info!(pid, "Backend running");

        tokio::spawn(monitor(self.shared.clone()));
        Ok(pid)
    }

    /// Stop the backend: ask nicely, wait out the grace period, then kill
    /// the process tree. Idempotent when nothing is running.
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let _ops = self.ops.lock().await;

        let Some(pid) = self.shared.pid() else {
            return Ok(StopOutcome::WasIdle);
        };

        let mut exit_rx = self.shared.exit_generation.subscribe();
        self.shared.transition(BackendState::Stopping, None);
        tracing::info!(pid, "Stopping backend");

        signal::terminate(pid).map_err(|source| SupervisorError::Signal { source })?;
        if self
            .wait_for_exit(&mut exit_rx, self.config.grace_timeout)
            .await
        {
            tracing::info!(pid, "Backend stopped gracefully");
            return Ok(StopOutcome::Graceful);
        }

        tracing::warn!(pid, "Grace period expired, killing process tree");
        signal::terminate_tree(pid).await;
        if self.wait_for_exit(&mut exit_rx, KILL_CONFIRM_TIMEOUT).await {
            return Ok(StopOutcome::Forced);
        }

        // The monitor never reaped it; fall back to the handle.
        if let Some(mut child) = self.shared.process.lock().take() {
            let _ = child.start_kill();
        }
        self.shared.pid.store(0, Ordering::Relaxed);
        self.shared
            .transition(BackendState::Stopped, Some("killed".to_string()));
        Ok(StopOutcome::Forced)
    }

    /// True once the monitor has reaped the process.
    async fn wait_for_exit(&self, exit_rx: &mut watch::Receiver<u64>, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            while self.shared.pid().is_some() {
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }
}

/// Poll the child until it exits, then record the outcome and settle the
/// final state. This is the only place the process handle is reaped.
async fn monitor(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(MONITOR_POLL_INTERVAL);
    loop {
        interval.tick().await;

        let reaped = {
            let mut guard = shared.process.lock();
            let Some(child) = guard.as_mut() else {
                // Handle taken elsewhere; nothing left to watch.
                return;
            };
            match child.try_wait() {
                Ok(None) => None,
                Ok(Some(status)) => {
                    guard.take();
                    Some(describe_exit(status))
                }
                Err(e) => {
                    guard.take();
                    Some(format!("wait failed: {e}"))
                }
            }
        };

        if let Some(summary) = reaped {
            let was_stopping = shared.state() == BackendState::Stopping;
            shared.pid.store(0, Ordering::Relaxed);
            *shared.last_exit.write() = Some(summary.clone());

            let next = if was_stopping {
                BackendState::Stopped
            } else {
                tracing::warn!(exit = %summary, "Backend exited unexpectedly");
                BackendState::Exited
            };
            shared.transition(next, Some(summary));
            shared.exit_generation.send_modify(|g| *g += 1);
            return;
        }
    }
}

fn describe_exit(status: std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_string(),
    }
}

async fn forward_output<R>(reader: R, stream: LogStream, events: broadcast::Sender<Event>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(text)) = lines.next_line().await {
        let _ = events.send(Event::Log { stream, text });
    }
}
