use std::time::Duration;

/// How long `stop()` waits for a graceful exit before escalating.
pub const GRACE_TIMEOUT: Duration = Duration::from_secs(5);
/// Extra wait for the monitor to reap the process after a forced kill.
pub const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit-monitor poll interval.
pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const READY_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const READY_MAX_WAIT: Duration = Duration::from_secs(30);

/// Lines of stderr kept for failure diagnostics.
pub const STDERR_TAIL_LINES: usize = 20;

pub const DEFAULT_BACKEND_PORT: u16 = 8000;
