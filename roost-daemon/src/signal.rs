//! Process signalling helpers.
//!
//! A backend launched from a wrapper script may spawn its own children,
//! so forceful termination has to take out the whole tree, not just the
//! direct child. Signalling a process that already exited is not an
//! error anywhere here.

/// Ask a process to shut down gracefully.
#[cfg(unix)]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    // SAFETY: kill with a valid signal number has no memory effects.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone.
        return Ok(());
    }
    Err(err)
}

#[cfg(windows)]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    // No SIGTERM equivalent; taskkill without /F requests a clean exit
    // for the whole tree.
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .output()
        .map(|_| ())
}

/// Forcefully kill a process and its direct children.
///
/// Failures are logged and swallowed; by the time this runs the process
/// may have exited on its own, and there is nothing further to escalate
/// to anyway.
#[cfg(unix)]
pub async fn terminate_tree(pid: u32) {
    for child in child_pids(pid).await {
        tracing::debug!(pid = child, parent = pid, "Killing child process");
        // SAFETY: see `terminate`.
        unsafe {
            libc::kill(child as libc::pid_t, libc::SIGKILL);
        }
    }
    // SAFETY: see `terminate`.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(windows)]
pub async fn terminate_tree(pid: u32) {
    let result = tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .await;
    if let Err(e) = result {
        tracing::warn!(pid, error = %e, "taskkill failed");
    }
}

/// Direct children of a process, via pgrep.
#[cfg(unix)]
async fn child_pids(pid: u32) -> Vec<u32> {
    let output = tokio::process::Command::new("pgrep")
        .args(["-P", &pid.to_string()])
        .output()
        .await;
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect(),
        Err(e) => {
            tracing::debug!(pid, error = %e, "pgrep unavailable, killing parent only");
            Vec::new()
        }
    }
}
