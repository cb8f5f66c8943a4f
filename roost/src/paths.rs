use std::path::{Path, PathBuf};

/// If `roost` is being run from a path under a `target/` directory,
/// return the repo root directory (the parent of `target/`).
fn repo_root_from_exe(exe_path: &Path) -> Option<PathBuf> {
    let mut cur = exe_path;
    loop {
        if cur.file_name().is_some_and(|n| n == "target") {
            return cur.parent().map(|p| p.to_path_buf());
        }
        cur = cur.parent()?;
    }
}

/// Default daemon socket path. Debug builds running from a source
/// checkout use the same local-dev path the daemon defaults to.
pub fn default_socket_path() -> String {
    if cfg!(debug_assertions)
        && let Ok(exe) = std::env::current_exe()
        && let Some(root) = repo_root_from_exe(&exe)
    {
        return root
            .join("local-dev")
            .join("roost-daemon")
            .join("tmp")
            .join("roost.sock")
            .to_string_lossy()
            .to_string();
    }
    "/var/run/roost/roost.sock".to_string()
}
