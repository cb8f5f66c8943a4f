use std::path::{Path, PathBuf};

/// If `roost-daemon` is being run from a path under a `target/` directory,
/// return that `target/` directory path.
pub fn target_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    let mut cur = exe_path;
    loop {
        if cur.file_name().is_some_and(|n| n == "target") {
            return Some(cur.to_path_buf());
        }
        cur = cur.parent()?;
    }
}

/// If `roost-daemon` is being run from a path under a `target/` directory,
/// return the repo root directory (the parent of `target/`).
pub fn repo_root_from_exe(exe_path: &Path) -> Option<PathBuf> {
    target_dir_from_exe(exe_path)?
        .parent()
        .map(|p| p.to_path_buf())
}

/// Default unix socket path for debug builds when running from a source checkout.
///
/// Example: `{repo}/local-dev/roost-daemon/tmp/roost.sock`
pub fn debug_default_socket_from_exe(exe_path: &Path) -> Option<PathBuf> {
    repo_root_from_exe(exe_path).map(|root| {
        root.join("local-dev")
            .join("roost-daemon")
            .join("tmp")
            .join("roost.sock")
    })
}

/// Default data dir for debug builds when running from a source checkout.
///
/// Example: `{repo}/local-dev/roost-daemon/data`
pub fn debug_default_data_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    repo_root_from_exe(exe_path).map(|root| root.join("local-dev").join("roost-daemon").join("data"))
}

/// Directory holding the runtime's executables (`bin` on unix,
/// `Scripts` on windows).
pub fn runtime_bin_dir(runtime_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        runtime_dir.join("Scripts")
    } else {
        runtime_dir.join("bin")
    }
}

/// The runtime's interpreter. Its presence is what "the isolated runtime
/// exists" means.
pub fn runtime_python(runtime_dir: &Path) -> PathBuf {
    let name = if cfg!(windows) { "python.exe" } else { "python" };
    runtime_bin_dir(runtime_dir).join(name)
}

/// Path of an executable installed into the runtime by a package.
pub fn runtime_executable(runtime_dir: &Path, name: &str) -> PathBuf {
    let file = if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    };
    runtime_bin_dir(runtime_dir).join(file)
}

/// PATH value with the common package-manager install locations prepended.
///
/// `uv` installs itself to `~/.local/bin` (or `~/.cargo/bin` for older
/// installers), which is frequently not on the PATH a daemon inherits.
pub fn enhanced_path() -> String {
    let mut dirs_to_add: Vec<PathBuf> = Vec::new();
    if let Some(home) = dirs::home_dir() {
        dirs_to_add.push(home.join(".local").join("bin"));
        dirs_to_add.push(home.join(".cargo").join("bin"));
    }
    dirs_to_add.push(PathBuf::from("/usr/local/bin"));
    dirs_to_add.push(PathBuf::from("/opt/homebrew/bin"));

    let mut parts: Vec<String> = dirs_to_add
        .into_iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    if let Ok(existing) = std::env::var("PATH") {
        parts.push(existing);
    }
    parts.join(path_separator())
}

/// PATH value that puts the runtime's bin dir first, so the backend
/// resolves its own interpreter and console scripts.
pub fn runtime_path(runtime_dir: &Path) -> String {
    let bin = runtime_bin_dir(runtime_dir).to_string_lossy().to_string();
    format!("{bin}{}{}", path_separator(), enhanced_path())
}

fn path_separator() -> &'static str {
    if cfg!(windows) { ";" } else { ":" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_root_from_exe_finds_repo_root() {
        let exe = PathBuf::from("/home/me/proj/target/debug/roost-daemon");
        assert_eq!(
            repo_root_from_exe(&exe).as_deref(),
            Some(Path::new("/home/me/proj"))
        );
    }

    #[test]
    fn debug_default_socket_is_under_local_dev_tmp() {
        let exe = PathBuf::from("/home/me/proj/target/debug/roost-daemon");
        assert_eq!(
            debug_default_socket_from_exe(&exe).as_deref(),
            Some(Path::new("/home/me/proj/local-dev/roost-daemon/tmp/roost.sock"))
        );
    }

    #[test]
    fn no_target_dir_means_no_debug_defaults() {
        let exe = PathBuf::from("/usr/local/bin/roost-daemon");
        assert!(debug_default_socket_from_exe(&exe).is_none());
        assert!(debug_default_data_dir_from_exe(&exe).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn runtime_layout_uses_bin_on_unix() {
        let runtime = Path::new("/data/venv");
        assert_eq!(
            runtime_python(runtime),
            PathBuf::from("/data/venv/bin/python")
        );
        assert_eq!(
            runtime_executable(runtime, "roost-backend"),
            PathBuf::from("/data/venv/bin/roost-backend")
        );
    }

    #[test]
    fn enhanced_path_keeps_existing_path_entries() {
        let path = enhanced_path();
        if let Ok(existing) = std::env::var("PATH") {
            assert!(path.ends_with(&existing));
        }
    }
}
