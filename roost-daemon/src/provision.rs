//! Provisioner - drives the ordered install sequence that turns a bare
//! machine into one that can run the backend.
//!
//! Targets are processed strictly in dependency order (package manager,
//! then isolated runtime, then packages) and the chain short-circuits on
//! the first failure. Already-satisfied targets are skipped via a fresh
//! probe, so re-running provisioning on a provisioned machine is cheap
//! and side-effect-free. The subsystem never retries on its own; callers
//! re-invoke explicitly and the skip logic avoids redoing completed work.

use roost_core::{Event, InstallTarget, ProgressPhase};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::config::BackendConfig;
use crate::paths;
use crate::probe::Prober;
use crate::runner::{CommandRunner, CommandSpec, OutputLine};

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The install command ran and returned non-zero.
    #[error("{target} install failed: {detail}")]
    InstallFailed {
        target: InstallTarget,
        detail: String,
    },

    /// The install command could not be started at all.
    #[error("installer for {target} could not be started: {detail}")]
    InstallerUnavailable {
        target: InstallTarget,
        detail: String,
    },

    #[error("automatic {target} install is not supported on this platform")]
    UnsupportedPlatform { target: InstallTarget },
}

impl ProvisionError {
    /// The first failing target of the run.
    pub fn target(&self) -> InstallTarget {
        match self {
            ProvisionError::InstallFailed { target, .. }
            | ProvisionError::InstallerUnavailable { target, .. }
            | ProvisionError::UnsupportedPlatform { target } => *target,
        }
    }
}

pub struct Provisioner {
    runner: Arc<dyn CommandRunner>,
    prober: Arc<Prober>,
    config: BackendConfig,
    events: broadcast::Sender<Event>,
    /// One provisioning run at a time.
    run_lock: tokio::sync::Mutex<()>,
}

impl Provisioner {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        prober: Arc<Prober>,
        config: BackendConfig,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            runner,
            prober,
            config,
            events,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Ensure a single target is satisfied.
    pub async fn ensure(&self, target: InstallTarget) -> Result<(), ProvisionError> {
        let _run = self.run_lock.lock().await;
        self.ensure_target(target).await
    }

    /// Ensure all targets, in dependency order, stopping at the first failure.
    pub async fn ensure_all(&self) -> Result<(), ProvisionError> {
        let _run = self.run_lock.lock().await;
        for target in InstallTarget::ALL {
            self.ensure_target(target).await?;
        }
        Ok(())
    }

    async fn ensure_target(&self, target: InstallTarget) -> Result<(), ProvisionError> {
        if self.prober.satisfied(target).await {
            tracing::info!(target = %target, "Already satisfied, skipping install");
            self.emit(target, ProgressPhase::Completed, self.skip_message(target));
            return Ok(());
        }

        self.emit(target, ProgressPhase::Started, self.start_message(target));
        tracing::info!(target = %target, "Installing");

        if target == InstallTarget::Runtime
            && let Some(parent) = self.config.runtime_dir.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            let detail = format!("could not create {}: {e}", parent.display());
            self.emit(target, ProgressPhase::Failed, detail.clone());
            return Err(ProvisionError::InstallFailed { target, detail });
        }

        let spec = self.install_spec(target)?;
        let (tx, rx) = mpsc::channel::<OutputLine>(64);
        let forward = tokio::spawn(forward_install_output(rx, target, self.events.clone()));

        let result = self.runner.run_streaming(&spec, tx).await;
        let _ = forward.await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let detail = e.to_string();
                self.emit(target, ProgressPhase::Failed, detail.clone());
                return Err(ProvisionError::InstallerUnavailable { target, detail });
            }
        };

        if !output.success {
            let detail = output.failure_detail();
            tracing::warn!(target = %target, detail = %detail, "Install failed");
            self.emit(target, ProgressPhase::Failed, detail.clone());
            return Err(ProvisionError::InstallFailed { target, detail });
        }

        // The bootstrap installer can finish cleanly yet land outside the
        // PATH the daemon sees; verify before declaring success.
        if target == InstallTarget::PackageManager && !self.prober.has_package_manager().await {
            let detail = format!(
                "{} is still not on PATH after install; install it manually or adjust PATH",
                self.config.package_manager
            );
            self.emit(target, ProgressPhase::Failed, detail.clone());
            return Err(ProvisionError::InstallFailed { target, detail });
        }

        tracing::info!(target = %target, "Install completed");
        self.emit(target, ProgressPhase::Completed, self.done_message(target));
        Ok(())
    }

    fn install_spec(&self, target: InstallTarget) -> Result<CommandSpec, ProvisionError> {
        let pm = &self.config.package_manager;
        let runtime_dir = self.config.runtime_dir.to_string_lossy().to_string();

        let spec = match target {
            InstallTarget::PackageManager => bootstrap_spec(pm)
                .ok_or(ProvisionError::UnsupportedPlatform { target })?,
            InstallTarget::Runtime => CommandSpec::new(pm)
                .args(["venv", &runtime_dir])
                .env("PATH", paths::enhanced_path()),
            InstallTarget::BackendPackage => self.pip_install_spec(&self.config.backend_package),
            InstallTarget::ToolsPackage => self.pip_install_spec(&self.config.tools_package),
        };
        Ok(spec)
    }

    fn pip_install_spec(&self, package: &str) -> CommandSpec {
        CommandSpec::new(&self.config.package_manager)
            .args(["pip", "install", "--upgrade", package])
            .env("PATH", paths::enhanced_path())
            .env(
                "VIRTUAL_ENV",
                self.config.runtime_dir.to_string_lossy().to_string(),
            )
    }

    fn skip_message(&self, target: InstallTarget) -> String {
        match target {
            InstallTarget::PackageManager => {
                format!("{} is already installed", self.config.package_manager)
            }
            InstallTarget::Runtime => format!(
                "runtime already exists at {}",
                self.config.runtime_dir.display()
            ),
            InstallTarget::BackendPackage => {
                format!("{} is already installed", self.config.backend_package)
            }
            InstallTarget::ToolsPackage => {
                format!("{} is already installed", self.config.tools_package)
            }
        }
    }

    fn start_message(&self, target: InstallTarget) -> String {
        match target {
            InstallTarget::PackageManager => {
                format!("installing {}", self.config.package_manager)
            }
            InstallTarget::Runtime => format!(
                "creating runtime at {}",
                self.config.runtime_dir.display()
            ),
            InstallTarget::BackendPackage => {
                format!("installing {}", self.config.backend_package)
            }
            InstallTarget::ToolsPackage => format!("installing {}", self.config.tools_package),
        }
    }

    fn done_message(&self, target: InstallTarget) -> String {
        match target {
            InstallTarget::PackageManager => {
                format!("{} installed successfully", self.config.package_manager)
            }
            InstallTarget::Runtime => "runtime created".to_string(),
            InstallTarget::BackendPackage => {
                format!("{} installed successfully", self.config.backend_package)
            }
            InstallTarget::ToolsPackage => {
                format!("{} installed successfully", self.config.tools_package)
            }
        }
    }

    fn emit(&self, target: InstallTarget, phase: ProgressPhase, message: String) {
        let _ = self.events.send(Event::Progress {
            target,
            phase,
            message,
        });
    }
}

/// Forward raw installer output to the log stream and the meaningful
/// subset as `progressing` events.
async fn forward_install_output(
    mut rx: mpsc::Receiver<OutputLine>,
    target: InstallTarget,
    events: broadcast::Sender<Event>,
) {
    while let Some(line) = rx.recv().await {
        let _ = events.send(Event::Log {
            stream: line.stream,
            text: line.text.clone(),
        });
        if let Some(summary) = summarize_install_line(&line.text) {
            let _ = events.send(Event::Progress {
                target,
                phase: ProgressPhase::Progressing,
                message: summary,
            });
        }
    }
}

/// Reduce raw installer chatter to user-meaningful lines.
///
/// Installers emit progress bars, byte counts, and per-wheel noise; only
/// summary lines and diagnostics are worth surfacing as progress.
fn summarize_install_line(line: &str) -> Option<String> {
    const KEEP_PREFIXES: [&str; 9] = [
        "Resolved",
        "Prepared",
        "Installed",
        "Audited",
        "Downloading",
        "Creating",
        "Using",
        "Uninstalled",
        "Activate",
    ];

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Progress-bar redraws and byte counters.
    if trimmed.contains('\u{2588}') || trimmed.ends_with('%') {
        return None;
    }

    let lowered = trimmed.to_ascii_lowercase();
    if lowered.starts_with("error") || lowered.starts_with("warning") {
        return Some(trimmed.to_string());
    }

    KEEP_PREFIXES
        .iter()
        .any(|p| trimmed.starts_with(p))
        .then(|| trimmed.to_string())
}

/// Platform-specific bootstrap for the package manager itself.
fn bootstrap_spec(package_manager: &str) -> Option<CommandSpec> {
    let spec = if cfg!(windows) {
        CommandSpec::new("powershell").args([
            "-ExecutionPolicy",
            "ByPass",
            "-c",
            &format!("irm https://astral.sh/{package_manager}/install.ps1 | iex"),
        ])
    } else if cfg!(unix) {
        CommandSpec::new("sh").args([
            "-c",
            &format!("curl -LsSf https://astral.sh/{package_manager}/install.sh | sh"),
        ])
    } else {
        return None;
    };
    Some(spec.env("PATH", paths::enhanced_path()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoostToml;
    use crate::runner::{RunOutput, RunnerError};
    use crate::runner::testing::{FakeRunner, failed_output, ok_output};
    use parking_lot::Mutex;
    use std::collections::HashSet;

    fn config_for(dir: &std::path::Path) -> BackendConfig {
        let mut toml = RoostToml::default();
        toml.backend.runtime_dir = Some(dir.join("venv"));
        toml.resolve(dir)
    }

    fn provisioner_with(
        runner: Arc<FakeRunner>,
        config: BackendConfig,
    ) -> (Provisioner, broadcast::Receiver<Event>) {
        let (events, rx) = broadcast::channel(256);
        let prober = Arc::new(Prober::new(runner.clone(), config.clone()));
        (
            Provisioner::new(runner, prober, config, events),
            rx,
        )
    }

    fn drain_progress(rx: &mut broadcast::Receiver<Event>) -> Vec<(InstallTarget, ProgressPhase)> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::Progress { target, phase, .. } = event {
                seen.push((target, phase));
            }
        }
        seen
    }

    /// Simulates a machine where everything is already provisioned.
    fn satisfied_runner() -> Arc<FakeRunner> {
        Arc::new(FakeRunner::new(|spec| {
            if spec.args.first().map(String::as_str) == Some("--version") {
                Ok(ok_output("uv 0.7.2"))
            } else if spec.args.first().map(String::as_str) == Some("pip")
                && spec.args.get(1).map(String::as_str) == Some("list")
            {
                Ok(ok_output("roost-backend 1.0.0\nroost-tools 1.0.0"))
            } else {
                panic!("unexpected command: {}", spec.display())
            }
        }))
    }

    #[tokio::test]
    async fn satisfied_target_is_skipped_without_installing() {
        let temp = tempfile::TempDir::new().unwrap();
        let runner = satisfied_runner();
        let (provisioner, mut rx) = provisioner_with(runner.clone(), config_for(temp.path()));

        provisioner.ensure(InstallTarget::PackageManager).await.unwrap();

        let progress = drain_progress(&mut rx);
        assert_eq!(
            progress,
            vec![(InstallTarget::PackageManager, ProgressPhase::Completed)]
        );
        // Only the probe ran; no install command.
        assert_eq!(runner.calls(), vec!["uv --version"]);
    }

    #[tokio::test]
    async fn already_provisioned_machine_skips_every_target() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = config_for(temp.path());

        // Runtime probe is filesystem-based; create the interpreter marker.
        let python = paths::runtime_python(&config.runtime_dir);
        std::fs::create_dir_all(python.parent().unwrap()).unwrap();
        std::fs::write(&python, "").unwrap();

        let runner = satisfied_runner();
        let (provisioner, mut rx) = provisioner_with(runner.clone(), config);

        provisioner.ensure_all().await.unwrap();

        let progress = drain_progress(&mut rx);
        assert_eq!(progress.len(), 4);
        assert!(
            progress
                .iter()
                .all(|(_, phase)| *phase == ProgressPhase::Completed)
        );
        // Probes only, zero install invocations.
        assert!(
            runner
                .calls()
                .iter()
                .all(|c| c.contains("--version") || c.contains("pip list"))
        );
    }

    #[tokio::test]
    async fn failed_package_manager_install_short_circuits_the_chain() {
        let temp = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(|spec| {
            if spec.args.first().map(String::as_str) == Some("--version") {
                Ok(failed_output(127, ""))
            } else if spec.program == "sh" || spec.program == "powershell" {
                Ok(failed_output(1, "curl: (6) could not resolve host"))
            } else {
                panic!("later targets must not be attempted: {}", spec.display())
            }
        }));
        let (provisioner, mut rx) = provisioner_with(runner.clone(), config_for(temp.path()));

        let err = provisioner.ensure_all().await.unwrap_err();
        assert_eq!(err.target(), InstallTarget::PackageManager);
        assert!(err.to_string().contains("could not resolve host"));

        let progress = drain_progress(&mut rx);
        assert_eq!(
            progress,
            vec![
                (InstallTarget::PackageManager, ProgressPhase::Started),
                (InstallTarget::PackageManager, ProgressPhase::Failed),
            ]
        );
        // No venv or pip install command was ever issued.
        assert!(runner.calls().iter().all(|c| !c.contains("venv")));
        assert!(runner.calls().iter().all(|c| !c.contains("pip install")));
    }

    #[tokio::test]
    async fn fresh_machine_provisions_every_target_in_order() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = config_for(temp.path());
        let runtime_dir = config.runtime_dir.clone();

        let bootstrapped = Arc::new(Mutex::new(false));
        let installed: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let b = bootstrapped.clone();
        let i = installed.clone();
        let runner = Arc::new(FakeRunner::new(move |spec| -> Result<RunOutput, RunnerError> {
            let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
            match (spec.program.as_str(), args.as_slice()) {
                ("uv", ["--version"]) => {
                    if *b.lock() {
                        Ok(ok_output("uv 0.7.2"))
                    } else {
                        Ok(failed_output(127, ""))
                    }
                }
                ("sh", [_, script]) if script.contains("install.sh") => {
                    *b.lock() = true;
                    Ok(ok_output("downloading uv 0.7.2\ninstalling to ~/.local/bin"))
                }
                ("uv", ["venv", dir]) => {
                    // Simulate uv creating the interpreter marker.
                    let python = paths::runtime_python(std::path::Path::new(dir));
                    std::fs::create_dir_all(python.parent().unwrap()).unwrap();
                    std::fs::write(&python, "").unwrap();
                    Ok(ok_output("Creating virtual environment"))
                }
                ("uv", ["pip", "list"]) => {
                    let listing = i.lock().iter().cloned().collect::<Vec<_>>().join("\n");
                    Ok(ok_output(&listing))
                }
                ("uv", ["pip", "install", "--upgrade", package]) => {
                    i.lock().insert(format!("{package} 1.0.0"));
                    Ok(ok_output(&format!("Installed 1 package: {package}")))
                }
                _ => panic!("unexpected command: {}", spec.display()),
            }
        }));

        let (provisioner, mut rx) = provisioner_with(runner.clone(), config);
        provisioner.ensure_all().await.unwrap();

        assert!(paths::runtime_python(&runtime_dir).exists());

        // Installs happened in dependency order.
        let installs: Vec<String> = runner
            .calls()
            .into_iter()
            .filter(|c| c.contains("install.sh") || c.contains("venv") || c.contains("pip install"))
            .collect();
        assert!(installs[0].contains("install.sh"));
        assert!(installs[1].contains("venv"));
        assert!(installs[2].contains("roost-backend"));
        assert!(installs[3].contains("roost-tools"));

        // Every target reached a terminal Completed, none regressed.
        let progress = drain_progress(&mut rx);
        for target in InstallTarget::ALL {
            let phases: Vec<ProgressPhase> = progress
                .iter()
                .filter(|(t, _)| *t == target)
                .map(|(_, p)| *p)
                .collect();
            assert_eq!(phases.first(), Some(&ProgressPhase::Started), "{target}");
            assert_eq!(phases.last(), Some(&ProgressPhase::Completed), "{target}");
            let terminal = phases.iter().filter(|p| p.is_terminal()).count();
            assert_eq!(terminal, 1, "{target}");
        }
    }

    #[tokio::test]
    async fn bootstrap_that_lands_off_path_is_reported_as_failure() {
        let temp = tempfile::TempDir::new().unwrap();
        // Installer succeeds but the version re-check keeps failing.
        let runner = Arc::new(FakeRunner::new(|spec| {
            if spec.args.first().map(String::as_str) == Some("--version") {
                Ok(failed_output(127, ""))
            } else {
                Ok(ok_output("installed"))
            }
        }));
        let (provisioner, mut rx) = provisioner_with(runner, config_for(temp.path()));

        let err = provisioner.ensure(InstallTarget::PackageManager).await.unwrap_err();
        assert!(err.to_string().contains("still not on PATH"));

        let progress = drain_progress(&mut rx);
        assert_eq!(
            progress.last(),
            Some(&(InstallTarget::PackageManager, ProgressPhase::Failed))
        );
    }

    #[tokio::test]
    async fn streamed_installer_lines_become_log_and_progressing_events() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = config_for(temp.path());

        let python = paths::runtime_python(&config.runtime_dir);
        std::fs::create_dir_all(python.parent().unwrap()).unwrap();
        std::fs::write(&python, "").unwrap();

        let runner = Arc::new(FakeRunner::new(|spec| {
            let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
            match (spec.program.as_str(), args.as_slice()) {
                ("uv", ["--version"]) => Ok(ok_output("uv 0.7.2")),
                ("uv", ["pip", "list"]) => Ok(ok_output("")),
                ("uv", ["pip", "install", "--upgrade", _]) => Ok(ok_output(
                    "Resolved 4 packages in 210ms\n   noise 12%\nInstalled 4 packages in 1.2s",
                )),
                other => panic!("unexpected command: {other:?}"),
            }
        }));

        let (provisioner, mut rx) = provisioner_with(runner, config);
        provisioner.ensure(InstallTarget::BackendPackage).await.unwrap();

        let mut logs = 0;
        let mut progressing = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Log { .. } => logs += 1,
                Event::Progress {
                    phase: ProgressPhase::Progressing,
                    message,
                    ..
                } => progressing.push(message),
                _ => {}
            }
        }
        // Raw lines all reach the log stream; only summaries progress.
        assert_eq!(logs, 3);
        assert_eq!(
            progressing,
            vec![
                "Resolved 4 packages in 210ms".to_string(),
                "Installed 4 packages in 1.2s".to_string(),
            ]
        );
    }

    #[test]
    fn summarize_drops_noise_and_keeps_summaries() {
        assert_eq!(summarize_install_line(""), None);
        assert_eq!(summarize_install_line("   \t "), None);
        assert_eq!(summarize_install_line("\u{2588}\u{2588}\u{2588} 45/120"), None);
        assert_eq!(summarize_install_line("  12%"), None);
        assert_eq!(
            summarize_install_line("Resolved 12 packages in 1.02s"),
            Some("Resolved 12 packages in 1.02s".to_string())
        );
        assert_eq!(
            summarize_install_line("error: No solution found"),
            Some("error: No solution found".to_string())
        );
    }
}
