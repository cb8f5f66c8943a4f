//! Environment prober - answers yes/no readiness questions about the
//! machine's provisioning state.
//!
//! Probes have no side effects and are re-executed on every call; a
//! snapshot is never cached because external state (a manual uninstall,
//! a deleted venv) can change between checks. A check command that cannot
//! run at all means "not installed", never an error.

use roost_core::EnvironmentStatus;
use roost_core::InstallTarget;
use std::sync::Arc;

use crate::config::BackendConfig;
use crate::paths;
use crate::runner::{CommandRunner, CommandSpec};

pub struct Prober {
    runner: Arc<dyn CommandRunner>,
    config: BackendConfig,
}

impl Prober {
    pub fn new(runner: Arc<dyn CommandRunner>, config: BackendConfig) -> Self {
        Self { runner, config }
    }

    /// Is the bootstrap tool on the (enhanced) PATH?
    pub async fn has_package_manager(&self) -> bool {
        let spec = CommandSpec::new(&self.config.package_manager)
            .arg("--version")
            .env("PATH", paths::enhanced_path());
        match self.runner.run(&spec).await {
            Ok(output) => output.success,
            Err(_) => false,
        }
    }

    /// Does the isolated runtime exist? The runtime's interpreter is the
    /// marker; a directory without it is a half-created runtime and counts
    /// as absent.
    pub async fn runtime_exists(&self) -> bool {
        paths::runtime_python(&self.config.runtime_dir).exists()
    }

    /// Is a single package installed into the runtime?
    pub async fn package_installed(&self, package: &str) -> bool {
        let spec = CommandSpec::new(&self.config.package_manager)
            .args(["pip", "list"])
            .env("PATH", paths::enhanced_path())
            .env(
                "VIRTUAL_ENV",
                self.config.runtime_dir.to_string_lossy().to_string(),
            );
        match self.runner.run(&spec).await {
            Ok(output) => output.success && output.stdout.contains(package),
            Err(_) => false,
        }
    }

    /// Are both required packages installed?
    pub async fn packages_installed(&self) -> bool {
        for package in self.config.packages() {
            if !self.package_installed(package).await {
                return false;
            }
        }
        true
    }

    /// Fresh snapshot of all three statuses.
    pub async fn status(&self) -> EnvironmentStatus {
        EnvironmentStatus {
            package_manager_present: self.has_package_manager().await,
            runtime_exists: self.runtime_exists().await,
            packages_installed: self.packages_installed().await,
        }
    }

    /// Is one install target already satisfied?
    pub async fn satisfied(&self, target: InstallTarget) -> bool {
        match target {
            InstallTarget::PackageManager => self.has_package_manager().await,
            InstallTarget::Runtime => self.runtime_exists().await,
            InstallTarget::BackendPackage => {
                self.package_installed(&self.config.backend_package).await
            }
            InstallTarget::ToolsPackage => self.package_installed(&self.config.tools_package).await,
        }
    }
}
