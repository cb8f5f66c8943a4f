use clap::{Parser, Subcommand, ValueEnum};
use roost_core::InstallTarget;

/// Roost - provision and supervise a backend service
#[derive(Parser)]
#[command(name = "roost")]
#[command(version)]
#[command(about = "Roost - provision and supervise a backend service")]
pub struct Cli {
    /// Unix socket path of the roost daemon
    #[arg(long, global = true, env = "ROOST_SOCKET")]
    pub socket: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show daemon, backend, and environment status
    Status,

    /// Install one provisioning target, or everything
    Install {
        /// Target to install; omit to install everything in order
        target: Option<TargetArg>,
    },

    /// Launch the backend process
    Launch {
        /// Block until the backend port accepts connections
        #[arg(long)]
        wait: bool,
    },

    /// Stop the backend process
    Stop,

    /// Check whether a TCP port accepts connections
    Port {
        /// Port to probe on loopback
        port: u16,
    },

    /// Stream daemon events to the terminal
    Watch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TargetArg {
    /// The package manager itself
    PackageManager,
    /// The isolated runtime directory
    Runtime,
    /// The backend service package
    Backend,
    /// The companion tools package
    Tools,
}

impl From<TargetArg> for InstallTarget {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::PackageManager => InstallTarget::PackageManager,
            TargetArg::Runtime => InstallTarget::Runtime,
            TargetArg::Backend => InstallTarget::BackendPackage,
            TargetArg::Tools => InstallTarget::ToolsPackage,
        }
    }
}
