//! Roost daemon protocol types for management socket communication
//!
//! These types are shared between the CLI and roost-daemon for
//! communication via the Unix management socket.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// One step of the provisioning chain.
///
/// Targets are fixed at compile time and processed strictly in the order
/// they are declared here: the package manager must exist before the
/// isolated runtime can be created, and the runtime must exist before
/// packages can be installed into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallTarget {
    /// The bootstrap tool (`uv`) used to create the runtime and install packages
    PackageManager,
    /// The isolated runtime directory (a virtualenv)
    Runtime,
    /// The package that provides the backend executable
    BackendPackage,
    /// The companion tooling package
    ToolsPackage,
}

impl InstallTarget {
    /// All targets in dependency order.
    pub const ALL: [InstallTarget; 4] = [
        InstallTarget::PackageManager,
        InstallTarget::Runtime,
        InstallTarget::BackendPackage,
        InstallTarget::ToolsPackage,
    ];
}

impl std::fmt::Display for InstallTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallTarget::PackageManager => write!(f, "package_manager"),
            InstallTarget::Runtime => write!(f, "runtime"),
            InstallTarget::BackendPackage => write!(f, "backend"),
            InstallTarget::ToolsPackage => write!(f, "tools"),
        }
    }
}

/// Phase of a provisioning step, as seen on the event stream.
///
/// For a given target within one provisioning run the phases are emitted
/// in the order `started` -> (`progressing`)* -> `completed` | `failed`,
/// and a target never regresses out of a terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Started,
    Progressing,
    Completed,
    Failed,
}

impl ProgressPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressPhase::Completed | ProgressPhase::Failed)
    }
}

impl std::fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressPhase::Started => write!(f, "started"),
            ProgressPhase::Progressing => write!(f, "progressing"),
            ProgressPhase::Completed => write!(f, "completed"),
            ProgressPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle state of the supervised backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    /// No process has been launched yet
    Idle,
    /// Launch requested, process not yet running
    Launching,
    /// Process is running
    Running,
    /// Graceful shutdown in progress
    Stopping,
    /// Process exited after a stop request
    Stopped,
    /// Process exited on its own (crash or clean exit)
    Exited,
}

impl BackendState {
    /// Whether a new launch is allowed from this state.
    pub fn can_launch(&self) -> bool {
        matches!(
            self,
            BackendState::Idle | BackendState::Stopped | BackendState::Exited
        )
    }
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendState::Idle => write!(f, "idle"),
            BackendState::Launching => write!(f, "launching"),
            BackendState::Running => write!(f, "running"),
            BackendState::Stopping => write!(f, "stopping"),
            BackendState::Stopped => write!(f, "stopped"),
            BackendState::Exited => write!(f, "exited"),
        }
    }
}

/// Which output stream of the backend a captured log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Asynchronous events pushed to subscribed connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Provisioning progress for one install target
    Progress {
        target: InstallTarget,
        phase: ProgressPhase,
        message: String,
    },

    /// One captured output line from the backend process
    Log { stream: LogStream, text: String },

    /// The backend process changed lifecycle state
    Backend {
        state: BackendState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Requests that can be sent to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    /// Query protocol version and capabilities.
    Hello { protocol_version: u32 },

    /// Provision a single install target
    Install { target: InstallTarget },

    /// Provision all targets in dependency order
    InstallAll,

    /// Launch the backend process
    Launch,

    /// Stop the backend process
    Stop,

    /// Check whether a TCP port accepts connections
    CheckPort { port: u16 },

    /// Block until a TCP port accepts connections or the wait expires
    WaitReady {
        port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_wait_secs: Option<u64>,
    },

    /// Get daemon and backend status
    Status,

    /// Turn this connection into a one-way event stream
    Subscribe,
}

/// Response from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Request succeeded
    Ok { data: serde_json::Value },

    /// Request failed
    Error { message: String },
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        Self::Ok {
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Ok { data } => Some(data),
            Self::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Ok { .. } => None,
            Self::Error { message } => Some(message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    pub protocol_version: u32,
    pub daemon_version: String,
    pub capabilities: Vec<String>,
}

/// Outcome of an install/launch/stop request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
}

impl ActionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Result of a one-shot TCP port check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortCheck {
    pub port: u16,
    pub is_ready: bool,
    pub message: String,
}

/// Result of a blocking readiness wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyReport {
    pub port: u16,
    pub is_ready: bool,
    pub waited_ms: u64,
    pub message: String,
}

/// Snapshot of the provisioning state of the machine.
///
/// Always computed fresh; external state can change between checks, so
/// this is never cached on either side of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub package_manager_present: bool,
    pub runtime_exists: bool,
    pub packages_installed: bool,
}

impl EnvironmentStatus {
    pub fn all_satisfied(&self) -> bool {
        self.package_manager_present && self.runtime_exists && self.packages_installed
    }
}

/// Daemon status response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub backend: BackendState,
    pub pid: Option<u32>,
    pub port: u16,
    pub environment: EnvironmentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<String>,
}
