mod config;
mod defaults;
mod paths;
mod probe;
mod provision;
mod readiness;
mod runner;
mod signal;
mod socket;
mod supervisor;

use crate::config::{BackendConfig, RoostToml};
use crate::probe::Prober;
use crate::provision::Provisioner;
use crate::runner::SystemRunner;
use crate::socket::SocketServer;
use crate::supervisor::{StopOutcome, Supervisor};
use clap::Parser;
use roost_core::{
    ActionResult, DaemonStatus, Event, HelloResponse, PROTOCOL_VERSION, PortCheck, ReadyReport,
    Request, Response,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Roost Daemon - backend provisioning and process lifecycle
#[derive(Parser)]
#[command(name = "roost-daemon")]
#[command(version)]
#[command(about = "Roost Daemon - backend provisioning and process lifecycle")]
pub struct Args {
    /// Unix socket path for management commands
    #[arg(long)]
    pub socket: Option<String>,

    /// Data directory for the runtime and daemon state
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Path to roost.toml (defaults to <data-dir>/roost.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the backend port from the config file
    #[arg(long)]
    pub port: Option<u16>,
}

/// Daemon state shared across socket connections
pub struct DaemonState {
    config: BackendConfig,
    prober: Arc<Prober>,
    provisioner: Provisioner,
    supervisor: Supervisor,
}

impl DaemonState {
    pub fn new(config: BackendConfig, events: broadcast::Sender<Event>) -> Self {
        let runner = Arc::new(SystemRunner);
        let prober = Arc::new(Prober::new(runner.clone(), config.clone()));
        let provisioner = Provisioner::new(
            runner,
            prober.clone(),
            config.clone(),
            events.clone(),
        );
        let supervisor = Supervisor::new(config.clone(), events);
        Self {
            config,
            prober,
            provisioner,
            supervisor,
        }
    }

    /// Handle a request from the management socket
    pub async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Hello { protocol_version } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Response::error(format!(
                        "Protocol version mismatch: client={} daemon={}",
                        protocol_version, PROTOCOL_VERSION
                    ));
                }
                Response::ok(HelloResponse {
                    protocol_version: PROTOCOL_VERSION,
                    daemon_version: env!("CARGO_PKG_VERSION").to_string(),
                    capabilities: vec![
                        "install_streaming".to_string(),
                        "event_subscription".to_string(),
                        "port_check".to_string(),
                        "ready_wait".to_string(),
                    ],
                })
            }
            Request::Install { target } => match self.provisioner.ensure(target).await {
                Ok(()) => Response::ok(ActionResult::success(format!("{target} is ready"))),
                Err(e) => Response::ok(ActionResult::failure(e.to_string())),
            },
            Request::InstallAll => match self.provisioner.ensure_all().await {
                Ok(()) => Response::ok(ActionResult::success("environment is ready")),
                Err(e) => Response::ok(ActionResult::failure(e.to_string())),
            },
            Request::Launch => match self.supervisor.launch().await {
                Ok(pid) => {
                    Response::ok(ActionResult::success(format!("backend launched (pid {pid})")))
                }
                Err(e) => Response::ok(ActionResult::failure(e.to_string())),
            },
            Request::Stop => match self.supervisor.stop().await {
                Ok(StopOutcome::WasIdle) => {
                    Response::ok(ActionResult::success("backend was not running"))
                }
                Ok(StopOutcome::Graceful) => {
                    Response::ok(ActionResult::success("backend stopped"))
                }
                Ok(StopOutcome::Forced) => Response::ok(ActionResult::success(
                    "backend did not stop in time and was killed",
                )),
                Err(e) => Response::ok(ActionResult::failure(e.to_string())),
            },
            Request::CheckPort { port } => {
                let is_ready = readiness::check_port(port).await;
                let message = if is_ready {
                    format!("port {port} accepts connections")
                } else {
                    format!("port {port} is not accepting connections")
                };
                Response::ok(PortCheck {
                    port,
                    is_ready,
                    message,
                })
            }
            Request::WaitReady {
                port,
                max_wait_secs,
            } => {
                let max_wait = max_wait_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults::READY_MAX_WAIT);
                match readiness::wait_until_ready(port, max_wait, defaults::READY_POLL_INTERVAL)
                    .await
                {
                    Some(elapsed) => Response::ok(ReadyReport {
                        port,
                        is_ready: true,
                        waited_ms: elapsed.as_millis() as u64,
                        message: format!(
                            "port {port} became ready after {}ms",
                            elapsed.as_millis()
                        ),
                    }),
                    None => Response::ok(ReadyReport {
                        port,
                        is_ready: false,
                        waited_ms: max_wait.as_millis() as u64,
                        message: format!(
                            "port {port} did not become ready within {}s",
                            max_wait.as_secs()
                        ),
                    }),
                }
            }
            Request::Status => Response::ok(DaemonStatus {
                backend: self.supervisor.state(),
                pid: self.supervisor.pid(),
                port: self.config.port,
                environment: self.prober.status().await,
                last_exit: self.supervisor.last_exit(),
            }),
            // The socket layer intercepts subscriptions before dispatch.
            Request::Subscribe => Response::error("subscribe is handled per connection"),
        }
    }

    pub async fn shutdown(&self) {
        match self.supervisor.stop().await {
            Ok(StopOutcome::WasIdle) => {}
            Ok(outcome) => tracing::info!(?outcome, "Backend stopped during shutdown"),
            Err(e) => tracing::warn!("Failed to stop backend during shutdown: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let exe = std::env::current_exe().ok();

    let socket = args.socket.clone().unwrap_or_else(|| {
        if cfg!(debug_assertions)
            && let Some(exe) = &exe
            && let Some(p) = paths::debug_default_socket_from_exe(exe)
        {
            return p.to_string_lossy().to_string();
        }
        "/var/run/roost/roost.sock".to_string()
    });

    let data_dir_str = args.data_dir.clone().unwrap_or_else(|| {
        if cfg!(debug_assertions)
            && let Some(exe) = &exe
            && let Some(p) = paths::debug_default_data_dir_from_exe(exe)
        {
            return p.to_string_lossy().to_string();
        }
        "/var/lib/roost".to_string()
    });

    let data_dir = PathBuf::from(&data_dir_str);
    std::fs::create_dir_all(&data_dir)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join("roost.toml"));
    let mut toml = RoostToml::load(&config_path)?;
    if let Some(port) = args.port {
        toml.backend.port = port;
    }
    let config = toml.resolve(&data_dir);

    tracing::info!("Roost Daemon v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Socket: {}", socket);
    tracing::info!("Data directory: {}", data_dir_str);
    tracing::info!("Backend port: {}", config.port);
    tracing::info!("Runtime directory: {}", config.runtime_dir.display());

    let (events, _) = broadcast::channel::<Event>(256);
    let state = Arc::new(DaemonState::new(config, events.clone()));

    // Start management socket
    let socket_state = state.clone();
    let socket_path = socket.clone();
    let socket_events = events.clone();
    tokio::spawn(async move {
        let server = SocketServer::new(&socket_path);
        if let Err(e) = server
            .run(socket_events, move |request| {
                let state = socket_state.clone();
                async move { state.handle_request(request).await }
            })
            .await
        {
            tracing::error!("Socket server error: {}", e);
        }
    });

    wait_for_shutdown_signal().await;
    tracing::info!("Shutting down");
    state.shutdown().await;
    let _ = std::fs::remove_file(&socket);

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::{BackendState, InstallTarget};
    use tempfile::TempDir;

    fn state_for(temp: &TempDir) -> Arc<DaemonState> {
        let mut toml = RoostToml::default();
        toml.backend.runtime_dir = Some(temp.path().join("venv"));
        let (events, _) = broadcast::channel(64);
        Arc::new(DaemonState::new(toml.resolve(temp.path()), events))
    }

    #[tokio::test]
    async fn hello_rejects_mismatched_protocol_version() {
        let temp = TempDir::new().unwrap();
        let state = state_for(&temp);

        let reply = state
            .handle_request(Request::Hello {
                protocol_version: PROTOCOL_VERSION + 1,
            })
            .await;
        assert!(reply.error_message().unwrap().contains("mismatch"));

        let reply = state
            .handle_request(Request::Hello {
                protocol_version: PROTOCOL_VERSION,
            })
            .await;
        let hello: HelloResponse = serde_json::from_value(reply.data().unwrap().clone()).unwrap();
        assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
        assert!(hello.capabilities.contains(&"event_subscription".to_string()));
    }

    #[tokio::test]
    async fn status_reports_idle_backend_and_environment() {
        let temp = TempDir::new().unwrap();
        let state = state_for(&temp);

        let reply = state.handle_request(Request::Status).await;
        let status: DaemonStatus = serde_json::from_value(reply.data().unwrap().clone()).unwrap();
        assert_eq!(status.backend, BackendState::Idle);
        assert_eq!(status.pid, None);
        assert!(!status.environment.runtime_exists);
    }

    #[tokio::test]
    async fn launch_without_runtime_reports_failure_result() {
        let temp = TempDir::new().unwrap();
        let state = state_for(&temp);

        let reply = state.handle_request(Request::Launch).await;
        let result: ActionResult = serde_json::from_value(reply.data().unwrap().clone()).unwrap();
        assert!(!result.success);
        assert!(result.message.contains("not found"));
    }

    #[tokio::test]
    async fn stop_when_nothing_runs_succeeds() {
        let temp = TempDir::new().unwrap();
        let state = state_for(&temp);

        let reply = state.handle_request(Request::Stop).await;
        let result: ActionResult = serde_json::from_value(reply.data().unwrap().clone()).unwrap();
        assert!(result.success);
        assert!(result.message.contains("not running"));
    }

    #[tokio::test]
    async fn check_port_reflects_listener_presence() {
        let temp = TempDir::new().unwrap();
        let state = state_for(&temp);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let reply = state.handle_request(Request::CheckPort { port }).await;
        let check: PortCheck = serde_json::from_value(reply.data().unwrap().clone()).unwrap();
        assert!(check.is_ready);

        drop(listener);
        let reply = state.handle_request(Request::CheckPort { port }).await;
        let check: PortCheck = serde_json::from_value(reply.data().unwrap().clone()).unwrap();
        assert!(!check.is_ready);
    }

    #[tokio::test]
    async fn wait_ready_returns_once_port_is_listening() {
        let temp = TempDir::new().unwrap();
        let state = state_for(&temp);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let reply = state
            .handle_request(Request::WaitReady {
                port,
                max_wait_secs: Some(5),
            })
            .await;
        let report: ReadyReport = serde_json::from_value(reply.data().unwrap().clone()).unwrap();
        assert!(report.is_ready);
        assert_eq!(report.port, port);
    }

    #[tokio::test]
    async fn wait_ready_reports_timeout_for_silent_port() {
        let temp = TempDir::new().unwrap();
        let state = state_for(&temp);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let reply = state
            .handle_request(Request::WaitReady {
                port,
                max_wait_secs: Some(0),
            })
            .await;
        let report: ReadyReport = serde_json::from_value(reply.data().unwrap().clone()).unwrap();
        assert!(!report.is_ready);
        assert!(report.message.contains("did not become ready"));
    }

    #[tokio::test]
    async fn install_against_missing_tooling_reports_failure() {
        let temp = TempDir::new().unwrap();
        let mut toml = RoostToml::default();
        toml.backend.runtime_dir = Some(temp.path().join("venv"));
        // A package manager binary that cannot exist.
        toml.backend.package_manager = "roost-test-missing-pm".to_string();
        let (events, _) = broadcast::channel(64);
        let state = Arc::new(DaemonState::new(toml.resolve(temp.path()), events));

        let reply = state
            .handle_request(Request::Install {
                target: InstallTarget::Runtime,
            })
            .await;
        let result: ActionResult = serde_json::from_value(reply.data().unwrap().clone()).unwrap();
        assert!(!result.success);
    }
}
