mod cli;
mod client;
mod output;
mod paths;

use clap::Parser;
use cli::{Cli, Commands};
use client::{ClientError, DaemonClient};
use indicatif::{ProgressBar, ProgressStyle};
use roost_core::{Event, InstallTarget, ProgressPhase};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const READY_WAIT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let socket = cli
        .socket
        .clone()
        .unwrap_or_else(paths::default_socket_path);

    if let Err(e) = run(&socket, cli.command).await {
        output::error(e);
        std::process::exit(1);
    }
}

async fn run(socket: &str, command: Commands) -> Result<(), ClientError> {
    match command {
        Commands::Status => status(socket).await,
        Commands::Install { target } => install(socket, target.map(Into::into)).await,
        Commands::Launch { wait } => launch(socket, wait).await,
        Commands::Stop => stop(socket).await,
        Commands::Port { port } => check_port(socket, port).await,
        Commands::Watch => watch(socket).await,
    }
}

async fn status(socket: &str) -> Result<(), ClientError> {
    let mut client = DaemonClient::connect(socket).await?;
    let status = client.status().await?;

    println!("backend: {}", status.backend);
    if let Some(pid) = status.pid {
        output::field("pid", pid);
    }
    output::field("port", status.port);
    if let Some(last_exit) = &status.last_exit {
        output::field("last exit", last_exit);
    }

    let env = &status.environment;
    output::field("package manager", present(env.package_manager_present));
    output::field("runtime", present(env.runtime_exists));
    output::field("packages", present(env.packages_installed));
    if !env.all_satisfied() {
        output::muted("run 'roost install' to finish provisioning");
    }
    Ok(())
}

fn present(installed: bool) -> &'static str {
    if installed { "installed" } else { "missing" }
}

async fn install(socket: &str, target: Option<InstallTarget>) -> Result<(), ClientError> {
    // Separate subscription connection so progress streams while the
    // install request blocks until completion.
    let final_target = target.unwrap_or(InstallTarget::ALL[InstallTarget::ALL.len() - 1]);
    let feed = DaemonClient::connect(socket).await?.subscribe().await?;
    let mut progress_task = tokio::spawn(print_install_progress(feed, final_target));

    let mut client = DaemonClient::connect(socket).await?;
    let result = match target {
        Some(target) => client.install(target).await,
        None => client.install_all().await,
    };

    // The install response can beat the last progress lines across the
    // subscribe connection. Let the feed drain to its terminal event
    // before tearing it down.
    let _ = tokio::time::timeout(Duration::from_secs(2), &mut progress_task).await;
    progress_task.abort();

    let result = result?;
    if result.success {
        output::success(result.message);
        Ok(())
    } else {
        Err(ClientError::Daemon(result.message))
    }
}

/// Print progress events until the install chain reaches its end.
///
/// Returns after a failure anywhere or a completion of `final_target`,
/// so the caller can await the feed instead of cutting it off early.
async fn print_install_progress(mut feed: client::EventStream, final_target: InstallTarget) {
    while let Ok(Some(event)) = feed.next().await {
        if let Event::Progress {
            target,
            phase,
            message,
        } = event
        {
            match phase {
                ProgressPhase::Started => output::step(format!("{target}: {message}")),
                ProgressPhase::Progressing => output::muted(format!("  {message}")),
                ProgressPhase::Completed => output::success(format!("{target}: {message}")),
                ProgressPhase::Failed => output::error(format!("{target}: {message}")),
            }
            if ends_install_feed(phase, target, final_target) {
                return;
            }
        }
    }
}

fn ends_install_feed(
    phase: ProgressPhase,
    target: InstallTarget,
    final_target: InstallTarget,
) -> bool {
    phase == ProgressPhase::Failed
        || (phase == ProgressPhase::Completed && target == final_target)
}

async fn launch(socket: &str, wait: bool) -> Result<(), ClientError> {
    let mut client = DaemonClient::connect(socket).await?;
    let result = client.launch().await?;
    if !result.success {
        return Err(ClientError::Daemon(result.message));
    }
    output::success(&result.message);

    if !wait {
        return Ok(());
    }

    let port = client.status().await?.port;
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("waiting for port {port}"));
    spinner.enable_steady_tick(Duration::from_millis(80));

    // The daemon owns the poll loop; this blocks until ready or timeout.
    let report = client.wait_ready(port, READY_WAIT).await?;
    spinner.finish_and_clear();
    if report.is_ready {
        output::success(format!("backend is ready on port {port}"));
        Ok(())
    } else {
        Err(ClientError::Daemon(report.message))
    }
}

async fn stop(socket: &str) -> Result<(), ClientError> {
    let mut client = DaemonClient::connect(socket).await?;
    let result = client.stop().await?;
    if result.success {
        output::success(result.message);
        Ok(())
    } else {
        Err(ClientError::Daemon(result.message))
    }
}

async fn check_port(socket: &str, port: u16) -> Result<(), ClientError> {
    let mut client = DaemonClient::connect(socket).await?;
    let check = client.check_port(port).await?;
    if check.is_ready {
        output::success(check.message);
        Ok(())
    } else {
        Err(ClientError::Daemon(check.message))
    }
}

async fn watch(socket: &str) -> Result<(), ClientError> {
    let mut feed = DaemonClient::connect(socket).await?.subscribe().await?;
    output::muted("watching daemon events (ctrl-c to exit)");

    while let Some(event) = feed.next().await? {
        match event {
            Event::Progress {
                target,
                phase,
                message,
            } => println!("install {target} {phase}: {message}"),
            Event::Log { stream, text } => output::muted(format!("[{stream}] {text}")),
            Event::Backend { state, message } => match message {
                Some(message) => println!("backend {state}: {message}"),
                None => println!("backend {state}"),
            },
        }
    }
    output::warning("daemon closed the event stream");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_feed_ends_on_any_failure() {
        assert!(ends_install_feed(
            ProgressPhase::Failed,
            InstallTarget::PackageManager,
            InstallTarget::ToolsPackage,
        ));
    }

    #[test]
    fn install_feed_ends_only_when_the_final_target_completes() {
        assert!(!ends_install_feed(
            ProgressPhase::Completed,
            InstallTarget::Runtime,
            InstallTarget::ToolsPackage,
        ));
        assert!(!ends_install_feed(
            ProgressPhase::Progressing,
            InstallTarget::ToolsPackage,
            InstallTarget::ToolsPackage,
        ));
        assert!(ends_install_feed(
            ProgressPhase::Completed,
            InstallTarget::ToolsPackage,
            InstallTarget::ToolsPackage,
        ));
    }
}
