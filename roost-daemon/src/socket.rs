//! Management socket for receiving commands from the roost CLI.
//!
//! Connections serve request/response pairs until the peer disconnects.
//! A `subscribe` request flips the connection into a one-way event feed;
//! from then on the daemon pushes every broadcast event down the wire and
//! accepts no further requests on that connection.

use roost_core::{Event, Request, Response};
use roost_socket::{read_message, write_message};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

/// Management socket server
pub struct SocketServer {
    path: PathBuf,
}

/// Remove a stale socket file and make sure the parent directory exists.
fn prepare_socket_path(path: &Path) -> Result<(), std::io::Error> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

impl SocketServer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Bind the socket and serve connections until the task is dropped.
    pub async fn run<F, Fut>(
        &self,
        events: broadcast::Sender<Event>,
        handler: F,
    ) -> Result<(), std::io::Error>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        prepare_socket_path(&self.path)?;

        let listener = UnixListener::bind(&self.path)?;
        tracing::info!("Management socket listening on {}", self.path.display());

        let handler = Arc::new(handler);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let handler = handler.clone();
                    let events = events.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, events, handler).await {
                            tracing::error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_connection<F, Fut>(
    stream: UnixStream,
    events: broadcast::Sender<Event>,
    handler: Arc<F>,
) -> Result<(), std::io::Error>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let request: Request = match read_message(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                let reply = Response::error(format!("invalid request: {e}"));
                write_message(&mut writer, &reply).await?;
                continue;
            }
            Err(e) => return Err(e),
        };
        tracing::debug!("Received request: {:?}", request);

        if matches!(request, Request::Subscribe) {
            // Acknowledge, then the connection carries events only.
            let receiver = events.subscribe();
            // Release this connection's sender so the channel can close
            // once every other sender is gone.
            drop(events);
            write_message(&mut writer, &Response::ok(serde_json::json!({ "subscribed": true })))
                .await?;
            return pump_events(receiver, writer).await;
        }

        let response = handler(request).await;
        write_message(&mut writer, &response).await?;
    }
}

async fn pump_events(
    mut receiver: broadcast::Receiver<Event>,
    mut writer: tokio::net::unix::OwnedWriteHalf,
) -> Result<(), std::io::Error> {
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if write_message(&mut writer, &event).await.is_err() {
                    // Subscriber went away.
                    return Ok(());
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Event subscriber lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
