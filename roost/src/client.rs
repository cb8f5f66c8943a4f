//! Client for the roost daemon management socket.
//!
//! Each client performs a `hello` handshake on connect so protocol
//! mismatches surface immediately instead of as confusing per-command
//! failures.

use roost_core::{
    ActionResult, DaemonStatus, Event, InstallTarget, PROTOCOL_VERSION, PortCheck, ReadyReport,
    Request, Response,
};
use roost_socket::LineClient;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to roost-daemon at {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("unexpected daemon reply: {0}")]
    Protocol(String),
}

#[derive(Debug)]
pub struct DaemonClient {
    inner: LineClient,
}

impl DaemonClient {
    pub async fn connect(path: &str) -> Result<Self, ClientError> {
        let inner = LineClient::connect(path)
            .await
            .map_err(|source| ClientError::Connect {
                path: path.to_string(),
                source,
            })?;
        let mut client = Self { inner };
        client
            .request(Request::Hello {
                protocol_version: PROTOCOL_VERSION,
            })
            .await?;
        Ok(client)
    }

    /// Send a request and unwrap the daemon's response envelope.
    pub async fn request(&mut self, request: Request) -> Result<serde_json::Value, ClientError> {
        tracing::debug!(?request, "Sending request to daemon");
        let response: Response = self.inner.request(&request).await?;
        match response {
            Response::Ok { data } => Ok(data),
            Response::Error { message } => Err(ClientError::Daemon(message)),
        }
    }

    async fn request_as<T: DeserializeOwned>(
        &mut self,
        request: Request,
    ) -> Result<T, ClientError> {
        let data = self.request(request).await?;
        serde_json::from_value(data).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    pub async fn status(&mut self) -> Result<DaemonStatus, ClientError> {
        self.request_as(Request::Status).await
    }

    pub async fn install(&mut self, target: InstallTarget) -> Result<ActionResult, ClientError> {
        self.request_as(Request::Install { target }).await
    }

    pub async fn install_all(&mut self) -> Result<ActionResult, ClientError> {
        self.request_as(Request::InstallAll).await
    }

    pub async fn launch(&mut self) -> Result<ActionResult, ClientError> {
        self.request_as(Request::Launch).await
    }

    pub async fn stop(&mut self) -> Result<ActionResult, ClientError> {
        self.request_as(Request::Stop).await
    }

    pub async fn check_port(&mut self, port: u16) -> Result<PortCheck, ClientError> {
        self.request_as(Request::CheckPort { port }).await
    }

    /// Block on the daemon until the port accepts connections or
    /// `max_wait` elapses. The daemon does the polling.
    pub async fn wait_ready(
        &mut self,
        port: u16,
        max_wait: Duration,
    ) -> Result<ReadyReport, ClientError> {
        self.request_as(Request::WaitReady {
            port,
            max_wait_secs: Some(max_wait.as_secs()),
        })
        .await
    }

    /// Turn this connection into a one-way event stream.
    pub async fn subscribe(mut self) -> Result<EventStream, ClientError> {
        self.request(Request::Subscribe).await?;
        Ok(EventStream { inner: self.inner })
    }
}

/// One-way stream of daemon events after a subscribe.
pub struct EventStream {
    inner: LineClient,
}

impl EventStream {
    /// Next event; `None` when the daemon closes the connection.
    pub async fn next(&mut self) -> Result<Option<Event>, ClientError> {
        Ok(self.inner.recv().await?)
    }
}
