//! JSONL framing over the Roost management socket.
//!
//! Every message is one JSON value on one line. The daemon serves
//! request/response pairs on a connection until the peer disconnects,
//! except for subscriptions, where the connection becomes a one-way
//! event feed.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Read one JSON message, bounded by `max_bytes`. Returns `None` on EOF.
pub async fn read_message_with_limit<R, T>(
    reader: &mut R,
    max_bytes: usize,
) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() > max_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message exceeds max length ({} > {})", buf.len(), max_bytes),
        ));
    }

    let s = std::str::from_utf8(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    serde_json::from_str::<T>(s)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Read one JSON message with the default size limit.
pub async fn read_message<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_message_with_limit(reader, DEFAULT_MAX_LINE_BYTES).await
}

/// Write one JSON message followed by a newline.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// Request/response client over a Unix stream socket.
#[derive(Debug)]
pub struct LineClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    pub fn new(stream: UnixStream) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    pub async fn connect(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::new(stream))
    }

    pub async fn send<T: Serialize>(&mut self, value: &T) -> std::io::Result<()> {
        write_message(&mut self.writer, value).await
    }

    /// Receive the next message; `None` means the daemon closed the connection.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> std::io::Result<Option<T>> {
        read_message(&mut self.reader).await
    }

    /// Send a request and wait for the single response to it.
    pub async fn request<Req, Resp>(&mut self, req: &Req) -> std::io::Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.send(req).await?;
        self.recv().await?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "daemon closed the connection before responding",
            )
        })
    }
}
