//! CLI-side IPC client for communicating with the daemon

use tokio::io::{ReadHalf, WriteHalf};

use crate::common::{error::IpcError, Error, Result};

use super::protocol::{Command, PushMessage, Request, Response};
use super::transport::{self, Stream};

/// Client for communicating with the bridge daemon
pub struct DaemonClient {
    reader: ReadHalf<Stream>,
    writer: WriteHalf<Stream>,
    next_id: u64,
}

impl DaemonClient {
    /// Connect to the running daemon
    pub async fn connect() -> Result<Self> {
        let stream = transport::connect().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound
                || e.kind() == std::io::ErrorKind::ConnectionRefused
            {
                Error::DaemonNotRunning
            } else {
                Error::DaemonConnectionFailed(e)
            }
        })?;

        let (reader, writer) = tokio::io::split(stream);

        Ok(Self {
            reader,
            writer,
            next_id: 1,
        })
    }

    /// Send a command and wait for the response
    pub async fn send_command(&mut self, command: Command) -> Result<serde_json::Value> {
        let id = self.next_id;
        self.next_id += 1;

        transport::send_json(&mut self.writer, &Request { id, command })
            .await
            .map_err(|e| Error::DaemonCommunication(e.to_string()))?;

        let response: Response = transport::recv_json(&mut self.reader)
            .await
            .map_err(|e| Error::DaemonCommunication(e.to_string()))?;

        if response.id != id {
            return Err(Error::DaemonCommunication(format!(
                "Response ID mismatch: expected {}, got {}",
                id, response.id
            )));
        }

        if response.success {
            Ok(response.result.unwrap_or(serde_json::json!({})))
        } else {
            let error = response.error.unwrap_or_else(|| IpcError {
                code: "UNKNOWN".to_string(),
                message: "Unknown error".to_string(),
            });
            Err(error.into())
        }
    }

    /// Turn this connection into a push channel
    ///
    /// The first message received is always a snapshot.
    pub async fn subscribe(mut self) -> Result<Observer> {
        self.send_command(Command::Subscribe).await?;
        Ok(Observer {
            reader: self.reader,
            _writer: self.writer,
        })
    }

    /// Check if daemon is responding
    pub async fn ping(&mut self) -> Result<bool> {
        match self.send_command(Command::Status).await {
            Ok(_) => Ok(true),
            Err(Error::DaemonNotRunning) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Receiving end of the push channel
pub struct Observer {
    reader: ReadHalf<Stream>,
    /// Dropping the write half would look like a disconnect
    _writer: WriteHalf<Stream>,
}

impl Observer {
    /// Next pushed message; `None` once the daemon closes the channel
    pub async fn next(&mut self) -> Result<Option<PushMessage>> {
        match transport::recv_json(&mut self.reader).await {
            Ok(message) => Ok(Some(message)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(Error::DaemonCommunication(e.to_string())),
        }
    }
}
