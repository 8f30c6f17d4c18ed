//! TCP RPC client for the receiver service

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use mirsync_core::protocol::{ProtocolReader, ProtocolWriter, Request, Response};
use mirsync_core::{Checksum, FileMeta, SyncError};

use crate::ReceiverApi;

struct Connection {
    reader: ProtocolReader<BufReader<OwnedReadHalf>>,
    writer: ProtocolWriter<OwnedWriteHalf>,
}

/// Client half of the wire protocol.
///
/// A transport failure leaves the client disconnected; the transfer
/// manager's connected-gate drives [`ReceiverApi::reconnect`].
pub struct RemoteReceiver {
    addr: String,
    timeout: Duration,
    conn: Option<Connection>,
}

impl RemoteReceiver {
    /// Connect to `addr`, failing fast if the receiver is unreachable.
    ///
    /// # Errors
    /// `Transport` if the connection cannot be established in time.
    pub async fn connect(addr: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let mut client = Self {
            addr: addr.into(),
            timeout,
            conn: None,
        };
        client.establish().await?;
        Ok(client)
    }

    async fn establish(&mut self) -> Result<(), SyncError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| SyncError::Transport(format!("connect to {} timed out", self.addr)))?
            .map_err(|err| SyncError::Transport(format!("connect to {}: {err}", self.addr)))?;

        // Block writes are small relative to the socket buffer; don't let
        // Nagle sit on them.
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        self.conn = Some(Connection {
            reader: ProtocolReader::new(BufReader::new(read_half)),
            writer: ProtocolWriter::new(write_half),
        });
        info!(addr = %self.addr, "connected");
        Ok(())
    }

    /// One request/response exchange under the ambient deadline.
    async fn call(&mut self, request: Request) -> Result<Response, SyncError> {
        let result = self.exchange(&request).await;
        if matches!(result, Err(SyncError::Transport(_))) {
            // The stream is in an unknown state mid-exchange; drop it and
            // let the connected-gate rebuild.
            self.conn = None;
            debug!(addr = %self.addr, "connection marked down");
        }
        result
    }

    async fn exchange(&mut self, request: &Request) -> Result<Response, SyncError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(SyncError::Transport(format!("not connected to {}", self.addr)));
        };

        tokio::time::timeout(self.timeout, async {
            conn.writer.write_request(request).await?;
            conn.reader.read_response().await
        })
        .await
        .map_err(|_| SyncError::Transport(format!("request to {} timed out", self.addr)))?
    }

    async fn call_empty(&mut self, request: Request) -> Result<(), SyncError> {
        match self.call(request).await? {
            Response::Empty => Ok(()),
            Response::Error { kind, transient, message } => {
                Err(SyncError::from_wire(kind, transient, message))
            }
            other => Err(SyncError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }
}

#[async_trait]
impl ReceiverApi for RemoteReceiver {
    async fn get_file_checksum(&mut self, path: &str) -> Result<Checksum, SyncError> {
        match self.call(Request::FileChecksum { path: path.into() }).await? {
            Response::FileChecksum { checksum } => Ok(checksum),
            Response::Error { kind, transient, message } => {
                Err(SyncError::from_wire(kind, transient, message))
            }
            other => Err(SyncError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    async fn get_file_meta(
        &mut self,
        path: &str,
        block_size: u64,
    ) -> Result<FileMeta, SyncError> {
        let request = Request::FileMeta { path: path.into(), block_size };
        match self.call(request).await? {
            Response::FileMeta(meta) => Ok(meta),
            Response::Error { kind, transient, message } => {
                Err(SyncError::from_wire(kind, transient, message))
            }
            other => Err(SyncError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    async fn write_file_block(
        &mut self,
        path: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<(), SyncError> {
        self.call_empty(Request::WriteFileBlock { path: path.into(), offset, data })
            .await
    }

    async fn truncate_file(&mut self, path: &str, size: u64) -> Result<(), SyncError> {
        self.call_empty(Request::TruncateFile { path: path.into(), size })
            .await
    }

    async fn touch(&mut self, path: &str) -> Result<(), SyncError> {
        self.call_empty(Request::Touch { path: path.into() }).await
    }

    async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), SyncError> {
        self.call_empty(Request::Chmod { path: path.into(), mode }).await
    }

    async fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), SyncError> {
        self.call_empty(Request::Rename {
            old_path: old_path.into(),
            new_path: new_path.into(),
        })
        .await
    }

    async fn delete(&mut self, path: &str) -> Result<(), SyncError> {
        self.call_empty(Request::Delete { path: path.into() }).await
    }

    async fn create_directory(&mut self, path: &str, mode: u32) -> Result<(), SyncError> {
        self.call_empty(Request::CreateDirectory { path: path.into(), mode })
            .await
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn reconnect(&mut self) -> Result<(), SyncError> {
        self.establish().await
    }
}
