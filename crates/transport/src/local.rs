//! In-process receiver for testing
//!
//! Runs the same request dispatcher the TCP service uses, directly against
//! a local directory. Sender logic can be exercised without a socket while
//! keeping exactly the receiver's filesystem semantics.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;

use mirsync_core::protocol::{Request, Response};
use mirsync_core::{Checksum, FileMeta, SyncError};

use crate::server::ConnectionHandler;
use crate::ReceiverApi;

/// Local receiver operating on a directory in this process.
pub struct LocalReceiver {
    handler: ConnectionHandler,
}

impl LocalReceiver {
    /// Create a receiver rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    /// Returns an error if the root cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            handler: ConnectionHandler::new(root),
        })
    }

    fn expect_empty(&mut self, request: &Request) -> Result<(), SyncError> {
        match self.handler.handle(request)? {
            Response::Empty => Ok(()),
            other => Err(SyncError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }
}

#[async_trait]
impl ReceiverApi for LocalReceiver {
    async fn get_file_checksum(&mut self, path: &str) -> Result<Checksum, SyncError> {
        match self.handler.handle(&Request::FileChecksum { path: path.into() })? {
            Response::FileChecksum { checksum } => Ok(checksum),
            other => Err(SyncError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    async fn get_file_meta(
        &mut self,
        path: &str,
        block_size: u64,
    ) -> Result<FileMeta, SyncError> {
        let request = Request::FileMeta { path: path.into(), block_size };
        match self.handler.handle(&request)? {
            Response::FileMeta(meta) => Ok(meta),
            other => Err(SyncError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    async fn write_file_block(
        &mut self,
        path: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<(), SyncError> {
        self.expect_empty(&Request::WriteFileBlock { path: path.into(), offset, data })
    }

    async fn truncate_file(&mut self, path: &str, size: u64) -> Result<(), SyncError> {
        self.expect_empty(&Request::TruncateFile { path: path.into(), size })
    }

    async fn touch(&mut self, path: &str) -> Result<(), SyncError> {
        self.expect_empty(&Request::Touch { path: path.into() })
    }

    async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), SyncError> {
        self.expect_empty(&Request::Chmod { path: path.into(), mode })
    }

    async fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), SyncError> {
        self.expect_empty(&Request::Rename {
            old_path: old_path.into(),
            new_path: new_path.into(),
        })
    }

    async fn delete(&mut self, path: &str) -> Result<(), SyncError> {
        self.expect_empty(&Request::Delete { path: path.into() })
    }

    async fn create_directory(&mut self, path: &str, mode: u32) -> Result<(), SyncError> {
        self.expect_empty(&Request::CreateDirectory { path: path.into(), mode })
    }
}
