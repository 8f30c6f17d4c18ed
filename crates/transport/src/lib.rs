//! mirsync-transport: the link between sender and receiver
//!
//! The [`ReceiverApi`] trait is the seam: the sender client and transfer
//! manager are written against it, the TCP client implements it over the
//! wire, and [`LocalReceiver`] implements it in-process for tests.

use async_trait::async_trait;
use bytes::Bytes;

use mirsync_core::{Checksum, FileMeta, SyncError};

pub mod client;
pub mod local;
pub mod sender;
pub mod server;
pub mod transfer;

pub use client::RemoteReceiver;
pub use local::LocalReceiver;
pub use sender::{Sender, SyncStats};
pub use server::ReceiverService;
pub use transfer::TransferManager;

/// Remote filesystem operations exposed by the receiver.
///
/// All paths are root-relative '/'-separated wire paths.
#[async_trait]
pub trait ReceiverApi: Send {
    /// Whole-file checksum of the receiver's copy.
    async fn get_file_checksum(&mut self, path: &str) -> Result<Checksum, SyncError>;

    /// Block-level metadata of the receiver's copy, computed with the given
    /// block size.
    async fn get_file_meta(&mut self, path: &str, block_size: u64)
        -> Result<FileMeta, SyncError>;

    /// Positional write of one block. The receiver has flushed the bytes
    /// before this returns.
    async fn write_file_block(
        &mut self,
        path: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<(), SyncError>;

    /// Truncate (or zero-extend) to exactly `size`. Absent file is a no-op.
    async fn truncate_file(&mut self, path: &str, size: u64) -> Result<(), SyncError>;

    /// Create an empty file if and only if nothing exists at the path.
    async fn touch(&mut self, path: &str) -> Result<(), SyncError>;

    /// Set the low 9 permission bits.
    async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), SyncError>;

    /// Atomic rename; replaces the target if it exists.
    async fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), SyncError>;

    /// Unlink a file or recursively remove a directory.
    async fn delete(&mut self, path: &str) -> Result<(), SyncError>;

    /// `mkdir -p`, then chmod the target to `mode`.
    async fn create_directory(&mut self, path: &str, mode: u32) -> Result<(), SyncError>;

    /// Whether the link is currently usable.
    fn is_connected(&self) -> bool {
        true
    }

    /// Attempt to (re)establish the link.
    async fn reconnect(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
}
