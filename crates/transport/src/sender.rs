//! Sender client: converts one logical operation into remote calls
//!
//! `sync_file` is the core algorithm: checksum fast path, block diff,
//! ascending-offset block writes, truncate, chmod. A failure anywhere
//! aborts the current file; the transfer manager owns retry.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, info};

use mirsync_core::meta::{missing_blocks, permission_bits, read_file};
use mirsync_core::queue::Action;
use mirsync_core::{paths, scan, Checksum, SyncError};

use crate::ReceiverApi;

/// Counters for one `sync_file` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub blocks_sent: u64,
    pub bytes_sent: u64,
}

/// Drives sync for paths under one root against a receiver.
pub struct Sender<A> {
    root: PathBuf,
    /// Nominal block size; 0 derives it from each file's size.
    block_size: u64,
    remote: A,
}

impl<A: ReceiverApi> Sender<A> {
    #[must_use]
    pub fn new(root: PathBuf, block_size: u64, remote: A) -> Self {
        Self {
            root,
            block_size,
            remote,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn remote(&self) -> &A {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut A {
        &mut self.remote
    }

    /// Make the receiver's copy of `path` byte-identical to the local one.
    ///
    /// Block writes go out in ascending offset order, so an interrupted
    /// transfer leaves a prefix that matches the source. The trailing
    /// truncate trims leftovers from a previously longer remote file.
    ///
    /// # Errors
    /// Any failed step aborts the file; the caller decides retry.
    pub async fn sync_file(&mut self, path: &str) -> Result<SyncStats, SyncError> {
        let full = self.root.join(path);
        let mut stats = SyncStats::default();

        // Identity fast path: no block lists are ever materialized when the
        // whole-file checksums already agree.
        let local_checksum =
            Checksum::from_file(&full).map_err(|err| SyncError::from_io(path, err))?;
        match self.remote.get_file_checksum(path).await {
            Ok(remote_checksum) if remote_checksum == local_checksum => {
                debug!(path, "checksums match, nothing to transfer");
                return Ok(stats);
            }
            Ok(_) | Err(SyncError::NotFound(_)) | Err(SyncError::Io(_)) => {}
            Err(err) => return Err(err),
        }

        let mut local = read_file(&full, path, self.block_size)?;

        self.remote.touch(path).await?;

        if local.meta.size == 0 {
            // A remote that shrank to nothing may still hold stale bytes.
            self.remote.truncate_file(path, 0).await?;
            self.remote.chmod(path, local.meta.mode).await?;
            return Ok(stats);
        }

        let remote_meta = match self
            .remote
            .get_file_meta(path, local.meta.block_size)
            .await
        {
            Ok(meta) => Some(meta),
            Err(SyncError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };

        let missing = missing_blocks(&local.meta, remote_meta.as_ref());
        if !missing.is_empty() {
            info!(path, blocks = missing.len(), total = local.meta.num_blocks, "transferring");
        }

        for index in missing {
            let data = local.block_data(index)?;
            let offset = local.meta.blocks[index as usize].offset;
            stats.blocks_sent += 1;
            stats.bytes_sent += data.len() as u64;
            self.remote
                .write_file_block(path, offset, Bytes::from(data))
                .await?;
        }

        self.remote.truncate_file(path, local.meta.size).await?;
        self.remote.chmod(path, local.meta.mode).await?;

        Ok(stats)
    }

    /// Mirror one subtree inline: directories first, then every file.
    ///
    /// # Errors
    /// Stops at the first failed entry.
    pub async fn sync_directory(&mut self, path: &str) -> Result<(), SyncError> {
        let full = self.root.join(path);

        let metadata = std::fs::metadata(&full).map_err(|err| SyncError::from_io(path, err))?;
        self.create_directory(path, permission_bits(&metadata)).await?;

        for item in scan::scan_tree(&full)? {
            let relative = paths::strip_base(&self.root, &item.path)?;
            match item.action {
                Action::Mkdir => {
                    self.create_directory(&relative, item.mode.unwrap_or(0o755))
                        .await?;
                }
                Action::Write => {
                    self.sync_file(&relative).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Create an empty file on the receiver if nothing exists at `path`.
    ///
    /// # Errors
    /// Propagates the remote failure.
    pub async fn touch(&mut self, path: &str) -> Result<(), SyncError> {
        debug!(path, "touch");
        self.remote.touch(path).await
    }

    /// Apply permission bits on the receiver.
    ///
    /// # Errors
    /// Propagates the remote failure.
    pub async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), SyncError> {
        debug!(path, mode, "chmod");
        self.remote.chmod(path, mode).await
    }

    /// Create a directory (and parents) on the receiver.
    ///
    /// # Errors
    /// Propagates the remote failure.
    pub async fn create_directory(&mut self, path: &str, mode: u32) -> Result<(), SyncError> {
        debug!(path, mode, "mkdir");
        self.remote.create_directory(path, mode).await
    }

    /// Remove a file or directory tree on the receiver.
    ///
    /// # Errors
    /// Propagates the remote failure.
    pub async fn delete(&mut self, path: &str) -> Result<(), SyncError> {
        debug!(path, "delete");
        self.remote.delete(path).await
    }

    /// Rename on the receiver, replacing any existing target.
    ///
    /// # Errors
    /// Propagates the remote failure.
    pub async fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), SyncError> {
        debug!(old_path, new_path, "rename");
        self.remote.rename(old_path, new_path).await
    }
}
