//! Block model: chunking, hashing, and fixed-alignment delta computation
//!
//! A file is split into `block_size`-sized chunks at fixed offsets; block `i`
//! always covers `[i * block_size, (i + 1) * block_size)`. Diffing compares
//! checksums at matching indexes, which wins on append and in-place edit but
//! not on interior insert/delete. The whole-file checksum is computed by an
//! independent streaming pass so identical files can be detected without
//! enumerating blocks.

use std::fs::{File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::checksum::Checksum;
use crate::error::SyncError;

/// Hard cap on the nominal block size. Keeps a single block payload
/// comfortably below the 4 MiB frame limit.
pub const MAX_BLOCK_SIZE: u64 = 1_024_000;

/// A contiguous byte range of a regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// 0-based position in the block chain.
    pub index: u64,
    /// Byte offset where the range begins.
    pub offset: u64,
    /// Length in bytes; equals the file's block size except for the last block.
    pub size: u64,
    pub checksum: Checksum,
}

/// Metadata describing a regular file for the purpose of diffing.
#[derive(Debug, Clone)]
pub struct FileMeta {
    /// Path relative to the sync root, '/'-separated.
    pub path: String,
    /// Low 9 permission bits.
    pub mode: u32,
    pub size: u64,
    pub block_size: u64,
    pub num_blocks: u64,
    pub blocks: Vec<Block>,
    /// Whole-file checksum, independent of the block checksums.
    pub checksum: Checksum,
}

/// A file opened for reading together with its metadata.
///
/// Keeps the read handle so block data can be fetched positionally without
/// reopening the file between blocks.
#[derive(Debug)]
pub struct LocalFile {
    pub meta: FileMeta,
    handle: File,
}

impl LocalFile {
    /// Read exactly `blocks[index].size` bytes at `blocks[index].offset`.
    ///
    /// # Errors
    /// `Validation` if `index` is out of range; `Io` (unexpected EOF) if the
    /// file shrank and the read comes up short.
    pub fn block_data(&mut self, index: u64) -> Result<Vec<u8>, SyncError> {
        let Some(block) = self.meta.blocks.get(index as usize) else {
            return Err(SyncError::Validation(format!(
                "block {index} out of range for {} ({} blocks)",
                self.meta.path, self.meta.num_blocks
            )));
        };

        let mut buf = vec![0u8; block.size as usize];
        self.handle.seek(SeekFrom::Start(block.offset))?;
        self.handle.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Consume the handle, keeping only the metadata.
    #[must_use]
    pub fn into_meta(self) -> FileMeta {
        self.meta
    }
}

/// Pick the block size for a file.
///
/// `requested == 0` selects 10% of the file size, capped at
/// [`MAX_BLOCK_SIZE`]. A file smaller than the chosen size gets a single
/// block covering the whole file. Never returns zero.
#[must_use]
pub fn effective_block_size(file_size: u64, requested: u64) -> u64 {
    let mut block_size = if requested > 0 {
        requested
    } else {
        let tenth = (file_size as f64 / 100.0 * 10.0).ceil() as u64;
        tenth.min(MAX_BLOCK_SIZE)
    };

    if file_size > 0 && file_size <= block_size {
        block_size = file_size;
    }

    block_size.max(1)
}

/// Extract the low 9 permission bits from file metadata.
#[must_use]
pub fn permission_bits(metadata: &Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o777
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0o644
    }
}

/// Open `path`, hash the whole file, then hash each block.
///
/// `logical_path` is the root-relative '/'-separated name recorded in the
/// returned metadata. `block_size == 0` selects the default size.
///
/// # Errors
/// `NotFound` if the file is absent, `Io` on any other stat/open/read failure.
pub fn read_file(path: &Path, logical_path: &str, block_size: u64) -> Result<LocalFile, SyncError> {
    let metadata =
        std::fs::metadata(path).map_err(|err| SyncError::from_io(logical_path, err))?;
    let size = metadata.len();
    let mode = permission_bits(&metadata);

    let block_size = effective_block_size(size, block_size);
    let num_blocks = if size == 0 { 0 } else { size.div_ceil(block_size) };

    let mut handle = File::open(path).map_err(|err| SyncError::from_io(logical_path, err))?;
    let checksum = Checksum::from_reader(&mut handle)?;
    handle.seek(SeekFrom::Start(0))?;

    let mut blocks = Vec::with_capacity(num_blocks as usize);
    let mut buf = vec![0u8; block_size as usize];
    for index in 0..num_blocks {
        let offset = index * block_size;
        let len = block_size.min(size - offset) as usize;
        handle.read_exact(&mut buf[..len])?;
        blocks.push(Block {
            index,
            offset,
            size: len as u64,
            checksum: Checksum::from_bytes(&buf[..len]),
        });
    }

    Ok(LocalFile {
        meta: FileMeta {
            path: logical_path.to_string(),
            mode,
            size,
            block_size,
            num_blocks,
            blocks,
            checksum,
        },
        handle,
    })
}

/// Block indexes the receiver must be sent so its copy matches `local`.
///
/// `None` means the remote file is absent: every block is missing. A remote
/// that is empty or has more bytes than the local file signals divergent
/// history that per-index matching cannot reconcile, so the whole file is
/// rewritten and later truncated. Otherwise blocks at matching indexes are
/// compared and the local tail appended. The result is in ascending order.
#[must_use]
pub fn missing_blocks(local: &FileMeta, remote: Option<&FileMeta>) -> Vec<u64> {
    let Some(remote) = remote else {
        return (0..local.num_blocks).collect();
    };

    if remote.checksum == local.checksum {
        return Vec::new();
    }

    if remote.size == 0 || remote.size > local.size {
        return (0..local.num_blocks).collect();
    }

    let shared = local.num_blocks.min(remote.num_blocks) as usize;
    let mut missing = Vec::new();
    for i in 0..shared {
        if local.blocks[i].checksum != remote.blocks[i].checksum {
            missing.push(i as u64);
        }
    }
    missing.extend(remote.num_blocks..local.num_blocks);
    missing
}
