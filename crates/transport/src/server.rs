//! Receiver service: executes filesystem mutations requested by the sender
//!
//! One task per inbound connection; frames on a connection are handled
//! serially, which preserves the ascending-offset ordering of block writes
//! within a file. The service keeps no state across connections; the target
//! tree is the only state.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mirsync_core::protocol::{ProtocolReader, ProtocolWriter, Request, Response};
use mirsync_core::{meta, paths, Checksum, SyncError};

/// Open write handles kept per connection.
const HANDLE_CACHE_CAPACITY: usize = 16;

/// Idle time after which a cached handle is closed.
const HANDLE_IDLE_CLOSE: Duration = Duration::from_secs(5);

/// Server side of the wire protocol, rooted at one directory.
pub struct ReceiverService {
    root: PathBuf,
    cancel: CancellationToken,
}

impl ReceiverService {
    #[must_use]
    pub fn new(root: PathBuf, cancel: CancellationToken) -> Self {
        Self { root, cancel }
    }

    /// Accept connections until cancelled.
    ///
    /// # Errors
    /// `Transport` if the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            let (stream, addr) =
                accepted.map_err(|err| SyncError::Transport(err.to_string()))?;
            info!(%addr, "sender connected");

            let root = self.root.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                match handle_connection(root, stream, cancel).await {
                    Ok(()) => debug!(%addr, "sender disconnected"),
                    Err(err) => warn!(%addr, %err, "connection ended"),
                }
            });
        }
    }
}

async fn handle_connection(
    root: PathBuf,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<(), SyncError> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = ProtocolReader::new(BufReader::new(read_half));
    let mut writer = ProtocolWriter::new(write_half);
    let mut handler = ConnectionHandler::new(root);

    loop {
        let request = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            request = reader.read_request() => match request {
                Ok(request) => request,
                // The sender hung up; a torn frame and a clean close look
                // the same from here.
                Err(SyncError::Transport(_)) => return Ok(()),
                Err(err) => return Err(err),
            },
        };

        let response = match handler.handle(&request) {
            Ok(response) => response,
            Err(err) => {
                debug!(%err, "request failed");
                Response::from_error(&err)
            }
        };
        writer.write_response(&response).await?;
    }
}

/// Per-connection request dispatcher over one root directory.
pub(crate) struct ConnectionHandler {
    root: PathBuf,
    handles: HandleCache,
}

impl ConnectionHandler {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            root,
            handles: HandleCache::default(),
        }
    }

    /// Execute one request against the tree.
    pub(crate) fn handle(&mut self, request: &Request) -> Result<Response, SyncError> {
        let now = Instant::now();
        self.handles.sweep_idle(now);

        match request {
            Request::FileChecksum { path } => {
                let full = self.resolve(path)?;
                let checksum = Checksum::from_file(&full)
                    .map_err(|err| SyncError::from_io(path, err))?;
                Ok(Response::FileChecksum { checksum })
            }

            Request::FileMeta { path, block_size } => {
                let full = self.resolve(path)?;
                let local = meta::read_file(&full, path, *block_size)?;
                Ok(Response::FileMeta(local.into_meta()))
            }

            Request::WriteFileBlock { path, offset, data } => {
                let full = self.resolve(path)?;
                let file = self.handles.get_or_open(&full, now)?;
                file.seek(SeekFrom::Start(*offset))?;
                file.write_all(data)?;
                // The OK frame must not outrun the bytes.
                file.sync_data()?;
                Ok(Response::Empty)
            }

            Request::TruncateFile { path, size } => {
                let full = self.resolve(path)?;
                self.handles.invalidate(&full);
                match OpenOptions::new().write(true).open(&full) {
                    Ok(file) => {
                        file.set_len(*size)?;
                        file.sync_data()?;
                    }
                    // Truncating a file that never made it is a no-op.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                Ok(Response::Empty)
            }

            Request::Touch { path } => {
                let full = self.resolve(path)?;
                match new_file_options().create_new(true).open(&full) {
                    Ok(_) => {}
                    // An existing entry must be left untouched.
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(err) => return Err(err.into()),
                }
                Ok(Response::Empty)
            }

            Request::Chmod { path, mode } => {
                let full = self.resolve(path)?;
                set_permission_bits(&full, *mode).map_err(|err| SyncError::from_io(path, err))?;
                Ok(Response::Empty)
            }

            Request::Rename { old_path, new_path } => {
                let old_full = self.resolve(old_path)?;
                let new_full = self.resolve(new_path)?;
                self.handles.invalidate(&old_full);
                self.handles.invalidate(&new_full);
                std::fs::rename(&old_full, &new_full)
                    .map_err(|err| SyncError::from_io(old_path, err))?;
                Ok(Response::Empty)
            }

            Request::Delete { path } => {
                let full = self.resolve(path)?;
                self.handles.invalidate(&full);
                let result = match std::fs::metadata(&full) {
                    Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(&full),
                    Ok(_) => std::fs::remove_file(&full),
                    Err(err) => Err(err),
                };
                match result {
                    Ok(()) => {}
                    // The queue may carry a delete for an already-gone path.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                Ok(Response::Empty)
            }

            Request::CreateDirectory { path, mode } => {
                let full = self.resolve(path)?;
                std::fs::create_dir_all(&full)?;
                set_permission_bits(&full, *mode)?;
                Ok(Response::Empty)
            }
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SyncError> {
        paths::resolve(&self.root, path)
    }

    #[cfg(test)]
    fn cached_handles(&self) -> usize {
        self.handles.entries.len()
    }
}

fn new_file_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options
}

fn set_permission_bits(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

struct CachedHandle {
    file: File,
    last_used: Instant,
}

/// Small LRU of open write handles, keyed by path.
///
/// Saves an open/close per block on multi-block files while keeping the
/// flush-before-ACK contract: the writer syncs after every block, so a
/// cached handle never holds unacknowledged bytes.
#[derive(Default)]
struct HandleCache {
    entries: HashMap<PathBuf, CachedHandle>,
}

impl HandleCache {
    fn get_or_open(&mut self, path: &Path, now: Instant) -> std::io::Result<&mut File> {
        if !self.entries.contains_key(path) && self.entries.len() >= HANDLE_CACHE_CAPACITY {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, handle)| handle.last_used)
                .map(|(path, _)| path.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }

        match self.entries.entry(path.to_path_buf()) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                let handle = entry.into_mut();
                handle.last_used = now;
                Ok(&mut handle.file)
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let file = new_file_options().create(true).open(path)?;
                let handle = entry.insert(CachedHandle { file, last_used: now });
                Ok(&mut handle.file)
            }
        }
    }

    /// Drop the handle for a path whose identity is about to change.
    fn invalidate(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    fn sweep_idle(&mut self, now: Instant) {
        self.entries
            .retain(|_, handle| now.duration_since(handle.last_used) < HANDLE_IDLE_CLOSE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn handler(dir: &TempDir) -> ConnectionHandler {
        ConnectionHandler::new(dir.path().to_path_buf())
    }

    fn write_block(h: &mut ConnectionHandler, path: &str, offset: u64, data: &[u8]) {
        let response = h
            .handle(&Request::WriteFileBlock {
                path: path.into(),
                offset,
                data: Bytes::copy_from_slice(data),
            })
            .unwrap();
        assert!(matches!(response, Response::Empty));
    }

    #[test]
    fn touch_creates_once_and_preserves_contents() {
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        h.handle(&Request::Touch { path: "a.txt".into() }).unwrap();
        assert!(dir.path().join("a.txt").exists());

        std::fs::write(dir.path().join("a.txt"), b"keep me").unwrap();
        h.handle(&Request::Touch { path: "a.txt".into() }).unwrap();
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"keep me");
    }

    #[test]
    fn block_writes_land_at_their_offsets() {
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        write_block(&mut h, "f.bin", 0, b"AAAA");
        write_block(&mut h, "f.bin", 4, b"BBBB");
        write_block(&mut h, "f.bin", 8, b"CC");

        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), b"AAAABBBBCC");
    }

    #[cfg(unix)]
    #[test]
    fn block_write_creates_with_default_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);
        write_block(&mut h, "f.bin", 0, b"x");

        let mode = std::fs::metadata(dir.path().join("f.bin"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn truncate_trims_and_tolerates_absent() {
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        write_block(&mut h, "f.bin", 0, b"AAAABBBB");
        h.handle(&Request::TruncateFile { path: "f.bin".into(), size: 4 })
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), b"AAAA");

        // No file, no problem.
        h.handle(&Request::TruncateFile { path: "ghost".into(), size: 0 })
            .unwrap();
        assert!(!dir.path().join("ghost").exists());
    }

    #[test]
    fn write_after_truncate_reopens_the_file() {
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        write_block(&mut h, "f.bin", 0, b"AAAABBBB");
        h.handle(&Request::TruncateFile { path: "f.bin".into(), size: 4 })
            .unwrap();
        write_block(&mut h, "f.bin", 4, b"CCCC");

        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), b"AAAACCCC");
    }

    #[cfg(unix)]
    #[test]
    fn chmod_sets_low_nine_bits() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        write_block(&mut h, "f", 0, b"x");
        h.handle(&Request::Chmod { path: "f".into(), mode: 0o600 }).unwrap();

        let mode = std::fs::metadata(dir.path().join("f")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn rename_replaces_target() {
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        std::fs::write(dir.path().join("old"), b"new contents").unwrap();
        std::fs::write(dir.path().join("new"), b"stale").unwrap();

        h.handle(&Request::Rename { old_path: "old".into(), new_path: "new".into() })
            .unwrap();

        assert!(!dir.path().join("old").exists());
        assert_eq!(std::fs::read(dir.path().join("new")).unwrap(), b"new contents");
    }

    #[test]
    fn rename_of_missing_source_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        let err = h
            .handle(&Request::Rename { old_path: "ghost".into(), new_path: "n".into() })
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn delete_handles_files_directories_and_absent() {
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        std::fs::write(dir.path().join("f"), b"x").unwrap();
        h.handle(&Request::Delete { path: "f".into() }).unwrap();
        assert!(!dir.path().join("f").exists());

        std::fs::create_dir_all(dir.path().join("d/sub")).unwrap();
        std::fs::write(dir.path().join("d/sub/f"), b"x").unwrap();
        h.handle(&Request::Delete { path: "d".into() }).unwrap();
        assert!(!dir.path().join("d").exists());

        // Already gone is fine.
        h.handle(&Request::Delete { path: "f".into() }).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn mkdir_creates_parents_and_applies_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        h.handle(&Request::CreateDirectory { path: "a/b/c".into(), mode: 0o700 })
            .unwrap();

        let target = dir.path().join("a/b/c");
        assert!(target.is_dir());
        let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        for path in ["../evil", "/etc/passwd", "a/../../b", ""] {
            let err = h.handle(&Request::Touch { path: path.into() }).unwrap_err();
            assert!(matches!(err, SyncError::Validation(_)), "{path} should be rejected");
        }
    }

    #[test]
    fn checksum_and_meta_of_absent_file_are_not_found() {
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        assert!(matches!(
            h.handle(&Request::FileChecksum { path: "ghost".into() }),
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(
            h.handle(&Request::FileMeta { path: "ghost".into(), block_size: 4 }),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn meta_matches_local_computation() {
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        std::fs::write(dir.path().join("t"), b"AAAABBBBCCCCDDDDEEE").unwrap();

        let response = h
            .handle(&Request::FileMeta { path: "t".into(), block_size: 4 })
            .unwrap();
        let Response::FileMeta(remote) = response else {
            panic!("expected file meta");
        };

        assert_eq!(remote.num_blocks, 5);
        assert_eq!(remote.checksum.to_hex(), "7f0a7164fcaaadb4559d0f842bb35dd3");
    }

    #[test]
    fn handle_cache_stays_bounded() {
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);

        for i in 0..(HANDLE_CACHE_CAPACITY + 8) {
            write_block(&mut h, &format!("f{i}"), 0, b"x");
        }

        assert!(h.cached_handles() <= HANDLE_CACHE_CAPACITY);
    }
}
