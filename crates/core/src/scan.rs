//! Initial scan: enqueue the existing tree before watching starts
//!
//! Startup state and live deltas use the same queue path: every existing
//! directory becomes a MKDIR item and every file a WRITE item, and the
//! block-delta machinery decides per file whether anything actually moves.

use std::path::Path;

use ignore::WalkBuilder;

use crate::error::SyncError;
use crate::meta::permission_bits;
use crate::queue::{Action, QueueItem};

/// Walk `root` and produce items for everything under it.
///
/// Directories are emitted before their contents so the receiver can create
/// parents first. The root itself is not emitted. Symlinks and other
/// non-regular entries are outside the mirror contract and are skipped.
///
/// # Errors
/// Returns an error if traversal fails.
pub fn scan_tree(root: &Path) -> Result<Vec<QueueItem>, SyncError> {
    let mut items = Vec::new();

    // A mirror replicates everything: no gitignore semantics, no hidden-file
    // filtering. Sorting makes the order reproducible.
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(std::ffi::OsStr::cmp)
        .build();

    for entry in walker {
        let entry = entry.map_err(|err| SyncError::Io(std::io::Error::other(err)))?;
        let path = entry.path();
        if path == root {
            continue;
        }

        let Some(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            let mode = entry.metadata().ok().map(|m| permission_bits(&m));
            items.push(QueueItem {
                action: Action::Mkdir,
                path: path.to_path_buf(),
                rename_target: None,
                mode,
            });
        } else if file_type.is_file() {
            items.push(QueueItem::new(Action::Write, path));
        }
    }

    Ok(items)
}
