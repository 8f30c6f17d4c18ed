//! Pending-operation queue between the producers and the transfer manager
//!
//! Multi-producer (initial scan, change capture), single consumer. Items are
//! normalized to root-relative form when enqueued; out-of-root paths are
//! rejected before they ever reach the consumer. The bounded channel gives
//! FIFO ordering and explicit wakeups.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::paths;

/// Operation kind for a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Touch,
    Chmod,
    Write,
    Delete,
    Mkdir,
    Rename,
}

/// A pending operation on a single path.
///
/// Created with the absolute path the watcher or scanner observed; the path
/// is root-relative once the item is in the queue. `rename_target` stays
/// absolute until the transfer manager dispatches it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub action: Action,
    pub path: PathBuf,
    /// Destination path, only for [`Action::Rename`].
    pub rename_target: Option<PathBuf>,
    /// Permission bits, only where the action needs them.
    pub mode: Option<u32>,
}

impl QueueItem {
    /// Build an item with no rename target or mode.
    #[must_use]
    pub fn new(action: Action, path: impl Into<PathBuf>) -> Self {
        Self {
            action,
            path: path.into(),
            rename_target: None,
            mode: None,
        }
    }

    /// Build an item carrying permission bits.
    #[must_use]
    pub fn with_mode(action: Action, path: impl Into<PathBuf>, mode: u32) -> Self {
        Self {
            action,
            path: path.into(),
            rename_target: None,
            mode: Some(mode),
        }
    }

    /// Build a rename of `path` to `target`.
    #[must_use]
    pub fn rename(path: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            action: Action::Rename,
            path: path.into(),
            rename_target: Some(target.into()),
            mode: None,
        }
    }
}

/// Producer handle to the transfer queue.
#[derive(Clone)]
pub struct TransferQueue {
    root: PathBuf,
    tx: mpsc::Sender<QueueItem>,
}

impl TransferQueue {
    /// Create a queue rooted at `root`. The receiver half goes to the
    /// transfer manager.
    #[must_use]
    pub fn new(root: PathBuf, capacity: usize) -> (Self, mpsc::Receiver<QueueItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { root, tx }, rx)
    }

    /// Normalize the item's path and enqueue it.
    ///
    /// # Errors
    /// `Validation` without enqueueing if the path does not normalize under
    /// the root; `Transport` if the consumer is gone.
    pub async fn add(&self, mut item: QueueItem) -> Result<(), SyncError> {
        let relative = paths::strip_base(&self.root, &item.path)?;
        item.path = PathBuf::from(relative);

        self.tx
            .send(item)
            .await
            .map_err(|_| SyncError::Transport("transfer queue is closed".into()))
    }
}
