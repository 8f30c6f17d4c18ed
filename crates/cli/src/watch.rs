//! Wire the notification backend into the change-capture adapter
//!
//! `notify` delivers raw events on its own thread; they are forwarded into
//! the async loop, reduced to the five event kinds the adapter understands,
//! and translated into queue items. The loop also owns the clock for the
//! pending-rename grace window.

use std::path::PathBuf;
use std::time::Instant;

use notify::event::{MetadataKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mirsync_core::events::{ChangeCapture, FsEvent, FsEventKind};
use mirsync_core::queue::TransferQueue;
use mirsync_core::SyncError;

/// Watch `root` recursively and feed the transfer queue until cancelled.
pub async fn run(
    root: PathBuf,
    queue: TransferQueue,
    cancel: CancellationToken,
) -> Result<(), SyncError> {
    let (tx, mut rx) = mpsc::channel::<Event>(256);

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                // Dropped events on overflow surface later as checksum
                // mismatches and are repaired by the next write to the file.
                let _ = tx.blocking_send(event);
            }
            Err(err) => warn!(%err, "watch backend error"),
        }
    })
    .map_err(watch_error)?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(watch_error)?;
    debug!(root = %root.display(), "watching");

    let mut capture = ChangeCapture::new();

    loop {
        let deadline = capture.next_deadline();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            event = rx.recv() => {
                let Some(event) = event else { return Ok(()) };
                for fs_event in map_event(event) {
                    for item in capture.handle(fs_event, Instant::now()) {
                        enqueue(&queue, item).await;
                    }
                }
            }
            () = sleep_until_deadline(deadline) => {
                if let Some(item) = capture.flush_expired(Instant::now()) {
                    enqueue(&queue, item).await;
                }
            }
        }
    }
}

async fn enqueue(queue: &TransferQueue, item: mirsync_core::QueueItem) {
    if let Err(err) = queue.add(item).await {
        // Out-of-root paths are dropped by contract.
        debug!(%err, "dropping event");
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        }
        None => std::future::pending().await,
    }
}

fn watch_error(err: notify::Error) -> SyncError {
    SyncError::Io(std::io::Error::other(err))
}

/// Reduce a backend event to the kinds the adapter understands.
///
/// A `RenameMode::Both` event carries source and destination in one shot;
/// it is split into the RENAME/CREATE pair the adapter already pairs up.
fn map_event(event: Event) -> Vec<FsEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => FsEventKind::Create,

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => FsEventKind::Rename,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FsEventKind::Create,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            let mut out = Vec::new();
            if let Some(from) = paths.next() {
                out.push(FsEvent { kind: FsEventKind::Rename, path: from });
            }
            if let Some(to) = paths.next() {
                out.push(FsEvent { kind: FsEventKind::Create, path: to });
            }
            return out;
        }
        EventKind::Modify(ModifyKind::Name(_)) => FsEventKind::Rename,

        EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions | MetadataKind::Ownership | MetadataKind::Any,
        )) => FsEventKind::Chmod,
        // Timestamp-only noise.
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),

        EventKind::Modify(_) => FsEventKind::Write,

        EventKind::Remove(_) => FsEventKind::Remove,

        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .map(|path| FsEvent { kind, path })
        .collect()
}
