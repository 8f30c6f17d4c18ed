//! Change capture: translate raw notification events into queue items
//!
//! Notification backends split a rename into a RENAME of the old path
//! followed by a CREATE of the new path. The adapter keeps a single
//! pending-rename slot with a bounded grace window: a CREATE arriving inside
//! the window pairs into one RENAME item, and an expired slot is flushed as
//! a DELETE of the rename's source (the file genuinely left the tree).
//!
//! Everything here takes `Instant` as a parameter so tests control time;
//! the caller owns the clock and the flush cadence.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::meta::permission_bits;
use crate::queue::{Action, QueueItem};

/// How long a rename's source half stays eligible for pairing.
pub const RENAME_GRACE: Duration = Duration::from_millis(100);

/// A raw filesystem-notification event, already reduced to the five kinds
/// the pipeline understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    /// Absolute path the backend reported.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Create,
    Write,
    Chmod,
    Remove,
    /// The "old path" half of a rename.
    Rename,
}

/// Translates events into queue items, pairing RENAME with its CREATE.
#[derive(Default)]
pub struct ChangeCapture {
    pending_rename: Option<(PathBuf, Instant)>,
}

impl ChangeCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one event, returning the queue items it produces.
    pub fn handle(&mut self, event: FsEvent, now: Instant) -> Vec<QueueItem> {
        match event.kind {
            FsEventKind::Rename => {
                let mut items = Vec::new();
                // Re-arming flushes the previous source; no CREATE will pair
                // with it anymore.
                if let Some((old, _)) = self.pending_rename.take() {
                    items.push(QueueItem::new(Action::Delete, old));
                }
                self.pending_rename = Some((event.path, now));
                items
            }

            FsEventKind::Create => self.handle_create(event.path, now),

            FsEventKind::Write => vec![QueueItem::new(Action::Write, event.path)],

            FsEventKind::Chmod => match std::fs::metadata(&event.path) {
                Ok(metadata) => vec![QueueItem::with_mode(
                    Action::Chmod,
                    event.path,
                    permission_bits(&metadata),
                )],
                Err(err) => {
                    debug!(path = %event.path.display(), %err, "dropping chmod for unreadable path");
                    Vec::new()
                }
            },

            FsEventKind::Remove => vec![QueueItem::new(Action::Delete, event.path)],
        }
    }

    fn handle_create(&mut self, path: PathBuf, now: Instant) -> Vec<QueueItem> {
        if let Ok(metadata) = std::fs::metadata(&path) {
            if metadata.is_dir() {
                // The recursive watch backend picks up new directories on
                // its own; we only need to mirror the mkdir.
                return vec![QueueItem::with_mode(
                    Action::Mkdir,
                    path,
                    permission_bits(&metadata),
                )];
            }
        }

        if let Some((old, armed_at)) = self.pending_rename.take() {
            if now.duration_since(armed_at) <= RENAME_GRACE {
                return vec![QueueItem::rename(old, path)];
            }
            // Too late to pair: the source is gone and this is a new file.
            return vec![
                QueueItem::new(Action::Delete, old),
                QueueItem::new(Action::Touch, path),
            ];
        }

        vec![QueueItem::new(Action::Touch, path)]
    }

    /// Flush a pending rename whose grace window has passed.
    pub fn flush_expired(&mut self, now: Instant) -> Option<QueueItem> {
        let (_, armed_at) = self.pending_rename.as_ref()?;
        if now.duration_since(*armed_at) > RENAME_GRACE {
            let (old, _) = self.pending_rename.take()?;
            return Some(QueueItem::new(Action::Delete, old));
        }
        None
    }

    /// When the pending rename (if any) expires.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending_rename
            .as_ref()
            .map(|(_, armed_at)| *armed_at + RENAME_GRACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(kind: FsEventKind, path: impl Into<PathBuf>) -> FsEvent {
        FsEvent { kind, path: path.into() }
    }

    #[test]
    fn rename_then_create_pairs_into_one_item() {
        let mut capture = ChangeCapture::new();
        let now = Instant::now();

        assert!(capture.handle(event(FsEventKind::Rename, "/root/old"), now).is_empty());

        let items = capture.handle(
            event(FsEventKind::Create, "/root/new"),
            now + Duration::from_millis(10),
        );
        assert_eq!(
            items,
            vec![QueueItem::rename("/root/old", "/root/new")],
            "the pair must collapse into a single rename, no standalone touch"
        );
        assert!(capture.next_deadline().is_none());
    }

    #[test]
    fn create_without_pending_rename_is_a_touch() {
        let mut capture = ChangeCapture::new();
        let items = capture.handle(event(FsEventKind::Create, "/root/new"), Instant::now());
        assert_eq!(items, vec![QueueItem::new(Action::Touch, "/root/new")]);
    }

    #[test]
    fn create_after_grace_window_is_delete_plus_touch() {
        let mut capture = ChangeCapture::new();
        let now = Instant::now();

        capture.handle(event(FsEventKind::Rename, "/root/old"), now);
        let items = capture.handle(
            event(FsEventKind::Create, "/root/new"),
            now + RENAME_GRACE + Duration::from_millis(1),
        );

        assert_eq!(
            items,
            vec![
                QueueItem::new(Action::Delete, "/root/old"),
                QueueItem::new(Action::Touch, "/root/new"),
            ]
        );
    }

    #[test]
    fn expired_rename_flushes_as_delete() {
        let mut capture = ChangeCapture::new();
        let now = Instant::now();

        capture.handle(event(FsEventKind::Rename, "/root/old"), now);
        assert_eq!(capture.next_deadline(), Some(now + RENAME_GRACE));

        assert!(capture.flush_expired(now + Duration::from_millis(50)).is_none());

        let flushed = capture
            .flush_expired(now + RENAME_GRACE + Duration::from_millis(1))
            .unwrap();
        assert_eq!(flushed, QueueItem::new(Action::Delete, "/root/old"));
        assert!(capture.next_deadline().is_none());
    }

    #[test]
    fn rearming_flushes_the_previous_source() {
        let mut capture = ChangeCapture::new();
        let now = Instant::now();

        capture.handle(event(FsEventKind::Rename, "/root/first"), now);
        let items = capture.handle(event(FsEventKind::Rename, "/root/second"), now);

        assert_eq!(items, vec![QueueItem::new(Action::Delete, "/root/first")]);
    }

    #[test]
    fn create_of_directory_is_mkdir_with_mode() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let mut capture = ChangeCapture::new();
        let items = capture.handle(event(FsEventKind::Create, sub.clone()), Instant::now());

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action, Action::Mkdir);
        assert_eq!(items[0].path, sub);
        assert!(items[0].mode.is_some());
    }

    #[test]
    fn write_and_remove_pass_through() {
        let mut capture = ChangeCapture::new();
        let now = Instant::now();

        assert_eq!(
            capture.handle(event(FsEventKind::Write, "/root/f"), now),
            vec![QueueItem::new(Action::Write, "/root/f")]
        );
        assert_eq!(
            capture.handle(event(FsEventKind::Remove, "/root/f"), now),
            vec![QueueItem::new(Action::Delete, "/root/f")]
        );
    }

    #[test]
    fn chmod_of_missing_path_is_dropped() {
        let mut capture = ChangeCapture::new();
        let items = capture.handle(
            event(FsEventKind::Chmod, "/definitely/not/there"),
            Instant::now(),
        );
        assert!(items.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn chmod_reads_the_current_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o640)).unwrap();

        let mut capture = ChangeCapture::new();
        let items = capture.handle(event(FsEventKind::Chmod, file), Instant::now());

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].mode, Some(0o640));
    }
}
