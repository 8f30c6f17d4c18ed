//! Transfer manager: serialized consumer of the pending-operation queue
//!
//! One consumer owns the only connection. Items are processed strictly in
//! FIFO order; while the link is down the consumer polls for reconnection
//! before touching the next item. Failed items are retried with exponential
//! backoff when the failure is transient and dropped (with one log line)
//! when it is not.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mirsync_core::config::RetryConfig;
use mirsync_core::queue::{Action, QueueItem};
use mirsync_core::{paths, SyncError};

use crate::{ReceiverApi, Sender};

/// Delay between reconnect probes while the link is down.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Serialized work-queue consumer.
pub struct TransferManager<A> {
    sender: Sender<A>,
    rx: mpsc::Receiver<QueueItem>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl<A: ReceiverApi> TransferManager<A> {
    #[must_use]
    pub fn new(
        sender: Sender<A>,
        rx: mpsc::Receiver<QueueItem>,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sender,
            rx,
            retry,
            cancel,
        }
    }

    /// Consume until the queue closes or shutdown is signalled. The item in
    /// flight when shutdown arrives runs to completion.
    pub async fn run(mut self) {
        loop {
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                item = self.rx.recv() => match item {
                    Some(item) => item,
                    None => return,
                },
            };
            self.process(item).await;
        }
    }

    async fn process(&mut self, item: QueueItem) {
        // Queue items carry paths that `TransferQueue::add` built from
        // validated UTF-8, so this conversion cannot fail in practice.
        let Some(path) = item.path.to_str().map(str::to_owned) else {
            warn!(path = %item.path.display(), "dropping item with non-UTF-8 path");
            return;
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.wait_connected().await;
            if self.cancel.is_cancelled() {
                return;
            }

            match self.dispatch(&item, &path).await {
                Ok(()) => return,
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(path, attempt, %err, "transfer failed, will retry");
                    let shift = (attempt - 1).min(16);
                    let backoff =
                        Duration::from_millis(self.retry.backoff_ms.saturating_mul(1 << shift));
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(err) => {
                    warn!(path, attempt, %err, "dropping failed transfer");
                    return;
                }
            }
        }
    }

    /// Gate every dispatch on a live link, probing once per second.
    async fn wait_connected(&mut self) {
        while !self.sender.remote().is_connected() {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.sender.remote_mut().reconnect().await {
                Ok(()) => {
                    info!("reconnected");
                    return;
                }
                Err(err) => debug!(%err, "reconnect failed"),
            }
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn dispatch(&mut self, item: &QueueItem, path: &str) -> Result<(), SyncError> {
        match item.action {
            Action::Touch => self.sender.touch(path).await,
            Action::Chmod => self.sender.chmod(path, item.mode.unwrap_or(0o644)).await,
            Action::Write => self.sender.sync_file(path).await.map(|_| ()),
            Action::Mkdir => {
                self.sender
                    .create_directory(path, item.mode.unwrap_or(0o755))
                    .await
            }
            Action::Delete => self.sender.delete(path).await,
            Action::Rename => {
                let Some(target) = item.rename_target.as_deref() else {
                    warn!(path, "rename without a target, dropping");
                    return Ok(());
                };
                // A target that doesn't normalize drops just this rename.
                match paths::strip_base(self.sender.root(), target) {
                    Ok(new_path) => self.sender.rename(path, &new_path).await,
                    Err(err) => {
                        debug!(path, %err, "dropping rename with out-of-root target");
                        Ok(())
                    }
                }
            }
        }
    }
}
