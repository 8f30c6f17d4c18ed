//! Error taxonomy shared by sender and receiver
//!
//! Callers match on the variant to drive retry policy: `Transport` and
//! transient `Io` failures are worth retrying, everything else is not.

use std::io;

/// Errors produced by sync operations on either end.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Path absent on the remote.
    #[error("not found: {0}")]
    NotFound(String),

    /// OS-level filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Network failure, connection reset, or framing breakdown.
    #[error("transport error: {0}")]
    Transport(String),

    /// Path normalization failure, out-of-root path, or argument out of range.
    #[error("validation error: {0}")]
    Validation(String),

    /// Malformed response or unexpected field values.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Wire tags for the error kinds.
pub mod kind {
    pub const NOT_FOUND: u8 = 0;
    pub const IO: u8 = 1;
    pub const TRANSPORT: u8 = 2;
    pub const VALIDATION: u8 = 3;
    pub const PROTOCOL: u8 = 4;
}

impl SyncError {
    /// Whether a retry can plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Io(err) => is_transient_io(err.kind()),
            Self::NotFound(_) | Self::Validation(_) | Self::Protocol(_) => false,
        }
    }

    /// Map an I/O error observed while reading `path` into the taxonomy.
    ///
    /// An absent file becomes `NotFound`; everything else stays `Io`.
    #[must_use]
    pub fn from_io(path: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound(path.to_string())
        } else {
            Self::Io(err)
        }
    }

    /// Tag for the wire error frame: `(kind, transient)`.
    #[must_use]
    pub fn wire_kind(&self) -> (u8, bool) {
        let tag = match self {
            Self::NotFound(_) => kind::NOT_FOUND,
            Self::Io(_) => kind::IO,
            Self::Transport(_) => kind::TRANSPORT,
            Self::Validation(_) => kind::VALIDATION,
            Self::Protocol(_) => kind::PROTOCOL,
        };
        (tag, self.is_transient())
    }

    /// Reconstruct an error received over the wire.
    ///
    /// For `Io` the original errno is gone; the transient bit survives via
    /// the error kind so retry classification round-trips.
    #[must_use]
    pub fn from_wire(tag: u8, transient: bool, message: String) -> Self {
        match tag {
            kind::NOT_FOUND => Self::NotFound(message),
            kind::IO => {
                if transient {
                    Self::Io(io::Error::new(io::ErrorKind::StorageFull, message))
                } else {
                    Self::Io(io::Error::other(message))
                }
            }
            kind::TRANSPORT => Self::Transport(message),
            kind::VALIDATION => Self::Validation(message),
            _ => Self::Protocol(message),
        }
    }
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::StorageFull
    )
}
