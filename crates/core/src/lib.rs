//! mirsync-core: Core sync engine
//!
//! Provides the block model, the wire protocol, change capture, the
//! transfer queue, and the shared error taxonomy.

pub mod checksum;
pub mod config;
pub mod error;
pub mod events;
pub mod meta;
pub mod paths;
pub mod protocol;
pub mod queue;
pub mod scan;

pub use checksum::Checksum;
pub use error::SyncError;
pub use meta::{Block, FileMeta, LocalFile, effective_block_size, missing_blocks, read_file};
pub use protocol::{ProtocolReader, ProtocolWriter, Request, Response};
pub use queue::{Action, QueueItem, TransferQueue};
