//! MetaFS checkpoint and replay-log engine
//!
//! Crash-consistent persistence for the three B+Tree-backed maps of a
//! filesystem metadata volume (inode records, log-segment records,
//! B+Tree-node objects) onto a container/object store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Volume (orchestrator)        │
//! └─────────────────────────────────────┘
//!     ↓          ↓          ↓        ↓
//! ┌───────┐ ┌─────────┐ ┌───────┐ ┌──────────┐
//! │ BTree │ │ Replay  │ │Daemon │ │ Object   │
//! │ maps  │ │ log     │ │       │ │ client   │
//! └───────┘ └─────────┘ └───────┘ └──────────┘
//! ```
//!
//! A volume moves between two durable states: **checkpointed** (fully
//! described in the object store and anchored by a single container
//! header) and **advanced** (checkpointed state plus the transactions in
//! the local, aligned, CRC-protected replay log). The checkpoint daemon
//! periodically folds the advanced state back into a checkpoint, swaps
//! the header, discards the replay log and garbage-collects objects no
//! tree references any more.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use metafs_core::VolumeConfig;
//! use metafs_storage::{LocalObjectClient, Volume};
//!
//! #[tokio::main]
//! async fn main() -> metafs_core::Result<()> {
//!     let client = Arc::new(LocalObjectClient::new("./object-store").await?);
//!     let config = VolumeConfig {
//!         replay_log_path: Some("./replay.log".into()),
//!         ..VolumeConfig::default()
//!     };
//!
//!     let volume = Volume::up(client, config, true).await?;
//!     volume.put_inode_rec(0x11, Bytes::from_static(b"abc")).await?;
//!     volume.checkpoint().await?;
//!     volume.down().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod btree;
pub mod checkpoint;
mod daemon;
pub mod object_store;
pub mod replay;
pub mod volume;

// Re-export commonly used types
pub use btree::{BPlusTree, NodeIo, NodeLocation};
pub use checkpoint::{CheckpointHeader, CheckpointTrailer, CHECKPOINT_VERSION};
pub use object_store::{
    CallHistoryEntry, ChunkedPutContext, Headers, LocalObjectClient, MockFailure,
    MockObjectClient, ObjectClient,
};
pub use replay::{ReplayLog, Transaction, TransactionType};
pub use volume::{TreeKind, Volume};

/// Storage module version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
