//! Boundary to the append-only block log being indexed.
//!
//! The index only reads from the feed: its length, per-block availability, payloads, and a
//! stream of change notifications. Replication and download policy live entirely on the other
//! side of this trait.

mod memory;

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::bitfield::Bitfield;

pub use memory::MemoryFeed;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("feed is closed")]
    Closed,

    #[error("feed is read-only")]
    ReadOnly,

    #[error("block {index} is outside the feed (length {length})")]
    OutOfBounds { index: u64, length: u64 },

    #[error("feed error: {0}")]
    Other(String),
}

/// Change notifications emitted by a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// A block became locally available, either replicated from a peer or appended locally.
    Download { index: u64, data: Bytes },
    /// The feed's length grew.
    Update,
    /// The feed is shutting down; no further events follow.
    Close,
}

pub trait Feed: Send + Sync {
    /// Current number of blocks, available or not.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether block `index` is stored locally.
    fn has(&self, index: u64) -> bool;

    /// Snapshot of the local-availability bitmap.
    fn bitfield(&self) -> Bitfield;

    /// Resolves with the payload of block `index`, waiting until it is locally available.
    fn get(&self, index: u64) -> BoxFuture<'_, Result<Bytes, FeedError>>;

    /// Resolves once pending local appends are reflected in `len`, `has`, and `bitfield`.
    fn flush(&self) -> BoxFuture<'_, Result<(), FeedError>>;

    /// Registers a new listener. Events emitted before this call are not replayed.
    fn subscribe(&self) -> flume::Receiver<FeedEvent>;
}

impl<T> Feed for Arc<T>
where
    T: Feed + ?Sized,
{
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn has(&self, index: u64) -> bool {
        (**self).has(index)
    }

    fn bitfield(&self) -> Bitfield {
        (**self).bitfield()
    }

    fn get(&self, index: u64) -> BoxFuture<'_, Result<Bytes, FeedError>> {
        (**self).get(index)
    }

    fn flush(&self) -> BoxFuture<'_, Result<(), FeedError>> {
        (**self).flush()
    }

    fn subscribe(&self) -> flume::Receiver<FeedEvent> {
        (**self).subscribe()
    }
}
