use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::feed::FeedError;
use crate::store::StoreError;

/// Fatal errors surfaced by an index instance.
///
/// `Clone` so the single terminal outcome can reach both the `on_done` callback and every
/// caller awaiting the handle.
#[derive(Error, Debug, Clone)]
pub enum IndexError {
    #[error("invalid index configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load sieve from store: {0}")]
    StoreRead(#[source] StoreError),

    #[error("failed to persist sieve for block {block}: {source}")]
    StorePersist {
        block: u64,
        #[source]
        source: StoreError,
    },

    #[error("failed to persist sieve head offset {head}: {source}")]
    StorePersistHead {
        head: u64,
        #[source]
        source: StoreError,
    },

    #[error("feed is shorter than index (feed length {feed_length}, index covers {index_length} blocks)")]
    FeedShorterThanIndex { feed_length: u64, index_length: u64 },

    #[error("consumer rejected block {block}: {source}")]
    Consumer {
        block: u64,
        #[source]
        source: ConsumerError,
    },

    #[error("failed to read block {block} from feed: {source}")]
    FeedRead {
        block: u64,
        #[source]
        source: FeedError,
    },

    #[error("failed to flush feed: {0}")]
    FeedFlush(#[source] FeedError),

    #[error("index worker failed: {0}")]
    Internal(String),
}

impl IndexError {
    /// Returns the consumer's own error when this outcome came from a rejected acknowledgment.
    pub fn consumer_error(&self) -> Option<&ConsumerError> {
        match self {
            IndexError::Consumer { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Error returned by a consumer to reject a block and stop the index.
///
/// Wraps the consumer's error in an `Arc` so it survives the `Clone` of [`IndexError`] without
/// losing identity; callers can get their original error back with [`ConsumerError::downcast_ref`].
#[derive(Clone)]
pub struct ConsumerError(Arc<dyn StdError + Send + Sync + 'static>);

impl ConsumerError {
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self(Arc::new(MessageError(message.into())))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// True when both values wrap the very same error allocation.
    pub fn ptr_eq(&self, other: &ConsumerError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConsumerError").field(&self.0).finish()
    }
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for ConsumerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl From<String> for ConsumerError {
    fn from(message: String) -> Self {
        Self::msg(message)
    }
}

impl From<&str> for ConsumerError {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for MessageError {}
