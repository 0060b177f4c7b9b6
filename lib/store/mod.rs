//! Key-value storage seam used to persist the sieve.
//!
//! The index never assumes anything about the engine behind this trait beyond point reads,
//! point writes, and a prefix scan. Writes to distinct keys must be safe to interleave; the
//! index is the only writer inside its own key namespace.

mod memory;
mod sqlite;

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store task failed: {0}")]
    Task(String),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    #[error("store is closed")]
    Closed,
}

/// Asynchronous key-value store.
///
/// A missing key is `Ok(None)`, never an error.
pub trait KvStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>>;

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Returns every `(key, value)` pair whose key starts with `prefix`, ordered by key.
    fn scan_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<Vec<(String, Vec<u8>)>, StoreError>>;
}

impl<T> KvStore for Arc<T>
where
    T: KvStore + ?Sized,
{
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        (**self).get(key)
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).put(key, value)
    }

    fn scan_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<Vec<(String, Vec<u8>)>, StoreError>> {
        (**self).scan_prefix(prefix)
    }
}
