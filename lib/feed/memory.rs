use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::watch;

use super::{Feed, FeedError, FeedEvent};
use crate::bitfield::Bitfield;

/// In-memory feed used by tests and the demo binary.
///
/// Two flavours exist. A writable feed ([`MemoryFeed::new`]) grows through local appends, which
/// (like a real log) only announce `Update`. A replica ([`MemoryFeed::replica`]) learns remote
/// length through [`MemoryFeed::grow`] and receives block data through
/// [`MemoryFeed::download`], which announces `Download` for the new block.
///
/// Clones share state, so one clone can be handed to an index while the test keeps appending
/// through another.
#[derive(Clone)]
pub struct MemoryFeed {
    inner: Arc<Inner>,
}

struct Inner {
    writable: bool,
    state: Mutex<FeedState>,
    /// Bumped on every availability change or close so blocked `get` calls re-check.
    changed: watch::Sender<u64>,
}

#[derive(Default)]
struct FeedState {
    blocks: Vec<Option<Bytes>>,
    available: Bitfield,
    listeners: Vec<flume::Sender<FeedEvent>>,
    closed: bool,
}

impl FeedState {
    fn emit(&mut self, event: FeedEvent) {
        self.listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeed {
    /// Creates an empty writable feed.
    pub fn new() -> Self {
        Self::with_mode(true)
    }

    /// Creates an empty read-only replica that only gains data through `download`.
    pub fn replica() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(writable: bool) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                writable,
                state: Mutex::new(FeedState::default()),
                changed,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify_waiters(&self) {
        self.inner.changed.send_modify(|version| *version += 1);
    }

    /// Appends one block and returns its index.
    pub fn append(&self, data: impl Into<Bytes>) -> Result<u64, FeedError> {
        let first = self.append_batch([data])?;
        Ok(first)
    }

    /// Appends several blocks with a single `Update` notification. Returns the first new index.
    pub fn append_batch<I, D>(&self, batch: I) -> Result<u64, FeedError>
    where
        I: IntoIterator<Item = D>,
        D: Into<Bytes>,
    {
        if !self.inner.writable {
            return Err(FeedError::ReadOnly);
        }

        let first = {
            let mut state = self.state();
            if state.closed {
                return Err(FeedError::Closed);
            }
            let first = state.blocks.len() as u64;
            for data in batch {
                let index = state.blocks.len() as u64;
                state.blocks.push(Some(data.into()));
                state.available.set(index);
            }
            if state.blocks.len() as u64 > first {
                state.emit(FeedEvent::Update);
            }
            first
        };

        self.notify_waiters();
        Ok(first)
    }

    /// Extends the known length without making any new block available.
    pub fn grow(&self, length: u64) -> Result<(), FeedError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(FeedError::Closed);
            }
            if length <= state.blocks.len() as u64 {
                return Ok(());
            }
            state.blocks.resize(length as usize, None);
            state.emit(FeedEvent::Update);
        }
        self.notify_waiters();
        Ok(())
    }

    /// Stores block `index` as if it had been replicated from a peer.
    ///
    /// Grows the feed if `index` is past the known length. Downloading a block that is already
    /// present is a no-op and emits nothing.
    pub fn download(&self, index: u64, data: impl Into<Bytes>) -> Result<(), FeedError> {
        let data = data.into();
        {
            let mut state = self.state();
            if state.closed {
                return Err(FeedError::Closed);
            }
            if state.available.get(index) {
                return Ok(());
            }

            let grew = index >= state.blocks.len() as u64;
            if grew {
                state.blocks.resize(index as usize + 1, None);
            }
            state.blocks[index as usize] = Some(data.clone());
            state.available.set(index);
            state.emit(FeedEvent::Download { index, data });
            if grew {
                state.emit(FeedEvent::Update);
            }
        }
        self.notify_waiters();
        Ok(())
    }

    /// Copies block `index` from `origin` into this replica, the way a sparse peer fetches one
    /// block on demand.
    pub async fn fetch_from(&self, origin: &MemoryFeed, index: u64) -> Result<Bytes, FeedError> {
        let origin_len = origin.len();
        if self.len() < origin_len {
            self.grow(origin_len)?;
        }
        let data = origin.get(index).await?;
        self.download(index, data.clone())?;
        Ok(data)
    }

    /// Closes the feed: announces `Close`, drops all listeners, and fails pending reads.
    pub fn close(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.emit(FeedEvent::Close);
            state.listeners.clear();
        }
        self.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl Feed for MemoryFeed {
    fn len(&self) -> u64 {
        self.state().blocks.len() as u64
    }

    fn has(&self, index: u64) -> bool {
        self.state().available.get(index)
    }

    fn bitfield(&self) -> Bitfield {
        self.state().available.clone()
    }

    fn get(&self, index: u64) -> BoxFuture<'_, Result<Bytes, FeedError>> {
        Box::pin(async move {
            let mut changed = self.inner.changed.subscribe();
            loop {
                {
                    let state = self.state();
                    if let Some(Some(data)) = state.blocks.get(index as usize) {
                        return Ok(data.clone());
                    }
                    if state.closed {
                        return Err(FeedError::Closed);
                    }
                }
                if changed.changed().await.is_err() {
                    return Err(FeedError::Closed);
                }
            }
        })
    }

    fn flush(&self) -> BoxFuture<'_, Result<(), FeedError>> {
        // Appends are applied synchronously, so there is never anything pending.
        Box::pin(async move { Ok(()) })
    }

    fn subscribe(&self) -> flume::Receiver<FeedEvent> {
        let (tx, rx) = flume::unbounded();
        let mut state = self.state();
        if state.closed {
            let _ = tx.send(FeedEvent::Close);
        } else {
            state.listeners.push(tx);
        }
        rx
    }
}
