//! Delivery-tracking index over a sparse feed.
//!
//! Starting an index runs, in order:
//! 1. subscribe to feed notifications (so nothing that happens during startup is missed),
//! 2. load the sieve from the store,
//! 3. flush the feed and diff its availability bitmap against the sieve (catch-up),
//! 4. hand the sieve to a single queue worker and schedule the catch-up blocks,
//! 5. bridge `Download`/`Update` notifications into the queue until the feed closes,
//! 6. end the queue, wait for it to drain, and record the terminal outcome.
//!
//! Steps 2-6 run on a spawned task; the returned [`IndexHandle`] observes the outcome.

mod bridge;
mod catchup;
mod consumer;
mod error;
mod lifecycle;
mod queue;
mod sieve;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

use crate::feed::{Feed, FeedError, FeedEvent};
use crate::server::monitoring::INDEX_METRICS;
use crate::store::KvStore;
use bridge::Scheduler;
use lifecycle::Lifecycle;
use queue::{ProcessingQueue, QueueSummary};

pub use catchup::plan_catchup;
pub use consumer::{channel_consumer, Ack, ChannelConsumer, Consumer, Delivery, Entry};
pub use error::{ConsumerError, IndexError};
pub use lifecycle::{DoneCallback, IndexStatus};
pub use sieve::{Sieve, SieveKeys, DEFAULT_CHUNK_BITS};

/// Builder for an index over one feed.
///
/// `store`, `feed` and `consumer` are required; everything else has a default.
pub struct IndexBuilder {
    store: Option<Arc<dyn KvStore>>,
    feed: Option<Arc<dyn Feed>>,
    consumer: Option<Arc<dyn Consumer>>,
    on_done: Option<DoneCallback>,
    key_prefix: String,
    chunk_bits: u64,
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self {
            store: None,
            feed: None,
            consumer: None,
            on_done: None,
            key_prefix: String::new(),
            chunk_bits: DEFAULT_CHUNK_BITS,
        }
    }
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: impl KvStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn feed(mut self, feed: impl Feed + 'static) -> Self {
        self.feed = Some(Arc::new(feed));
        self
    }

    pub fn consumer(mut self, consumer: impl Consumer + 'static) -> Self {
        self.consumer = Some(Arc::new(consumer));
        self
    }

    /// Called exactly once with the terminal outcome.
    pub fn on_done(
        mut self,
        on_done: impl FnOnce(Result<(), IndexError>) + Send + 'static,
    ) -> Self {
        self.on_done = Some(Box::new(on_done));
        self
    }

    /// Prefix for every store key this index writes, so several indexes can share a store.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Bits per persisted sieve chunk. Must be a power of two of at least 8, and must not
    /// change between runs over the same store.
    pub fn chunk_bits(mut self, chunk_bits: u64) -> Self {
        self.chunk_bits = chunk_bits;
        self
    }

    /// Validates the configuration and starts indexing on the current Tokio runtime.
    pub fn start(self) -> Result<IndexHandle, IndexError> {
        let store = self
            .store
            .ok_or_else(|| IndexError::InvalidConfig("a store must be given".to_string()))?;
        let feed = self
            .feed
            .ok_or_else(|| IndexError::InvalidConfig("a feed must be given".to_string()))?;
        let consumer = self
            .consumer
            .ok_or_else(|| IndexError::InvalidConfig("a consumer must be given".to_string()))?;
        sieve::validate_chunk_bits(self.chunk_bits).map_err(IndexError::InvalidConfig)?;

        let events = feed.subscribe();
        let lifecycle = Arc::new(Lifecycle::new(self.on_done));
        let outcome = lifecycle.subscribe();

        let run = IndexRun {
            store,
            feed,
            consumer,
            keys: SieveKeys::new(&self.key_prefix),
            chunk_bits: self.chunk_bits,
        };
        let driver_lifecycle = Arc::clone(&lifecycle);
        let driver = tokio::spawn(async move {
            let result = run.drive(events).await;
            driver_lifecycle.finish(result);
        });

        Ok(IndexHandle {
            lifecycle,
            outcome,
            driver,
            driver_done: false,
        })
    }
}

/// Handle to a running index.
///
/// Dropping the handle does not stop the index; it keeps running until the feed closes or a
/// fatal error occurs.
pub struct IndexHandle {
    lifecycle: Arc<Lifecycle>,
    outcome: watch::Receiver<Option<Result<(), IndexError>>>,
    driver: JoinHandle<()>,
    driver_done: bool,
}

impl IndexHandle {
    pub fn status(&self) -> IndexStatus {
        self.lifecycle.status()
    }

    /// Waits for the terminal outcome: `Ok(())` once the feed closed and every scheduled block
    /// was delivered, or the first fatal error.
    pub async fn wait(mut self) -> Result<(), IndexError> {
        loop {
            let current = self.outcome.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }

            tokio::select! {
                changed = self.outcome.changed() => {
                    if changed.is_err() {
                        return Err(IndexError::Internal("index lifecycle dropped".to_string()));
                    }
                }
                joined = &mut self.driver, if !self.driver_done => {
                    self.driver_done = true;
                    if let Err(err) = joined {
                        self.lifecycle.finish(Err(IndexError::Internal(format!(
                            "index driver task failed: {err}"
                        ))));
                    }
                }
            }
        }
    }
}

struct IndexRun {
    store: Arc<dyn KvStore>,
    feed: Arc<dyn Feed>,
    consumer: Arc<dyn Consumer>,
    keys: SieveKeys,
    chunk_bits: u64,
}

impl IndexRun {
    async fn drive(self, events: flume::Receiver<FeedEvent>) -> Result<(), IndexError> {
        let sieve = Sieve::load(Arc::clone(&self.store), self.keys.clone(), self.chunk_bits).await?;
        self.feed.flush().await.map_err(IndexError::FeedFlush)?;

        let feed_length = self.feed.len();
        let plan = plan_catchup(sieve.bits(), &self.feed.bitfield(), feed_length)?;
        info!(
            event = "catchup_planned",
            feed_length,
            already_indexed = sieve.bits().count_ones(),
            previous_head = sieve.head(),
            pending = plan.len(),
            "catch-up scan complete"
        );
        if let Some(metrics) = INDEX_METRICS.get() {
            metrics.catchup_pending.set(plan.len() as i64);
        }

        let (tx, rx) = flume::unbounded();
        let mut scheduler = Scheduler::new(tx, sieve.bits().clone(), feed_length);
        let queue = ProcessingQueue::new(sieve, Arc::clone(&self.feed), Arc::clone(&self.consumer));
        let mut worker = tokio::spawn(queue.run(rx));

        for block in plan {
            scheduler.schedule(block, None);
        }
        scheduler.advance_head(feed_length);

        loop {
            tokio::select! {
                joined = &mut worker => {
                    // The worker only stops on its own when something went wrong.
                    return flatten_worker(joined).and_then(|_| {
                        Err(IndexError::Internal("processing queue stopped unexpectedly".to_string()))
                    });
                }
                event = events.recv_async() => match event {
                    Ok(FeedEvent::Download { index, data }) => {
                        scheduler.on_download(index, data);
                    }
                    Ok(FeedEvent::Update) => {
                        scheduler.on_update(&*self.feed);
                    }
                    Ok(FeedEvent::Close) | Err(_) => break,
                },
            }
        }

        info!(event = "feed_closed", head = scheduler.head(), "feed closed, draining queue");
        match self.feed.flush().await {
            Ok(()) | Err(FeedError::Closed) => {}
            Err(err) => warn!(event = "feed_flush_failed", error = %err, "flush after close failed"),
        }
        scheduler.end();

        flatten_worker(worker.await).map(|_| ())
    }
}

fn flatten_worker(
    joined: Result<Result<QueueSummary, IndexError>, JoinError>,
) -> Result<QueueSummary, IndexError> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(IndexError::Internal(format!(
            "processing queue task failed: {err}"
        ))),
    }
}
