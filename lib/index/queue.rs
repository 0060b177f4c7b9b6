use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::consumer::{Consumer, Entry};
use super::error::IndexError;
use super::sieve::Sieve;
use crate::feed::Feed;
use crate::server::monitoring::INDEX_METRICS;

/// Messages accepted by the processing queue worker, handled strictly in arrival order.
#[derive(Debug)]
pub(crate) enum QueueMessage {
    /// Deliver `block`. Without `data` the worker reads the payload from the feed right
    /// before delivery, so at most one feed read is ever in flight.
    Schedule { block: u64, data: Option<Bytes> },
    /// The live-update scan now covers `0..head`.
    AdvanceHead(u64),
    /// Nothing more will be scheduled; finish once everything before this is done.
    End,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct QueueSummary {
    pub(crate) delivered: u64,
    pub(crate) skipped: u64,
}

/// Single worker that owns the sieve and calls the consumer one block at a time.
///
/// Each block goes delivered -> acknowledged -> marked -> persisted before the next message
/// is read. Any failure ends the worker; messages still queued are dropped unprocessed.
pub(crate) struct ProcessingQueue {
    sieve: Sieve,
    feed: Arc<dyn Feed>,
    consumer: Arc<dyn Consumer>,
    summary: QueueSummary,
}

impl ProcessingQueue {
    pub(crate) fn new(sieve: Sieve, feed: Arc<dyn Feed>, consumer: Arc<dyn Consumer>) -> Self {
        Self {
            sieve,
            feed,
            consumer,
            summary: QueueSummary::default(),
        }
    }

    pub(crate) async fn run(
        mut self,
        messages: flume::Receiver<QueueMessage>,
    ) -> Result<QueueSummary, IndexError> {
        while let Ok(message) = messages.recv_async().await {
            match message {
                QueueMessage::Schedule { block, data } => {
                    if let Some(metrics) = INDEX_METRICS.get() {
                        metrics.queue_depth.dec();
                    }
                    self.process(block, data).await?;
                }
                QueueMessage::AdvanceHead(head) => {
                    self.sieve.advance_head(head);
                    if let Some(metrics) = INDEX_METRICS.get() {
                        metrics.head_offset.set(self.sieve.head() as i64);
                    }
                }
                QueueMessage::End => {
                    self.sieve.persist_head().await.map_err(|source| {
                        IndexError::StorePersistHead {
                            head: self.sieve.head(),
                            source,
                        }
                    })?;
                    info!(
                        event = "queue_drained",
                        delivered = self.summary.delivered,
                        skipped = self.summary.skipped,
                        head = self.sieve.head(),
                        "processing queue drained"
                    );
                    return Ok(self.summary);
                }
            }
        }

        warn!(
            event = "queue_abandoned",
            delivered = self.summary.delivered,
            "processing queue lost its scheduler before being ended"
        );
        Err(IndexError::Internal(
            "processing queue channel closed before end".to_string(),
        ))
    }

    async fn process(&mut self, block: u64, data: Option<Bytes>) -> Result<(), IndexError> {
        if self.sieve.get(block) {
            self.summary.skipped += 1;
            if let Some(metrics) = INDEX_METRICS.get() {
                metrics.blocks_skipped_total.inc();
            }
            debug!(event = "block_skipped", block, "block already indexed");
            return Ok(());
        }

        let data = match data {
            Some(data) => data,
            None => self
                .feed
                .get(block)
                .await
                .map_err(|source| IndexError::FeedRead { block, source })?,
        };

        self.consumer
            .on_entry(Entry { index: block, data })
            .await
            .map_err(|source| IndexError::Consumer { block, source })?;

        self.sieve.set(block);
        self.sieve.persist(block).await?;

        self.summary.delivered += 1;
        if let Some(metrics) = INDEX_METRICS.get() {
            metrics.blocks_delivered_total.inc();
        }
        debug!(event = "block_indexed", block, "block delivered and persisted");
        Ok(())
    }
}
