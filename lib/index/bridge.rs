use bytes::Bytes;
use tracing::debug;

use super::queue::QueueMessage;
use crate::bitfield::Bitfield;
use crate::feed::Feed;
use crate::server::monitoring::{IndexMetrics, INDEX_METRICS};

/// Scheduling side of the index: turns catch-up results and feed notifications into queue
/// messages.
///
/// The sieve itself lives in the queue worker, so the scheduler keeps its own view: the blocks
/// that were already indexed when the sieve was loaded, plus every block it has scheduled since.
/// A block is never enqueued twice, whichever source sees it first.
pub(crate) struct Scheduler {
    tx: flume::Sender<QueueMessage>,
    indexed_at_load: Bitfield,
    scheduled: Bitfield,
    head: u64,
    metrics: Option<IndexMetrics>,
}

impl Scheduler {
    pub(crate) fn new(tx: flume::Sender<QueueMessage>, indexed_at_load: Bitfield, head: u64) -> Self {
        Self::with_metrics(tx, indexed_at_load, head, INDEX_METRICS.get().cloned())
    }

    pub(crate) fn with_metrics(
        tx: flume::Sender<QueueMessage>,
        indexed_at_load: Bitfield,
        head: u64,
        metrics: Option<IndexMetrics>,
    ) -> Self {
        Self {
            tx,
            indexed_at_load,
            scheduled: Bitfield::new(),
            head,
            metrics,
        }
    }

    pub(crate) fn head(&self) -> u64 {
        self.head
    }

    /// Enqueues `block` unless it is already indexed or scheduled. Returns whether it was
    /// enqueued.
    pub(crate) fn schedule(&mut self, block: u64, data: Option<Bytes>) -> bool {
        if self.indexed_at_load.get(block) || self.scheduled.get(block) {
            return false;
        }
        // Counted before the send so the worker's decrement never runs first.
        let metrics = self.metrics.as_ref();
        if let Some(metrics) = metrics {
            metrics.queue_depth.inc();
        }
        if self
            .tx
            .send(QueueMessage::Schedule { block, data })
            .is_err()
        {
            // The worker has already stopped; its own result explains why.
            if let Some(metrics) = metrics {
                metrics.queue_depth.dec();
            }
            return false;
        }
        self.scheduled.set(block);

        if let Some(metrics) = metrics {
            metrics.blocks_scheduled_total.inc();
        }
        true
    }

    /// A block arrived together with its payload.
    pub(crate) fn on_download(&mut self, block: u64, data: Bytes) -> bool {
        let scheduled = self.schedule(block, Some(data));
        if scheduled {
            debug!(event = "download_scheduled", block, "scheduled downloaded block");
        }
        scheduled
    }

    /// The feed grew: schedule whatever is already available in `[head, len)` and move the head.
    pub(crate) fn on_update(&mut self, feed: &dyn Feed) -> usize {
        let new_head = feed.len();
        if new_head <= self.head {
            return 0;
        }

        let old_head = self.head;
        let mut scheduled = 0;
        for block in old_head..new_head {
            if feed.has(block) && self.schedule(block, None) {
                scheduled += 1;
            }
        }
        self.advance_head(new_head);

        debug!(
            event = "update_scanned",
            old_head,
            new_head,
            scheduled,
            "scanned extended feed range"
        );
        scheduled
    }

    pub(crate) fn advance_head(&mut self, head: u64) {
        self.head = self.head.max(head);
        let _ = self.tx.send(QueueMessage::AdvanceHead(self.head));
    }

    /// Tells the worker to finish after everything scheduled so far.
    pub(crate) fn end(self) {
        let _ = self.tx.send(QueueMessage::End);
    }
}
