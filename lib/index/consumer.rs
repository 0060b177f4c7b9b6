use std::future::Future;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use super::error::ConsumerError;

/// One block handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub index: u64,
    pub data: Bytes,
}

/// Receives each newly available block exactly once.
///
/// Completing the returned future is the acknowledgment: `Ok(())` lets the index mark the block
/// and move on, an error stops the index with [`super::IndexError::Consumer`]. The index never
/// calls `on_entry` again before the previous future has completed.
pub trait Consumer: Send + Sync {
    fn on_entry(&self, entry: Entry) -> BoxFuture<'_, Result<(), ConsumerError>>;
}

impl<F, Fut> Consumer for F
where
    F: Fn(Entry) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ConsumerError>> + Send + 'static,
{
    fn on_entry(&self, entry: Entry) -> BoxFuture<'_, Result<(), ConsumerError>> {
        Box::pin(self(entry))
    }
}

/// Acknowledgment token for one delivered block.
///
/// Consumed on use, so a block can be acknowledged at most once. Dropping it without
/// acknowledging counts as a consumer error.
#[derive(Debug)]
pub struct Ack {
    tx: oneshot::Sender<Result<(), ConsumerError>>,
}

impl Ack {
    pub fn ack(self) {
        self.finish(Ok(()));
    }

    pub fn fail(self, err: impl Into<ConsumerError>) {
        self.finish(Err(err.into()));
    }

    pub fn finish(self, result: Result<(), ConsumerError>) {
        // The index may already have stopped; nobody is left to tell.
        let _ = self.tx.send(result);
    }
}

/// A block plus the token that acknowledges it.
#[derive(Debug)]
pub struct Delivery {
    pub entry: Entry,
    pub ack: Ack,
}

/// Consumer that forwards each block over a channel, for callers that prefer to pull
/// deliveries from their own task instead of implementing [`Consumer`].
#[derive(Clone)]
pub struct ChannelConsumer {
    tx: flume::Sender<Delivery>,
}

/// Creates a channel-backed consumer and the receiving end of its deliveries.
pub fn channel_consumer() -> (ChannelConsumer, flume::Receiver<Delivery>) {
    let (tx, rx) = flume::bounded(1);
    (ChannelConsumer { tx }, rx)
}

impl Consumer for ChannelConsumer {
    fn on_entry(&self, entry: Entry) -> BoxFuture<'_, Result<(), ConsumerError>> {
        Box::pin(async move {
            let (ack_tx, ack_rx) = oneshot::channel();
            self.tx
                .send_async(Delivery {
                    entry,
                    ack: Ack { tx: ack_tx },
                })
                .await
                .map_err(|_| ConsumerError::msg("delivery receiver was dropped"))?;

            ack_rx
                .await
                .map_err(|_| ConsumerError::msg("delivery was dropped without acknowledgment"))?
        })
    }
}
