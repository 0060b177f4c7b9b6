use std::sync::Mutex;

use tokio::sync::watch;
use tracing::{error, info};

use super::error::IndexError;
use crate::server::monitoring::INDEX_METRICS;

/// Optional completion callback, invoked exactly once with the terminal outcome.
pub type DoneCallback = Box<dyn FnOnce(Result<(), IndexError>) + Send + 'static>;

/// Coarse state of an index instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Running,
    Finished,
    Errored,
}

type Outcome = Option<Result<(), IndexError>>;

/// Owns the single terminal transition of an index instance.
///
/// Every finish and error path funnels through [`Lifecycle::finish`]; only the first call
/// takes effect.
pub(crate) struct Lifecycle {
    outcome: watch::Sender<Outcome>,
    on_done: Mutex<Option<DoneCallback>>,
}

impl Lifecycle {
    pub(crate) fn new(on_done: Option<DoneCallback>) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            outcome,
            on_done: Mutex::new(on_done),
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Outcome> {
        self.outcome.subscribe()
    }

    pub(crate) fn status(&self) -> IndexStatus {
        status_of(&self.outcome.borrow())
    }

    /// Records the terminal outcome and fires the callback. Returns `false` if a terminal
    /// outcome was already recorded, in which case nothing happens.
    pub(crate) fn finish(&self, result: Result<(), IndexError>) -> bool {
        let mut first = false;
        self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result.clone());
            first = true;
            true
        });
        if !first {
            return false;
        }

        match &result {
            Ok(()) => info!(event = "index_finished", "index drained and finished"),
            Err(err) => {
                if let Some(metrics) = INDEX_METRICS.get() {
                    metrics.fatal_errors_total.inc();
                }
                error!(event = "index_failed", error = %err, "index stopped on fatal error");
            }
        }

        let callback = self
            .on_done
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(callback) = callback {
            callback(result);
        }
        true
    }
}

pub(crate) fn status_of(outcome: &Outcome) -> IndexStatus {
    match outcome {
        None => IndexStatus::Running,
        Some(Ok(())) => IndexStatus::Finished,
        Some(Err(_)) => IndexStatus::Errored,
    }
}
