use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;

use super::consumer::{Consumer, Entry};
use super::error::ConsumerError;
use crate::store::{KvStore, MemoryStore, StoreError};

pub(super) const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct FailurePlan {
    fail_reads: bool,
    failing_put_keys: HashSet<String>,
    puts_allowed: Option<usize>,
    puts: usize,
}

/// Memory store with scripted read/write failures.
#[derive(Clone, Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    plan: Arc<Mutex<FailurePlan>>,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub(crate) fn fail_reads(&self) {
        self.plan.lock().expect("plan mutex poisoned").fail_reads = true;
    }

    pub(crate) fn fail_puts_to(&self, key: &str) {
        self.plan
            .lock()
            .expect("plan mutex poisoned")
            .failing_put_keys
            .insert(key.to_string());
    }

    /// Lets `allowed` more puts succeed, then fails every later put.
    pub(crate) fn fail_puts_after(&self, allowed: usize) {
        let mut plan = self.plan.lock().expect("plan mutex poisoned");
        plan.puts_allowed = Some(plan.puts + allowed);
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.plan.lock().expect("plan mutex poisoned").fail_reads {
            return Err(StoreError::Backend("scripted read failure".to_string()));
        }
        Ok(())
    }

    fn check_put(&self, key: &str) -> Result<(), StoreError> {
        let mut plan = self.plan.lock().expect("plan mutex poisoned");
        if plan.failing_put_keys.contains(key) {
            return Err(StoreError::Backend(format!("scripted put failure for {key}")));
        }
        if plan.puts_allowed.is_some_and(|allowed| plan.puts >= allowed) {
            return Err(StoreError::Backend("scripted put failure".to_string()));
        }
        plan.puts += 1;
        Ok(())
    }
}

impl KvStore for FlakyStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        Box::pin(async move {
            self.check_read()?;
            self.inner.get(key).await
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.check_put(key)?;
            self.inner.put(key, value).await
        })
    }

    fn scan_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<Vec<(String, Vec<u8>)>, StoreError>> {
        Box::pin(async move {
            self.check_read()?;
            self.inner.scan_prefix(prefix).await
        })
    }
}

struct RecordingState {
    seen: Mutex<Vec<Entry>>,
    calls: watch::Sender<usize>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    failure: Option<(usize, ConsumerError)>,
    delay: Duration,
}

/// Consumer that records every entry and tracks how many calls overlap.
#[derive(Clone)]
pub(crate) struct RecordingConsumer {
    state: Arc<RecordingState>,
}

impl RecordingConsumer {
    pub(crate) fn new() -> Self {
        Self::build(None, Duration::ZERO)
    }

    /// Rejects the `call`-th invocation (1-based) with `err`.
    pub(crate) fn failing_on(call: usize, err: ConsumerError) -> Self {
        Self::build(Some((call, err)), Duration::ZERO)
    }

    /// Sleeps for `delay` inside every call, to widen any window for overlapping calls.
    pub(crate) fn slow(delay: Duration) -> Self {
        Self::build(None, delay)
    }

    fn build(failure: Option<(usize, ConsumerError)>, delay: Duration) -> Self {
        let (calls, _) = watch::channel(0);
        Self {
            state: Arc::new(RecordingState {
                seen: Mutex::new(Vec::new()),
                calls,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                failure,
                delay,
            }),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        *self.state.calls.borrow()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn indices(&self) -> Vec<u64> {
        self.state
            .seen
            .lock()
            .expect("seen mutex poisoned")
            .iter()
            .map(|entry| entry.index)
            .collect()
    }

    /// Payloads seen so far, sorted, as UTF-8 strings.
    pub(crate) fn sorted_payloads(&self) -> Vec<String> {
        let mut payloads: Vec<String> = self
            .state
            .seen
            .lock()
            .expect("seen mutex poisoned")
            .iter()
            .map(|entry| String::from_utf8_lossy(&entry.data).into_owned())
            .collect();
        payloads.sort();
        payloads
    }

    /// Waits until at least `count` calls have been made.
    pub(crate) async fn wait_for_calls(&self, count: usize) {
        let mut rx = self.state.calls.subscribe();
        tokio::time::timeout(TEST_TIMEOUT, async {
            while *rx.borrow_and_update() < count {
                rx.changed().await.expect("calls sender dropped");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {count} consumer calls"));
    }
}

impl Consumer for RecordingConsumer {
    fn on_entry(&self, entry: Entry) -> BoxFuture<'_, Result<(), ConsumerError>> {
        Box::pin(async move {
            let state = &self.state;
            let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if state.delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(state.delay).await;
            }

            let call = {
                let mut seen = state.seen.lock().expect("seen mutex poisoned");
                seen.push(entry);
                seen.len()
            };
            state.in_flight.fetch_sub(1, Ordering::SeqCst);
            state.calls.send_replace(call);

            match &state.failure {
                Some((failing_call, err)) if *failing_call == call => Err(err.clone()),
                _ => Ok(()),
            }
        })
    }
}
