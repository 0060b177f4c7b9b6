use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping.
///
/// Encoded as a labeled gauge with value `1` so the labels survive text exposition.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "feed_sieve",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone)]
pub struct IndexMetrics {
    /// Blocks handed to the processing queue, from catch-up or live notifications.
    pub blocks_scheduled_total: Counter,
    /// Blocks acknowledged by the consumer and persisted in the sieve.
    pub blocks_delivered_total: Counter,
    /// Queue items dropped at dequeue because the block was already indexed.
    pub blocks_skipped_total: Counter,
    /// Index runs that ended with an error.
    pub fatal_errors_total: Counter,
    /// Scheduled blocks not yet picked up by the worker.
    pub queue_depth: Gauge,
    /// Highest feed length covered by the live-update scan.
    pub head_offset: Gauge,
    /// Blocks found by the most recent catch-up scan.
    pub catchup_pending: Gauge,
}

impl IndexMetrics {
    fn init() -> Self {
        Self {
            blocks_scheduled_total: Counter::default(),
            blocks_delivered_total: Counter::default(),
            blocks_skipped_total: Counter::default(),
            fatal_errors_total: Counter::default(),
            queue_depth: Gauge::default(),
            head_offset: Gauge::default(),
            catchup_pending: Gauge::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "blocks_scheduled",
            "Total number of blocks scheduled for delivery",
            metrics.blocks_scheduled_total.clone(),
        );
        sub_registry.register(
            "blocks_delivered",
            "Total number of blocks acknowledged and persisted",
            metrics.blocks_delivered_total.clone(),
        );
        sub_registry.register(
            "blocks_skipped",
            "Total number of queued blocks skipped as already indexed",
            metrics.blocks_skipped_total.clone(),
        );
        sub_registry.register(
            "fatal_errors",
            "Total number of index runs that stopped with an error",
            metrics.fatal_errors_total.clone(),
        );
        sub_registry.register(
            "queue_depth",
            "Scheduled blocks waiting for the processing worker",
            metrics.queue_depth.clone(),
        );
        sub_registry.register(
            "head_offset",
            "Feed length covered by the live-update scan",
            metrics.head_offset.clone(),
        );
        sub_registry.register(
            "catchup_pending",
            "Blocks found by the latest catch-up scan",
            metrics.catchup_pending.clone(),
        );
        metrics
    }
}

pub static INDEX_METRICS: OnceCell<IndexMetrics> = OnceCell::const_new();
