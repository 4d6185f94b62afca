//! Prometheus metrics for the flow-control core.

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics maintained by a [`crate::manager::ClientManager`].
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// Requests admitted and started immediately.
    pub accepted: Counter,
    /// Requests rejected for insufficient buffer.
    pub rejected: Counter,
    /// Requests deferred to the serving queue.
    pub queued: Counter,
    /// Requests fully processed.
    pub served: Counter,
    /// Requests currently being served.
    pub parallel: Gauge,
}

impl Metrics {
    /// Initialize the `Metrics` struct and register the metrics in the
    /// provided registry. `Metrics::default()` yields unregistered metrics
    /// for embedders that do not scrape.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "requests_accepted",
            "Number of requests admitted and started immediately",
            metrics.accepted.clone(),
        );
        registry.register(
            "requests_rejected",
            "Number of requests rejected for insufficient buffer",
            metrics.rejected.clone(),
        );
        registry.register(
            "requests_queued",
            "Number of requests deferred to the serving queue",
            metrics.queued.clone(),
        );
        registry.register(
            "requests_served",
            "Number of requests fully processed",
            metrics.served.clone(),
        );
        registry.register(
            "parallel_requests",
            "Number of requests currently being served",
            metrics.parallel.clone(),
        );

        metrics
    }
}
