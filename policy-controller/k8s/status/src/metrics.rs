use prometheus_client::{metrics::counter::Counter, registry::Registry};

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    pub(crate) patch_succeeded: Counter,
    pub(crate) patch_failed: Counter,
    pub(crate) patch_conflict: Counter,
    pub(crate) patch_timeout: Counter,
    pub(crate) patch_dequeues: Counter,
    pub(crate) patch_skipped: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    pub(crate) patch_enqueues: Counter,
    pub(crate) patch_channel_full: Counter,
    pub(crate) capacity_exceeded: Counter,
}

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();

        prom.register(
            "patch_succeeded",
            "Counter of successful status patches",
            metrics.patch_succeeded.clone(),
        );
        prom.register(
            "patch_failed",
            "Counter of failed status patches",
            metrics.patch_failed.clone(),
        );
        prom.register(
            "patch_conflict",
            "Counter of status patches rejected because the object changed",
            metrics.patch_conflict.clone(),
        );
        prom.register(
            "patch_timeout",
            "Counter of status patches that timed out",
            metrics.patch_timeout.clone(),
        );
        prom.register(
            "patch_dequeued",
            "Counter of status patches dequeued by the controller",
            metrics.patch_dequeues.clone(),
        );
        prom.register(
            "patch_skipped",
            "Counter of status patches dropped because the lease was not held",
            metrics.patch_skipped.clone(),
        );

        metrics
    }
}

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();

        prom.register(
            "patch_enqueued",
            "Counter of status patches enqueued for the controller",
            metrics.patch_enqueues.clone(),
        );
        prom.register(
            "patch_channel_full",
            "Counter of status patches dropped because the queue was full",
            metrics.patch_channel_full.clone(),
        );
        prom.register(
            "ancestor_capacity_exceeded",
            "Counter of ancestors that could not be recorded in a full policy status",
            metrics.capacity_exceeded.clone(),
        );

        metrics
    }
}
