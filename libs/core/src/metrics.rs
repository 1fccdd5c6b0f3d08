use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio::time::Instant;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabel {
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ActionLabel {
    pub controller: String,
    pub action: String,
}

/// Per-controller counters and histograms, all registered under one shared
/// process-wide [`Registry`]. A single `/metrics` endpoint serves every
/// controller's numbers in OpenMetrics text format.
pub struct ControllerMetrics {
    controller: String,
    reconcile_operations: Family<ControllerLabel, Counter>,
    reconcile_failures: Family<ControllerLabel, Counter>,
    reconcile_duration: Family<ControllerLabel, Histogram>,
    reconcile_deploy_delete_create: Family<ControllerLabel, Counter>,
    triggered: Family<ActionLabel, Counter>,
    ready: Family<ControllerLabel, Gauge<i64, AtomicI64>>,
}

fn new_reconcile_duration_histogram() -> Histogram {
    Histogram::new(prometheus_client::metrics::histogram::exponential_buckets(0.01, 2.0, 12))
}

impl ControllerMetrics {
    pub fn register(controller: &str, registry: &mut Registry) -> Arc<Self> {
        let reconcile_operations = Family::default();
        let reconcile_failures = Family::default();
        let reconcile_duration =
            Family::new_with_constructor(new_reconcile_duration_histogram as fn() -> Histogram);
        let reconcile_deploy_delete_create = Family::default();
        let triggered = Family::default();
        let ready = Family::default();

        registry.register(
            "reconcile_operations",
            "Total number of reconcile operations",
            reconcile_operations.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Number of errors during reconcile operations",
            reconcile_failures.clone(),
        );
        registry.register(
            "reconcile_duration_seconds",
            "Histogram of reconcile operation durations",
            reconcile_duration.clone(),
        );
        registry.register(
            "reconcile_deploy_delete_create",
            "Number of times reconciling required a delete+create fallback",
            reconcile_deploy_delete_create.clone(),
        );
        registry.register(
            "triggered",
            "Number of times a watch event triggered a reconcile",
            triggered.clone(),
        );
        registry.register(
            "controller_ready",
            "1 when the controller is ready to reconcile resources",
            ready.clone(),
        );

        Arc::new(Self {
            controller: controller.to_string(),
            reconcile_operations,
            reconcile_failures,
            reconcile_duration,
            reconcile_deploy_delete_create,
            triggered,
            ready,
        })
    }

    fn label(&self) -> ControllerLabel {
        ControllerLabel {
            controller: self.controller.clone(),
        }
    }

    pub fn reconcile_failure_inc(&self) {
        self.reconcile_failures.get_or_create(&self.label()).inc();
    }

    pub fn reconcile_count_and_measure(&self) -> ReconcileMeasurer {
        self.reconcile_operations.get_or_create(&self.label()).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            controller: self.controller.clone(),
            histogram: self.reconcile_duration.clone(),
        }
    }

    pub fn reconcile_deploy_delete_create_inc(&self) {
        self.reconcile_deploy_delete_create
            .get_or_create(&self.label())
            .inc();
    }

    pub fn triggered_inc(&self, action: &str) {
        self.triggered
            .get_or_create(&ActionLabel {
                controller: self.controller.clone(),
                action: action.to_string(),
            })
            .inc();
    }

    pub fn ready_set(&self, ready: bool) {
        self.ready
            .get_or_create(&self.label())
            .set(if ready { 1 } else { 0 });
    }
}

/// Records elapsed time into the reconcile duration histogram on drop, so a
/// measurer only needs to be held for the scope of a reconcile call.
pub struct ReconcileMeasurer {
    start: Instant,
    controller: String,
    histogram: Family<ControllerLabel, Histogram>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram
            .get_or_create(&ControllerLabel {
                controller: self.controller.clone(),
            })
            .observe(duration);
    }
}

/// Render the full registry as OpenMetrics text, for the `/metrics` route.
pub fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, registry)
        .map_err(|e| Error::FormattingError("failed to encode metrics".to_string(), e))?;
    Ok(buffer)
}
