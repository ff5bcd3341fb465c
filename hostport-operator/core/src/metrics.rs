use crate::{AllocateError, HostId, Policy, Protocol};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct AllocatorMetrics {
    allocations: Family<AllocationLabels, Counter>,
    errors: Family<ErrorLabels, Counter>,
    conflicts: Family<ConflictLabels, Counter>,
    duration: Family<DurationLabels, Histogram>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct AllocationLabels {
    policy: &'static str,
    protocol: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    policy: &'static str,
    error_type: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DurationLabels {
    policy: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ConflictLabels {
    node: String,
    protocol: &'static str,
}

// === impl AllocatorMetrics ===

impl AllocatorMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();

        prom.register(
            "allocations",
            "Total number of host ports allocated, by policy and protocol",
            metrics.allocations.clone(),
        );

        prom.register(
            "allocation_errors",
            "Total number of aborted allocation calls, by the failing request's policy",
            metrics.errors.clone(),
        );

        prom.register(
            "conflicts",
            "Total number of host port conflicts detected",
            metrics.conflicts.clone(),
        );

        prom.register_with_unit(
            "allocation_duration",
            "Histogram of allocation call latency, including the cluster state scan, by policy",
            Unit::Seconds,
            metrics.duration.clone(),
        );

        metrics
    }

    pub(crate) fn allocated(&self, policy: Policy, protocol: Protocol) {
        self.allocations
            .get_or_create(&AllocationLabels {
                policy: policy.as_str(),
                protocol: protocol.as_str(),
            })
            .inc();
    }

    pub(crate) fn aborted(&self, policy: Option<Policy>, error: &AllocateError) {
        self.errors
            .get_or_create(&ErrorLabels {
                policy: policy_label(policy),
                error_type: error.kind(),
            })
            .inc();
    }

    pub(crate) fn conflict(&self, host: &HostId, protocol: Protocol) {
        self.conflicts
            .get_or_create(&ConflictLabels {
                node: host.to_string(),
                protocol: protocol.as_str(),
            })
            .inc();
    }

    pub(crate) fn observe(&self, policy: Option<Policy>, elapsed: Duration) {
        self.duration
            .get_or_create(&DurationLabels {
                policy: policy_label(policy),
            })
            .observe(elapsed.as_secs_f64());
    }
}

/// Unregistered metrics.
impl Default for AllocatorMetrics {
    fn default() -> Self {
        Self {
            allocations: Family::default(),
            errors: Family::default(),
            conflicts: Family::default(),
            duration: Family::<DurationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 12))
            }),
        }
    }
}

/// Calls that fail before any request is dispatched are labeled `none`.
fn policy_label(policy: Option<Policy>) -> &'static str {
    policy.as_ref().map_or("none", Policy::as_str)
}
