use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub(crate) struct WebhookMetrics {
    requests: Family<RequestLabels, Counter>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Allowed,
    Denied,
    Errored,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    result: &'static str,
}

// === impl WebhookMetrics ===

impl WebhookMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "webhook_requests",
            "Total number of pod admission requests, by result",
            metrics.requests.clone(),
        );
        metrics
    }

    pub fn record(&self, outcome: Outcome) {
        self.requests
            .get_or_create(&RequestLabels {
                result: outcome.as_str(),
            })
            .inc();
    }

    #[cfg(test)]
    pub fn count(&self, outcome: Outcome) -> u64 {
        self.requests
            .get_or_create(&RequestLabels {
                result: outcome.as_str(),
            })
            .get()
    }
}

// === impl Outcome ===

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Errored => "errored",
        }
    }
}
