use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter_vec, Histogram, HistogramOpts, IntCounterVec,
};

use crate::fanout::Aggregate;

const LATENCY_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
];

// Inbound purge requests by result
static PURGE_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "purge_requests_total",
        "The total number of purge requests since purge-proxy started",
        &["result"]
    )
    .expect("Failed to register prometheus metric: purge_requests_total")
});

// Per-target outcomes
static TARGET_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "purge_target_outcomes_total",
        "Per-target purge outcomes",
        &["outcome"] // success/error/pending
    )
    .expect("Failed to register prometheus metric: purge_target_outcomes_total")
});

static FANOUT_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "purge_fanout_latency",
        "Time to fan one purge out to every target, in milliseconds",
    )
    .buckets(LATENCY_BUCKETS.to_vec());
    register_histogram!(opts).expect("Failed to register prometheus metric: purge_fanout_latency")
});

/// Result label for one inbound purge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeResultLabel {
    Ok,
    Partial,
    Empty,
    InvalidFilter,
    DiscoveryError,
}

impl PurgeResultLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurgeResultLabel::Ok => "ok",
            PurgeResultLabel::Partial => "partial",
            PurgeResultLabel::Empty => "empty",
            PurgeResultLabel::InvalidFilter => "invalid_filter",
            PurgeResultLabel::DiscoveryError => "discovery_error",
        }
    }
}

pub fn observe_request(result: PurgeResultLabel) {
    PURGE_REQUESTS.with_label_values(&[result.as_str()]).inc();
}

pub fn observe_fanout(aggregate: &Aggregate, elapsed: Duration) {
    TARGET_OUTCOMES
        .with_label_values(&["success"])
        .inc_by(aggregate.succeeded.len() as u64);
    TARGET_OUTCOMES
        .with_label_values(&["error"])
        .inc_by(aggregate.failed.len() as u64);
    TARGET_OUTCOMES
        .with_label_values(&["pending"])
        .inc_by(aggregate.pending.len() as u64);
    FANOUT_LATENCY.observe(elapsed.as_secs_f64() * 1000.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{discovery::Target, fanout::Failed};

    #[test]
    fn test_observe_fanout() {
        let before = TARGET_OUTCOMES.with_label_values(&["error"]).get();
        let aggregate = Aggregate {
            failed: vec![Failed {
                target: Target::new("10.0.0.1", 80),
                error: "refused".into(),
            }],
            ..Default::default()
        };
        observe_fanout(&aggregate, Duration::from_millis(12));
        assert!(TARGET_OUTCOMES.with_label_values(&["error"]).get() >= before + 1);
    }

    #[test]
    fn test_observe_request() {
        let before = PURGE_REQUESTS.with_label_values(&["empty"]).get();
        observe_request(PurgeResultLabel::Empty);
        assert!(PURGE_REQUESTS.with_label_values(&["empty"]).get() >= before + 1);
    }
}
