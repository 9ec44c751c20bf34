//! Dispatching one purge to every target and collecting the results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Serialize;
use tokio::time::timeout;

use crate::{
    config,
    discovery::Target,
    forward::{
        forward_request, new_timeout_client, result_sink, CompletionCounter, ForwardOutcome,
        Outcome, OutcomeReporter, RequestTemplate, TimeoutClient,
    },
    metrics,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivered {
    #[serde(flatten)]
    pub target: Target,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failed {
    #[serde(flatten)]
    pub target: Target,
    pub error: String,
}

/// Tally of one fan-out.
///
/// Every dispatched target lands in exactly one of the three lists; `pending`
/// holds the ones that had not reported when the deadline elapsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Aggregate {
    pub succeeded: Vec<Delivered>,
    pub failed: Vec<Failed>,
    pub pending: Vec<Target>,
}

impl Aggregate {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.pending.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.pending.is_empty()
    }

    fn collect(targets: &[Target], outcomes: Vec<ForwardOutcome>) -> Self {
        let mut waiting: BTreeMap<&Target, usize> = BTreeMap::new();
        for target in targets {
            *waiting.entry(target).or_default() += 1;
        }

        let mut aggregate = Aggregate::default();
        for ForwardOutcome { target, outcome } in outcomes {
            match waiting.get_mut(&target) {
                Some(count) if *count > 0 => *count -= 1,
                _ => {
                    warn!("Ignoring unexpected outcome for {target}");
                    continue;
                }
            }
            match outcome {
                Outcome::Success { status } => {
                    aggregate.succeeded.push(Delivered { target, status })
                }
                Outcome::Error(error) => aggregate.failed.push(Failed { target, error }),
            }
        }

        for (target, count) in waiting {
            aggregate
                .pending
                .extend(std::iter::repeat(target.clone()).take(count));
        }
        aggregate
    }
}

/// Runs forwarders in parallel under an overall deadline.
#[derive(Clone)]
pub struct FanOut {
    client: TimeoutClient,
    deadline: Duration,
}

impl FanOut {
    pub fn new(client: TimeoutClient, deadline: Duration) -> Self {
        Self { client, deadline }
    }

    pub fn from_config(client: &config::Client, fanout: &config::FanOut) -> Self {
        Self::new(new_timeout_client(client), fanout.deadline())
    }

    /// Sends `template` to every target at `path`.
    ///
    /// Returns when all forwarders have reported or the deadline elapses,
    /// whichever comes first. Forwarders still running after the deadline
    /// finish on their own; their outcomes are discarded.
    pub async fn run(
        &self,
        template: RequestTemplate,
        targets: &[Target],
        path: &str,
    ) -> Aggregate {
        let started = Instant::now();
        let template = Arc::new(template);
        let path: Arc<str> = Arc::from(path);

        let (sink, mut drain) = result_sink(targets.len());
        let counter = CompletionCounter::new(targets.len());

        for target in targets {
            let reporter = OutcomeReporter::new(target.clone(), sink.clone(), counter.clone());
            let template = template.clone();
            let client = self.client.clone();
            let path = path.clone();
            tokio::spawn(async move {
                forward_request(&template, &client, &path, reporter).await;
            });
        }
        drop(sink);

        if timeout(self.deadline, counter.wait()).await.is_err() {
            warn!(
                "Purge of {path} hit the {}ms deadline with {} of {} targets outstanding",
                self.deadline.as_millis(),
                counter.remaining(),
                targets.len()
            );
        }

        let mut outcomes = Vec::with_capacity(targets.len());
        while let Ok(outcome) = drain.try_recv() {
            outcomes.push(outcome);
        }
        drop(drain);

        let aggregate = Aggregate::collect(targets, outcomes);
        info!(
            "Purge of {path}: {} succeeded, {} failed, {} pending in {}ms",
            aggregate.succeeded.len(),
            aggregate.failed.len(),
            aggregate.pending.len(),
            started.elapsed().as_millis()
        );
        metrics::observe_fanout(&aggregate, started.elapsed());
        aggregate
    }
}
