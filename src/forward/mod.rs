//! Relaying one purge request to one target.
//!
//! Every forwarder owns an [`OutcomeReporter`] that writes exactly one
//! [`ForwardOutcome`] into the shared result sink and decrements the shared
//! [`CompletionCounter`] exactly once, on whichever path the forwarder leaves.

pub mod client;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{uri::PathAndQuery, Method};
use log::{debug, warn};
use pingora_http::RequestHeader;
use serde::Serialize;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Notify,
};

use crate::{
    discovery::Target,
    error::{PurgeError, PurgeResult},
};

pub use client::{new_timeout_client, TimeoutClient};

/// The parts of the inbound request that are relayed to every target.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub body: Bytes,
}

impl RequestTemplate {
    pub fn new(method: Method, body: Bytes) -> Self {
        Self { method, body }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The round trip completed; `status` is whatever the target answered.
    Success { status: u16 },
    Error(String),
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }
}

/// An outcome tagged with the target it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub target: Target,
    pub outcome: Outcome,
}

pub type ResultSink = mpsc::Sender<ForwardOutcome>;
pub type ResultDrain = mpsc::Receiver<ForwardOutcome>;

/// Creates a sink able to hold one outcome per target without blocking.
pub fn result_sink(targets: usize) -> (ResultSink, ResultDrain) {
    mpsc::channel(targets.max(1))
}

struct CounterInner {
    remaining: AtomicUsize,
    zero: Notify,
}

/// Countdown shared between forwarders and the task waiting on them.
#[derive(Clone)]
pub struct CompletionCounter {
    inner: Arc<CounterInner>,
}

impl CompletionCounter {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(CounterInner {
                remaining: AtomicUsize::new(count),
                zero: Notify::new(),
            }),
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    fn decrement(&self) {
        let previous = self.inner.remaining.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |remaining| remaining.checked_sub(1),
        );
        match previous {
            Ok(1) => self.inner.zero.notify_waiters(),
            Ok(_) => {}
            Err(_) => warn!("Completion counter decremented below zero"),
        }
    }

    /// Resolves once the counter reaches zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.zero.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// One target's slot in the shared sink and counter.
///
/// Dropping a reporter that never reported writes an error outcome, so a
/// forwarder that panics or is cancelled is still accounted for.
pub struct OutcomeReporter {
    target: Target,
    sink: ResultSink,
    counter: CompletionCounter,
    reported: bool,
}

impl OutcomeReporter {
    pub fn new(target: Target, sink: ResultSink, counter: CompletionCounter) -> Self {
        Self {
            target,
            sink,
            counter,
            reported: false,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn report(mut self, outcome: Outcome) {
        self.send(outcome);
        self.reported = true;
    }

    fn send(&self, outcome: Outcome) {
        let outcome = ForwardOutcome {
            target: self.target.clone(),
            outcome,
        };
        match self.sink.try_send(outcome) {
            Ok(()) => {}
            Err(TrySendError::Closed(outcome)) => {
                debug!("Result sink closed, dropping late outcome for {}", outcome.target)
            }
            Err(TrySendError::Full(outcome)) => {
                warn!("Result sink full, dropping outcome for {}", outcome.target)
            }
        }
    }
}

impl Drop for OutcomeReporter {
    fn drop(&mut self) {
        if !self.reported {
            self.send(Outcome::Error("forwarder exited without an outcome".to_string()));
        }
        self.counter.decrement();
    }
}

/// Relays `template` to the reporter's target at `path` and reports the
/// outcome.
///
/// Request construction errors (bad path, port 0) are reported without
/// touching the network. Transport errors and timeouts become
/// [`Outcome::Error`]; any completed round trip is a [`Outcome::Success`].
pub async fn forward_request(
    template: &RequestTemplate,
    client: &TimeoutClient,
    path: &str,
    reporter: OutcomeReporter,
) {
    let target = reporter.target().clone();
    let outcome = match send(template, client, path, &target).await {
        Ok(status) => {
            debug!("Purged {path} on {target}: {status}");
            Outcome::Success { status }
        }
        Err(e) => {
            warn!("Purge of {path} on {target} failed: {e}");
            Outcome::Error(e.to_string())
        }
    };
    reporter.report(outcome);
}

async fn send(
    template: &RequestTemplate,
    client: &TimeoutClient,
    path: &str,
    target: &Target,
) -> PurgeResult<u16> {
    let request = build_request(template, target, path)?;
    client.send(target, request, template.body.clone()).await
}

/// Builds `<METHOD> <path>` with `Host` set to the target.
pub fn build_request(
    template: &RequestTemplate,
    target: &Target,
    path: &str,
) -> PurgeResult<RequestHeader> {
    validate_path(path)?;
    if target.port == 0 {
        return Err(PurgeError::Forward(format!(
            "invalid port 0 for {}",
            target.host
        )));
    }

    let mut request = RequestHeader::build(template.method.clone(), path.as_bytes(), None)?;
    request.insert_header("Host", target.authority())?;
    if !template.body.is_empty() {
        request.insert_header("Content-Length", template.body.len().to_string())?;
    }
    Ok(request)
}

/// Accepts origin-form paths only: a leading `/` and well-formed `%XX`
/// escapes.
fn validate_path(path: &str) -> PurgeResult<()> {
    if !path.starts_with('/') {
        return Err(PurgeError::Forward(format!(
            "invalid path {path:?}: must start with '/'"
        )));
    }

    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            match bytes.get(i + 1..i + 3) {
                Some([hi, lo]) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => i += 3,
                _ => {
                    return Err(PurgeError::Forward(format!(
                        "invalid path {path:?}: invalid URL escape at byte {i}"
                    )))
                }
            }
        } else {
            i += 1;
        }
    }

    PathAndQuery::try_from(path)
        .map(|_| ())
        .map_err(|e| PurgeError::Forward(format!("invalid path {path:?}: {e}")))
}
