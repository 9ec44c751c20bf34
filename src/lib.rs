//! purge-proxy relays one cache-invalidation request to every cache server
//! matching a set of `KEY:VALUE` tags and answers with the aggregate outcome.
//!
//! The pieces, leaves first: [`filter`] turns tags into inventory criteria,
//! [`discovery`] resolves criteria into targets, [`forward`] relays to one
//! target under a bounded timeout, [`fanout`] runs forwarders in parallel and
//! tallies them, and [`service`] exposes it all over HTTP.

pub mod config;
pub mod discovery;
pub mod error;
pub mod fanout;
pub mod filter;
pub mod forward;
pub mod logging;
pub mod metrics;
pub mod service;
