//! Resolving tag criteria into the set of hosts to purge.

pub mod cache;
pub mod etcd;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::{config::Host, error::PurgeResult, filter::Criteria};

pub use cache::CachedInventory;
pub use etcd::EtcdInventory;

/// One cache server to relay a purge to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// `host` is stored unbracketed (`::1`, not `[::1]`) so it can be handed
    /// to the resolver as is.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(bare) => bare.to_string(),
            None => host,
        };
        Self { host, port }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

impl From<&Host> for Target {
    fn from(host: &Host) -> Self {
        Target::new(host.host.clone(), host.port)
    }
}

/// Source of truth for which cache servers exist and how they are tagged.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Returns every host matching `criteria`, deduplicated and sorted.
    async fn describe(&self, criteria: &Criteria) -> PurgeResult<Vec<Target>>;

    fn name(&self) -> &'static str;
}

/// Applies `criteria` to host records and returns the matching targets.
pub fn select_targets<'a, I>(hosts: I, criteria: &Criteria) -> Vec<Target>
where
    I: IntoIterator<Item = &'a Host>,
{
    hosts
        .into_iter()
        .filter(|host| criteria.matches(&host.tags))
        .map(Target::from)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Inventory backed by the host list in the configuration file.
pub struct StaticInventory {
    hosts: Vec<Host>,
}

impl StaticInventory {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn describe(&self, criteria: &Criteria) -> PurgeResult<Vec<Target>> {
        let targets = select_targets(&self.hosts, criteria);
        log::debug!(
            "Static inventory matched {} of {} hosts",
            targets.len(),
            self.hosts.len()
        );
        Ok(targets)
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
