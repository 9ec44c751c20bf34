use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions};
use tokio::sync::Mutex;

use super::{select_targets, Inventory, Target};
use crate::{
    config::{Etcd, Host},
    error::{PurgeError, PurgeResult},
    filter::Criteria,
};

/// Inventory stored in etcd: one JSON host record per key under a prefix.
///
/// ```json
/// {"host": "10.0.0.1", "port": 6081, "tags": {"env": "prod"}}
/// ```
pub struct EtcdInventory {
    config: Etcd,
    client: Mutex<Option<Client>>,
}

impl EtcdInventory {
    pub fn new(config: Etcd) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    /// 创建一个新的 etcd 客户端
    async fn create_client(&self) -> PurgeResult<Client> {
        let mut options = ConnectOptions::default();
        if let Some(timeout) = self.config.timeout {
            options = options.with_timeout(Duration::from_secs(timeout as u64));
        };
        if let Some(connect_timeout) = self.config.connect_timeout {
            options = options.with_connect_timeout(Duration::from_secs(connect_timeout as u64));
        };
        if let (Some(user), Some(password)) = (&self.config.user, &self.config.password) {
            options = options.with_user(user.clone(), password.clone());
        };

        let client = Client::connect(self.config.host.clone(), Some(options)).await?;
        Ok(client)
    }

    async fn list(&self) -> PurgeResult<Vec<Host>> {
        let mut client_guard = self.client.lock().await;
        if client_guard.is_none() {
            log::info!("Creating new etcd client...");
            *client_guard = Some(self.create_client().await?);
        }
        let client = client_guard
            .as_mut()
            .ok_or_else(|| PurgeError::Discovery("etcd client is not initialized".into()))?;

        let options = GetOptions::new().with_prefix();
        let response = client
            .get(self.config.prefix.as_bytes(), Some(options))
            .await;
        match response {
            Ok(response) => Ok(response
                .kvs()
                .iter()
                .filter_map(|kv| decode_host(kv.key(), kv.value()))
                .collect()),
            Err(err) => {
                // 重置客户端以便重试
                *client_guard = None;
                Err(err.into())
            }
        }
    }
}

fn decode_host(key: &[u8], value: &[u8]) -> Option<Host> {
    match serde_json::from_slice::<Host>(value) {
        Ok(host) if host.port != 0 => Some(host),
        Ok(_) => {
            log::warn!("Skipping host record {}: port 0", String::from_utf8_lossy(key));
            None
        }
        Err(e) => {
            log::warn!(
                "Skipping malformed host record {}: {e}",
                String::from_utf8_lossy(key)
            );
            None
        }
    }
}

#[async_trait]
impl Inventory for EtcdInventory {
    async fn describe(&self, criteria: &Criteria) -> PurgeResult<Vec<Target>> {
        let hosts = self.list().await?;
        let targets = select_targets(&hosts, criteria);
        log::debug!(
            "Etcd inventory matched {} of {} hosts under {}",
            targets.len(),
            hosts.len(),
            self.config.prefix
        );
        Ok(targets)
    }

    fn name(&self) -> &'static str {
        "etcd"
    }
}
