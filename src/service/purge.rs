use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{Response, StatusCode};
use log::{error, info};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;
use uuid::Uuid;

use super::json_response;
use crate::{
    config::Config,
    discovery::Inventory,
    fanout::{Aggregate, FanOut},
    filter::build_filter,
    forward::RequestTemplate,
    metrics::{self, PurgeResultLabel},
};

/// Response body of one purge.
#[derive(Debug, Serialize)]
pub struct PurgeReport {
    pub request_id: String,
    pub path: String,
    pub targets: usize,
    #[serde(flatten)]
    pub aggregate: Aggregate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PurgeReport {
    fn new(path: &str) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            path: path.to_string(),
            targets: 0,
            aggregate: Aggregate::default(),
            error: None,
        }
    }
}

/// The purge endpoint.
///
/// Every inbound request, whatever its method or path, is relayed with the
/// same method, path and body to every host matching the configured tags.
/// Status policy:
/// - 200 when every target answered (or nothing matched and that is allowed)
/// - 502 when any target failed or did not answer before the deadline
/// - 503 when the inventory fails, or nothing matched and that is an error
/// - 500 when the configured tags are invalid
pub struct PurgeHttpApp {
    tags: Vec<String>,
    inventory: Arc<dyn Inventory>,
    fanout: FanOut,
    fail_on_empty: bool,
}

impl PurgeHttpApp {
    pub fn new(
        tags: Vec<String>,
        inventory: Arc<dyn Inventory>,
        fanout: FanOut,
        fail_on_empty: bool,
    ) -> Self {
        Self {
            tags,
            inventory,
            fanout,
            fail_on_empty,
        }
    }

    pub fn from_config(cfg: &Config, inventory: Arc<dyn Inventory>) -> Self {
        Self::new(
            cfg.tags.clone(),
            inventory,
            FanOut::from_config(&cfg.client, &cfg.fanout),
            cfg.fanout.fail_on_empty,
        )
    }

    pub fn purge_http_service(cfg: &Config, inventory: Arc<dyn Inventory>) -> Service<Self> {
        let app = Self::from_config(cfg, inventory);
        let mut service = Service::new("Purge HTTP".to_string(), app);
        service.add_tcp(&cfg.listener.address.to_string());
        service
    }

    pub async fn purge(&self, template: RequestTemplate, path: &str) -> (StatusCode, PurgeReport) {
        let mut report = PurgeReport::new(path);

        let criteria = match build_filter(&self.tags) {
            Ok(criteria) => criteria,
            Err(e) => {
                error!("[{}] Invalid tag configuration: {e}", report.request_id);
                metrics::observe_request(PurgeResultLabel::InvalidFilter);
                report.error = Some(e.to_string());
                return (StatusCode::INTERNAL_SERVER_ERROR, report);
            }
        };

        let targets = match self.inventory.describe(&criteria).await {
            Ok(targets) => targets,
            Err(e) => {
                error!(
                    "[{}] Host discovery via {} inventory failed: {e}",
                    report.request_id,
                    self.inventory.name()
                );
                metrics::observe_request(PurgeResultLabel::DiscoveryError);
                report.error = Some(e.to_string());
                return (StatusCode::SERVICE_UNAVAILABLE, report);
            }
        };
        report.targets = targets.len();

        if targets.is_empty() {
            metrics::observe_request(PurgeResultLabel::Empty);
            info!(
                "[{}] No hosts match {}, nothing to purge",
                report.request_id,
                self.tags.join(",")
            );
            if self.fail_on_empty {
                report.error = Some(format!("no hosts match {}", self.tags.join(",")));
                return (StatusCode::SERVICE_UNAVAILABLE, report);
            }
            return (StatusCode::OK, report);
        }

        info!(
            "[{}] {} {path} -> {} hosts",
            report.request_id,
            template.method,
            targets.len()
        );
        report.aggregate = self.fanout.run(template, &targets, path).await;

        if report.aggregate.is_success() {
            metrics::observe_request(PurgeResultLabel::Ok);
            (StatusCode::OK, report)
        } else {
            metrics::observe_request(PurgeResultLabel::Partial);
            (StatusCode::BAD_GATEWAY, report)
        }
    }
}

#[async_trait]
impl ServeHttp for PurgeHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        let (method, path) = {
            let req_header = http_session.req_header();
            let path = req_header
                .uri
                .path_and_query()
                .map_or_else(|| "/".to_string(), |pq| pq.to_string());
            (req_header.method.clone(), path)
        };

        let body = match read_request_body(http_session).await {
            Ok(body) => body,
            Err(e) => {
                let mut report = PurgeReport::new(&path);
                report.error = Some(format!("Failed to read request body: {e}"));
                return json_response(StatusCode::BAD_REQUEST, &report, &[]);
            }
        };

        let (status, report) = self.purge(RequestTemplate::new(method, body), &path).await;
        let request_id = report.request_id.clone();
        json_response(status, &report, &[("X-Request-Id", request_id)])
    }
}

async fn read_request_body(http_session: &mut ServerSession) -> pingora_error::Result<Bytes> {
    let mut body = BytesMut::new();
    while let Some(bytes) = http_session.read_request_body().await? {
        body.extend_from_slice(&bytes);
    }
    Ok(body.freeze())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::{
        config::Host,
        discovery::{StaticInventory, Target},
        error::{PurgeError, PurgeResult},
        filter::Criteria,
        forward::tests::{dead_target, live_target, purge_template, test_client},
    };

    struct Unreachable;

    #[async_trait]
    impl Inventory for Unreachable {
        async fn describe(&self, _criteria: &Criteria) -> PurgeResult<Vec<Target>> {
            Err(PurgeError::Discovery("inventory unavailable".into()))
        }

        fn name(&self) -> &'static str {
            "unreachable"
        }
    }

    fn varnish(target: &Target, env: &str) -> Host {
        Host {
            host: target.host.clone(),
            port: target.port,
            tags: HashMap::from([
                ("machinetype".to_string(), "varnish".to_string()),
                ("env".to_string(), env.to_string()),
            ]),
        }
    }

    fn app(tags: &[&str], inventory: Arc<dyn Inventory>, fail_on_empty: bool) -> PurgeHttpApp {
        PurgeHttpApp::new(
            tags.iter().map(|t| t.to_string()).collect(),
            inventory,
            FanOut::new(test_client(), Duration::from_secs(5)),
            fail_on_empty,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_purge_all_targets_succeed() {
        let (stage_a, hits_a) = live_target(200).await;
        let (stage_b, hits_b) = live_target(200).await;
        let (prod, hits_prod) = live_target(200).await;
        let inventory = Arc::new(StaticInventory::new(vec![
            varnish(&stage_a, "stage"),
            varnish(&stage_b, "stage"),
            varnish(&prod, "prod"),
        ]));

        let app = app(&["machinetype:varnish", "env:stage"], inventory, false);
        let (status, report) = app.purge(purge_template(), "/index.html").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(report.targets, 2);
        assert_eq!(report.aggregate.succeeded.len(), 2);
        assert!(report.error.is_none());
        assert_eq!(hits_a.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(hits_prod.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_purge_reports_failed_targets() {
        let (live, _) = live_target(200).await;
        let dead = dead_target().await;
        let inventory = Arc::new(StaticInventory::new(vec![
            varnish(&live, "stage"),
            varnish(&dead, "stage"),
        ]));

        let app = app(&["env:stage"], inventory, false);
        let (status, report) = app.purge(purge_template(), "/").await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(report.targets, 2);
        assert_eq!(report.aggregate.failed.len(), 1);
        assert_eq!(report.aggregate.failed[0].target, dead);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["failed"][0]["port"], dead.port);
        assert_eq!(json["succeeded"][0]["status"], 200);
    }

    #[tokio::test]
    async fn test_purge_no_targets_is_noop_by_default() {
        let inventory = Arc::new(StaticInventory::new(vec![]));
        let (status, report) = app(&["env:stage"], inventory, false)
            .purge(purge_template(), "/")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report.targets, 0);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn test_purge_no_targets_fails_when_configured() {
        let inventory = Arc::new(StaticInventory::new(vec![]));
        let (status, report) = app(&["env:stage"], inventory, true)
            .purge(purge_template(), "/")
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(report.error.as_deref(), Some("no hosts match env:stage"));
    }

    #[tokio::test]
    async fn test_purge_discovery_error() {
        let (status, report) = app(&["env:stage"], Arc::new(Unreachable), false)
            .purge(purge_template(), "/")
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            report.error.as_deref(),
            Some("Discovery failed: inventory unavailable")
        );
    }

    #[tokio::test]
    async fn test_purge_invalid_tags() {
        let (status, report) = app(&["machinetypevarnish"], Arc::new(Unreachable), false)
            .purge(purge_template(), "/")
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            report.error.as_deref(),
            Some("expected TAG:VALUE got machinetypevarnish")
        );
    }
}
