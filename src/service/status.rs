use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use http::{Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use super::{json_response, not_found_response};
use crate::config::Status;

/// Set once configuration is loaded and the inventory is wired up.
static READY: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() {
    READY.store(true, Ordering::SeqCst);
    log::info!("Configuration loaded, purge proxy is ready");
}

pub fn is_ready() -> bool {
    READY.load(Ordering::SeqCst)
}

#[cfg(test)]
fn reset() {
    READY.store(false, Ordering::SeqCst);
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Readiness probe, served on its own listener so load balancers and
/// orchestrators can poll it without issuing purges.
pub struct StatusHttpApp;

impl StatusHttpApp {
    pub fn status_http_service(cfg: &Status) -> Service<Self> {
        let mut service = Service::new("Status HTTP".to_string(), Self);
        service.add_tcp(&cfg.address.to_string());
        service
    }
}

#[async_trait]
impl ServeHttp for StatusHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        match http_session.req_header().uri.path() {
            "/status/ready" => ready_response(),
            _ => not_found_response(),
        }
    }
}

fn ready_response() -> Response<Vec<u8>> {
    if is_ready() {
        let response = StatusResponse {
            status: "ok".to_string(),
            error: None,
        };
        json_response(StatusCode::OK, &response, &[])
    } else {
        let response = StatusResponse {
            status: "error".to_string(),
            error: Some("Configuration not loaded yet".to_string()),
        };
        json_response(StatusCode::SERVICE_UNAVAILABLE, &response, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_response() {
        reset();
        let response = ready_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(String::from_utf8_lossy(response.body()).contains("not loaded"));

        mark_ready();
        let response = ready_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_slice(), br#"{"status":"ok"}"#);
        assert_eq!(response.headers()["content-type"], "application/json");
    }
}
