use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pingora::upstreams::peer::HttpPeer;
use pingora_core::connectors::http::Connector;
use pingora_http::RequestHeader;
use tokio::{net::lookup_host, time::timeout};

use crate::{
    config,
    discovery::Target,
    error::{PurgeError, PurgeResult},
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client whose every exchange completes or fails within a fixed budget.
///
/// The connect timeout bounds TCP establishment; the total timeout bounds
/// resolution, connect, request write and the full response read. One
/// attempt per call, no retries. Cheap to clone; clones share one
/// connection pool.
#[derive(Clone)]
pub struct TimeoutClient {
    connector: Arc<Connector>,
    connect_timeout: Duration,
    total_timeout: Duration,
}

/// Builds a [`TimeoutClient`] from the `client` section of the config.
pub fn new_timeout_client(conf: &config::Client) -> TimeoutClient {
    TimeoutClient::new(conf.connect_timeout(), conf.total_timeout())
}

impl TimeoutClient {
    pub fn new(connect_timeout: Duration, total_timeout: Duration) -> Self {
        Self {
            connector: Arc::new(Connector::new(None)),
            connect_timeout,
            total_timeout,
        }
    }

    fn peer(&self, addr: SocketAddr, target: &Target) -> HttpPeer {
        let mut peer = HttpPeer::new(addr, false, target.host.clone());
        peer.options.connection_timeout = Some(self.connect_timeout);
        peer.options.total_connection_timeout = Some(self.connect_timeout);
        peer.options.read_timeout = Some(self.total_timeout);
        peer
    }

    /// Sends `request` to `target` and returns the response status once the
    /// body has been fully drained.
    pub async fn send(
        &self,
        target: &Target,
        request: RequestHeader,
        body: Bytes,
    ) -> PurgeResult<u16> {
        match timeout(self.total_timeout, self.exchange(target, request, body)).await {
            Ok(result) => result,
            Err(_) => Err(PurgeError::Forward(format!(
                "{target} did not respond within {}ms",
                self.total_timeout.as_millis()
            ))),
        }
    }

    async fn exchange(
        &self,
        target: &Target,
        request: RequestHeader,
        body: Bytes,
    ) -> PurgeResult<u16> {
        let addr = lookup_host((target.host.as_str(), target.port))
            .await?
            .next()
            .ok_or_else(|| PurgeError::Forward(format!("{} did not resolve", target.host)))?;
        let peer = self.peer(addr, target);

        let (mut session, _reused) = self.connector.get_http_session(&peer).await?;
        session.write_request_header(Box::new(request)).await?;
        if !body.is_empty() {
            session.write_request_body(body, true).await?;
        }
        session.finish_request_body().await?;

        session.read_response_header().await?;
        let status = session
            .response_header()
            .map(|header| header.status.as_u16())
            .ok_or_else(|| PurgeError::Forward(format!("{target} sent no response header")))?;

        // drain so the connection can go back to the pool
        while session.read_response_body().await?.is_some() {}
        self.connector
            .release_http_session(session, &peer, Some(IDLE_TIMEOUT))
            .await;

        Ok(status)
    }
}
