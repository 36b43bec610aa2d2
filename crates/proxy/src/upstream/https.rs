//! DNS-over-HTTPS driver (RFC 8484).
//!
//! Queries go out as HTTP POST with `application/dns-message` bodies; the
//! response body is the raw wire-form answer. One shared HTTP/2 client pools
//! connections across all DoH upstreams.

use super::{check_response_id, Upstream};
use crate::codec;
use async_trait::async_trait;
use corten_dns_domain::ProxyError;
use hickory_proto::op::Message;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

pub(crate) const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(4)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

pub struct HttpsUpstream {
    url: String,
    timeout: Duration,
}

impl HttpsUpstream {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self { url, timeout }
    }
}

#[async_trait]
impl Upstream for HttpsUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message, ProxyError> {
        let wire = codec::pack(request)?;

        let response = tokio::time::timeout(
            self.timeout,
            SHARED_CLIENT
                .post(&self.url)
                .header("Content-Type", DNS_MESSAGE_CONTENT_TYPE)
                .header("Accept", DNS_MESSAGE_CONTENT_TYPE)
                .body(wire)
                .send(),
        )
        .await
        .map_err(|_| ProxyError::TransportTimeout {
            server: self.url.clone(),
        })?
        .map_err(|e| ProxyError::Transport {
            server: self.url.clone(),
            message: format!("request failed: {}", e),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::HttpStatus {
                server: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let body = tokio::time::timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| ProxyError::TransportTimeout {
                server: self.url.clone(),
            })?
            .map_err(|e| ProxyError::Transport {
                server: self.url.clone(),
                message: format!("failed to read response body: {}", e),
            })?;

        debug!(url = %self.url, response_len = body.len(), "DoH response received");

        let reply = codec::unpack(&body)?;
        check_response_id(&self.url, request, &reply)?;
        Ok(reply)
    }

    fn address(&self) -> &str {
        &self.url
    }
}
