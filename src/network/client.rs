//! Outbound side of the transport: delivering an event record to one peer.

use crate::error::TransportError;
use crate::types::EventRecord;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// "Send an event record to a peer address, get a response or an error."
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// `Ok(None)` means the peer answered with no usable body.
    async fn send(&self, peer: &str, record: &EventRecord)
        -> Result<Option<Value>, TransportError>;
}

/// JSON-over-HTTP peer client. Posts to `{peer}/{prefix}`.
pub struct HttpPeerClient {
    client: reqwest::Client,
    prefix: String,
}

impl HttpPeerClient {
    pub fn new(prefix: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))?;

        Ok(Self {
            client,
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, peer: &str) -> String {
        format!("{}/{}", peer.trim_end_matches('/'), self.prefix)
    }
}

#[async_trait]
impl PeerTransport for HttpPeerClient {
    async fn send(
        &self,
        peer: &str,
        record: &EventRecord,
    ) -> Result<Option<Value>, TransportError> {
        if !(peer.starts_with("http://") || peer.starts_with("https://")) {
            return Err(TransportError::InvalidPeer(peer.to_string()));
        }

        let url = self.endpoint(peer);
        let request_error = |e: reqwest::Error| TransportError::Request {
            peer: peer.to_string(),
            message: e.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(record)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(request_error)?;
        debug!(
            "📨 {} answered {} for {} ({} bytes)",
            url,
            status,
            record.event_id,
            body.len()
        );

        // Empty or undecodable body: the peer answered, just not with JSON
        if body.is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_slice::<Value>(&body)
            .ok()
            .filter(|v| !v.is_null()))
    }
}
