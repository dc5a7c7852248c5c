//! The replay client
//!
//! One [`ReplayClient`] per destination. Each [`send`](ReplayClient::send)
//! call is independent: it rewrites the request to origin-form, performs a
//! round trip on its own connection and follows redirects while the per-call
//! budget lasts. The client holds no mutable state, so a single instance can
//! serve any number of concurrent calls behind an `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::response::{self, InboundMessage};
use crate::rewrite;
use crate::trace::{Direction, LogSink, TraceSink};
use crate::transport::Connector;

/// Process-wide id for telling concurrent calls apart in traces
static NEXT_CALL: AtomicU64 = AtomicU64::new(1);

/// Outcome of one `send` call
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Raw bytes of the final response, empty if the peer hung up
    pub raw: Vec<u8>,
    /// The final response decoded, if it was HTTP at all
    pub message: Option<InboundMessage>,
    /// Redirects followed before the final response
    pub redirects: usize,
}

impl Exchange {
    pub fn status(&self) -> Option<u16> {
        self.message.as_ref().map(InboundMessage::status)
    }
}

pub struct ReplayClient {
    endpoint: Endpoint,
    config: ClientConfig,
    connector: Connector,
    trace: Arc<dyn TraceSink>,
}

impl ReplayClient {
    /// Create a client for `destination`, tracing through [`LogSink`]
    pub fn new(destination: &str, config: ClientConfig) -> Self {
        Self::with_trace_sink(destination, config, Arc::new(LogSink))
    }

    pub fn with_trace_sink(
        destination: &str,
        config: ClientConfig,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        let endpoint = Endpoint::resolve(destination);
        let connector = Connector::new(&endpoint, &config);
        info!(base_url = %endpoint, tls = endpoint.use_tls(), "Replay client ready");
        Self {
            endpoint,
            config,
            connector,
            trace,
        }
    }

    /// `scheme://host:port` of the destination
    pub fn base_url(&self) -> String {
        self.endpoint.base_url()
    }

    pub fn use_tls(&self) -> bool {
        self.endpoint.use_tls()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Replay one raw request and return the raw bytes of the final response
    pub async fn send(&self, request: &[u8]) -> Result<Vec<u8>> {
        self.exchange(request).await.map(|exchange| exchange.raw)
    }

    /// Like [`send`](Self::send), also returning the decoded response
    pub async fn exchange(&self, request: &[u8]) -> Result<Exchange> {
        let call = NEXT_CALL.fetch_add(1, Ordering::Relaxed);
        let mut payload = rewrite::prepare(request, &self.endpoint, &self.config).into_owned();
        let mut remaining = self.config.follow_redirects;
        let mut redirects = 0;

        loop {
            let is_head = rewrite::method(&payload) == Some("HEAD");
            let raw = self.round_trip(call, &payload, is_head).await?;
            let message = response::decode(&raw, is_head);

            let location = message
                .as_ref()
                .filter(|msg| msg.is_redirect() && remaining > 0)
                .and_then(|msg| msg.header("Location"))
                .map(str::to_string);
            let Some(location) = location else {
                debug!(
                    call,
                    status = message.as_ref().map(InboundMessage::status),
                    bytes = raw.len(),
                    redirects,
                    "Replay done"
                );
                return Ok(Exchange { raw, message, redirects });
            };

            remaining -= 1;
            redirects += 1;
            debug!(call, %location, remaining, "Following redirect");
            payload = rewrite::redirect_request(&location, &self.endpoint);
        }
    }

    async fn round_trip(&self, call: u64, payload: &[u8], is_head: bool) -> Result<Vec<u8>> {
        if self.config.debug_trace {
            self.trace.record(call, Direction::Outbound, payload);
        }
        let raw = self.connector.round_trip(call, payload, is_head).await?;
        if self.config.debug_trace {
            self.trace.record(call, Direction::Inbound, &raw);
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let cases = [
            ("http://example.com", "http://example.com:80"),
            ("https://example.com", "https://example.com:443"),
            ("https://example.com:1", "https://example.com:1"),
            ("example.com", "http://example.com:80"),
        ];
        for (destination, expected) in cases {
            let client = ReplayClient::new(destination, ClientConfig::default());
            assert_eq!(client.base_url(), expected);
        }
        assert!(ReplayClient::new("https://example.com", ClientConfig::default()).use_tls());
    }

    #[test]
    fn test_client_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ReplayClient>();
    }
}
