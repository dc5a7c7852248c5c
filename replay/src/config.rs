//! Replay client options

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for a [`ReplayClient`](crate::ReplayClient)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Mirror every request and response to the trace sink
    #[serde(default)]
    pub debug_trace: bool,

    /// Additional round trips allowed on a 3xx response (0 = don't follow)
    #[serde(default)]
    pub follow_redirects: usize,

    /// Deadline for TCP connect and TLS handshake, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Deadline for writing the request and reading the response of one
    /// round trip, in milliseconds (0 = no deadline)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Stop reading a response once this many bytes are buffered
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,

    /// Replace the `Host` header with the destination authority
    #[serde(default)]
    pub rewrite_host: bool,

    /// Verify the destination certificate against the webpki roots
    #[serde(default)]
    pub tls_verify: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            debug_trace: false,
            follow_redirects: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            timeout_ms: default_timeout_ms(),
            max_response_size: default_max_response_size(),
            rewrite_host: false,
            tls_verify: false,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero(self.connect_timeout_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        non_zero(self.timeout_ms)
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_response_size() -> usize {
    10 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(!config.debug_trace);
        assert_eq!(config.follow_redirects, 0);
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.max_response_size, 10 * 1024 * 1024);
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let config = ClientConfig { timeout_ms: 0, ..Default::default() };
        assert_eq!(config.timeout(), None);
    }
}
