//! Configuration file parser for httpreplay
//!
//! Supports replay.yml with the destination, client options and
//! concurrency limit.

use anyhow::{Context, Result};
use httpreplay::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Where captured requests are replayed to
    #[serde(default)]
    pub destination: String,

    /// Maximum number of requests in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Replay client options
    #[serde(default)]
    pub client: ClientConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            destination: String::new(),
            concurrency: default_concurrency(),
            client: ClientConfig::default(),
        }
    }
}

fn default_concurrency() -> usize {
    8
}

impl ReplayConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.destination.trim().is_empty() {
            anyhow::bail!("No destination configured (use --destination or the config file)");
        }
        if self.concurrency == 0 {
            anyhow::bail!("Concurrency must be at least 1");
        }
        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["replay.yml", "replay.yaml", ".replay.yml", ".replay.yaml"];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
destination: https://staging.example.com:8443
concurrency: 4
client:
  follow_redirects: 2
  debug_trace: true
  timeout_ms: 1500
"#;
        let config: ReplayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.destination, "https://staging.example.com:8443");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.client.follow_redirects, 2);
        assert!(config.client.debug_trace);
        assert_eq!(config.client.timeout_ms, 1500);
        // Unspecified options keep their defaults
        assert_eq!(config.client.connect_timeout_ms, 5000);
        assert!(!config.client.tls_verify);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate() {
        assert!(ReplayConfig::default().validate().is_err());

        let config = ReplayConfig {
            destination: "example.com".into(),
            concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
