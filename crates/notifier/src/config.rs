//! Notifier configuration from environment variables.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::info;
use url::Url;

pub const DEFAULT_FEED_NAME: &str = "feed";
pub const DEFAULT_STATE_FILE: &str = "subscriptions.json";
pub const DEFAULT_COMMAND_SUBJECT: &str = "feed.commands";
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Where desired subscription state is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Redis { url: String, key: String },
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierConfig {
    pub feed_url: String,
    pub feed_token: Option<String>,
    /// Label for logs and metrics.
    pub feed_name: String,
    pub store: StoreConfig,
    /// Notifications are only logged when unset.
    pub nats_url: Option<String>,
    pub subject_prefix: String,
    pub command_subject: String,
    pub metrics_port: u16,
}

impl NotifierConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let Some(feed_url) = var("FEED_URL") else {
            bail!("FEED_URL must be set");
        };
        let scheme = Url::parse(&feed_url)
            .with_context(|| format!("FEED_URL '{}' is not a valid URL", feed_url))?
            .scheme()
            .to_string();
        if scheme != "ws" && scheme != "wss" {
            bail!("FEED_URL must use ws:// or wss://, got {}://", scheme);
        }

        let store = match var("REDIS_URL") {
            Some(url) => StoreConfig::Redis {
                url,
                key: var("STATE_KEY").unwrap_or_else(|| feed::store::DEFAULT_STATE_KEY.to_string()),
            },
            None => StoreConfig::File(PathBuf::from(
                var("STATE_FILE").unwrap_or_else(|| DEFAULT_STATE_FILE.to_string()),
            )),
        };

        let metrics_port = match var("METRICS_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("METRICS_PORT must be a port number, got '{}'", raw))?,
            None => DEFAULT_METRICS_PORT,
        };

        Ok(Self {
            feed_url,
            feed_token: var("FEED_TOKEN"),
            feed_name: var("FEED_NAME").unwrap_or_else(|| DEFAULT_FEED_NAME.to_string()),
            store,
            nats_url: var("NATS_URL"),
            subject_prefix: var("NOTIFY_SUBJECT_PREFIX")
                .unwrap_or_else(|| feed::sink::DEFAULT_SUBJECT_PREFIX.to_string()),
            command_subject: var("COMMAND_SUBJECT")
                .unwrap_or_else(|| DEFAULT_COMMAND_SUBJECT.to_string()),
            metrics_port,
        })
    }

    /// Log the effective configuration (secrets omitted).
    pub fn log(&self) {
        info!("Configuration:");
        info!("  FEED_NAME: {}", self.feed_name);
        info!("  FEED_TOKEN: {}", if self.feed_token.is_some() { "set" } else { "unset" });
        match &self.store {
            StoreConfig::Redis { key, .. } => info!("  STATE: redis key {}", key),
            StoreConfig::File(path) => info!("  STATE: file {}", path.display()),
        }
        match &self.nats_url {
            Some(url) => info!("  NATS_URL: {}", url),
            None => info!("  NATS_URL: unset, notifications are logged only"),
        }
        info!("  NOTIFY_SUBJECT_PREFIX: {}", self.subject_prefix);
        info!("  COMMAND_SUBJECT: {}", self.command_subject);
        info!("  METRICS_PORT: {}", self.metrics_port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<NotifierConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NotifierConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("FEED_URL", "wss://stream.example.io/socket/websocket")]).unwrap();
        assert_eq!(config.feed_name, "feed");
        assert_eq!(config.store, StoreConfig::File(PathBuf::from("subscriptions.json")));
        assert_eq!(config.nats_url, None);
        assert_eq!(config.subject_prefix, "notifications");
        assert_eq!(config.command_subject, "feed.commands");
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.feed_token, None);
    }

    #[test]
    fn test_redis_store_selected_by_url() {
        let config = config(&[
            ("FEED_URL", "wss://stream.example.io/socket/websocket"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("STATE_FILE", "ignored.json"),
        ])
        .unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Redis {
                url: "redis://localhost:6379".into(),
                key: "feed:subscriptions".into(),
            }
        );
    }

    #[test]
    fn test_missing_or_bad_values_are_errors() {
        assert!(config(&[]).is_err());
        assert!(config(&[("FEED_URL", "   ")]).is_err());
        assert!(config(&[("FEED_URL", "https://stream.example.io")]).is_err());
        assert!(config(&[("FEED_URL", "wss://x.io"), ("METRICS_PORT", "ninety")]).is_err());
    }
}
