//! Registry session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ExponentialBackoff, StoreError};

const fn default_base_sleep_ms() -> u64 {
    1000
}

const fn default_max_sleep_ms() -> u64 {
    3000
}

const fn default_max_retries() -> u32 {
    3
}

/// Configuration for a registry center session.
///
/// Values are passed through as given; `base_sleep_ms <= max_sleep_ms` is
/// expected but not enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Comma separated `host:port` list, e.g. `host1:2181,host2:2181`.
    #[serde(default)]
    pub servers: String,

    /// Root path prefix applied to every path.
    #[serde(default)]
    pub namespace: String,

    /// Initial backoff between connection retries, in milliseconds.
    #[serde(default = "default_base_sleep_ms")]
    pub base_sleep_ms: u64,

    /// Upper bound for a single backoff, in milliseconds.
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,

    /// Maximum number of connection retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Session timeout in milliseconds. Zero keeps the driver default.
    #[serde(default)]
    pub session_timeout_ms: u64,

    /// Connection timeout in milliseconds. Zero keeps the driver default.
    #[serde(default)]
    pub connection_timeout_ms: u64,

    /// Digest credential (`user:password`). When set, every node is created
    /// with a creator-only ACL.
    #[serde(default)]
    pub digest: Option<String>,

    /// Extra fixed delay after all caches have stopped and before the
    /// session closes, in milliseconds.
    #[serde(default)]
    pub cache_close_grace_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            servers: String::new(),
            namespace: String::new(),
            base_sleep_ms: default_base_sleep_ms(),
            max_sleep_ms: default_max_sleep_ms(),
            max_retries: default_max_retries(),
            session_timeout_ms: 0,
            connection_timeout_ms: 0,
            digest: None,
            cache_close_grace_ms: 0,
        }
    }
}

impl RegistryConfig {
    /// Create a configuration with default retry and timeout settings.
    #[must_use]
    pub fn new(servers: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            servers: servers.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Set the retry bounds.
    #[must_use]
    pub const fn with_retry(
        mut self,
        base_sleep_ms: u64,
        max_sleep_ms: u64,
        max_retries: u32,
    ) -> Self {
        self.base_sleep_ms = base_sleep_ms;
        self.max_sleep_ms = max_sleep_ms;
        self.max_retries = max_retries;
        self
    }

    /// Set the session timeout.
    #[must_use]
    pub const fn with_session_timeout_ms(mut self, ms: u64) -> Self {
        self.session_timeout_ms = ms;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub const fn with_connection_timeout_ms(mut self, ms: u64) -> Self {
        self.connection_timeout_ms = ms;
        self
    }

    /// Set the digest credential.
    #[must_use]
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Set the grace delay applied after caches stop.
    #[must_use]
    pub const fn with_cache_close_grace_ms(mut self, ms: u64) -> Self {
        self.cache_close_grace_ms = ms;
        self
    }

    /// Individual server addresses, trimmed, empty entries dropped.
    #[must_use]
    pub fn server_list(&self) -> Vec<String> {
        self.servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    /// The connection retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_sleep_ms),
            self.max_retries,
            Duration::from_millis(self.max_sleep_ms),
        )
    }

    /// Session timeout override, if any.
    #[must_use]
    pub const fn session_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.session_timeout_ms)
    }

    /// Connection timeout override, if any.
    #[must_use]
    pub const fn connection_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.connection_timeout_ms)
    }

    /// How long `init` waits for the session to connect.
    #[must_use]
    pub const fn connect_wait(&self) -> Duration {
        Duration::from_millis(self.max_sleep_ms.saturating_mul(self.max_retries as u64))
    }

    /// Digest credential, ignoring an empty string.
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref().filter(|d| !d.is_empty())
    }

    /// Check the configuration can be used to open a session.
    ///
    /// # Errors
    /// Returns error if the server list is empty.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.server_list().is_empty() {
            return Err(StoreError::BadArguments("server list is empty".to_string()));
        }
        Ok(())
    }
}

const fn non_zero_millis(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::new("localhost:2181", "app");
        assert_eq!(config.base_sleep_ms, 1000);
        assert_eq!(config.max_sleep_ms, 3000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.session_timeout(), None);
        assert_eq!(config.connection_timeout(), None);
        assert_eq!(config.connect_wait(), Duration::from_millis(9000));
        assert!(config.digest().is_none());
    }

    #[test]
    fn test_server_list() {
        let config = RegistryConfig::new(" host1:2181, host2:2181,,", "");
        assert_eq!(config.server_list(), vec!["host1:2181", "host2:2181"]);
        assert!(config.validate().is_ok());

        let empty = RegistryConfig::new(" , ", "");
        assert!(matches!(empty.validate(), Err(StoreError::BadArguments(_))));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RegistryConfig =
            serde_json::from_str(r#"{"servers": "zk:2181", "namespace": "jobs", "max_retries": 5}"#)
                .unwrap();
        assert_eq!(config.servers, "zk:2181");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_sleep_ms, 1000);
        assert_eq!(config.cache_close_grace_ms, 0);
    }

    #[test]
    fn test_timeouts_and_digest() {
        let config = RegistryConfig::new("zk:2181", "")
            .with_session_timeout_ms(60_000)
            .with_connection_timeout_ms(15_000)
            .with_digest("");
        assert_eq!(config.session_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.connection_timeout(), Some(Duration::from_secs(15)));
        assert!(config.digest().is_none());
    }
}
