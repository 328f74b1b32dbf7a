//! Coordinator configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::kv::KvClient;

/// Configuration for a [`Coordinator`](crate::Coordinator).
///
/// Both clients are injected: the KV client decides how the store is
/// reached (connection pooling, retries, credentials), the HTTP client
/// decides probe transport details. Probes expect a plain `200` from the
/// health endpoint, so the HTTP client should be built with redirects
/// disabled.
#[derive(Clone)]
pub struct Options {
    pub(crate) prefix: String,
    pub(crate) name: String,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) heartbeat_timeout: Option<Duration>,
    pub(crate) heartbeat_concurrency: usize,
    pub(crate) heartbeat_max_failures: u64,
    pub(crate) replica_count: usize,
    pub(crate) kv: Option<Arc<dyn KvClient>>,
    pub(crate) http: Option<reqwest::Client>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            prefix: "pantheon".to_string(),
            name: "my-cluster".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: None,
            heartbeat_concurrency: 2,
            heartbeat_max_failures: 5,
            replica_count: 10,
            kv: None,
            http: None,
        }
    }
}

impl Options {
    /// Options with defaults; the heartbeat timeout and both clients are
    /// still required before [`validate`](Self::validate) passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// First segment of every persisted key. Default `"pantheon"`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Cluster namespace, the second segment of every persisted key.
    /// Default `"my-cluster"`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// How often the failure detector probes every member. Default 30s.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Per-probe deadline. Required.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// Width of the probe worker pool. Default 2.
    pub fn with_heartbeat_concurrency(mut self, concurrency: usize) -> Self {
        self.heartbeat_concurrency = concurrency;
        self
    }

    /// Consecutive failures after which a node is declared dead. Default 5.
    pub fn with_heartbeat_max_failures(mut self, max_failures: u64) -> Self {
        self.heartbeat_max_failures = max_failures;
        self
    }

    /// Virtual nodes per physical node on the hash ring. Default 10.
    pub fn with_replica_count(mut self, count: usize) -> Self {
        self.replica_count = count;
        self
    }

    /// The KV client backing the store. Required.
    pub fn with_kv_client(mut self, kv: Arc<dyn KvClient>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// The HTTP client used for health probes. Required.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Check that every option is usable.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), Error> {
        if self.prefix.is_empty() {
            return Err(Error::ConfigInvalid("prefix is required"));
        }
        if self.name.is_empty() {
            return Err(Error::ConfigInvalid("name is required"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::ConfigInvalid(
                "heartbeat interval must be greater than zero",
            ));
        }
        match self.heartbeat_timeout {
            None => return Err(Error::ConfigInvalid("heartbeat timeout is required")),
            Some(timeout) if timeout.is_zero() => {
                return Err(Error::ConfigInvalid(
                    "heartbeat timeout must be greater than zero",
                ));
            }
            Some(_) => {}
        }
        if self.heartbeat_concurrency == 0 {
            return Err(Error::ConfigInvalid(
                "heartbeat concurrency must be greater than zero",
            ));
        }
        if self.heartbeat_max_failures == 0 {
            return Err(Error::ConfigInvalid(
                "heartbeat max failures must be greater than zero",
            ));
        }
        if self.replica_count == 0 {
            return Err(Error::ConfigInvalid(
                "replica count must be greater than zero",
            ));
        }
        if self.kv.is_none() {
            return Err(Error::ConfigInvalid("store client is required"));
        }
        if self.http.is_none() {
            return Err(Error::ConfigInvalid("http client is required"));
        }
        Ok(())
    }
}
