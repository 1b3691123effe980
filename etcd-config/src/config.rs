//! Connection and sync settings.

use std::time::Duration;

use tracing::warn;

use crate::Error;

#[derive(Debug, Clone)]
pub struct Settings {
    pub endpoints: Vec<String>,
    pub namespace: String,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub retry_delay: Duration,
}

impl Settings {
    const DEFAULT_ENDPOINT: &str = "localhost:2379";
    const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
    const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
    const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

    pub fn new<I, S>(endpoints: I, namespace: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            namespace: namespace.into(),
            dial_timeout: Self::DEFAULT_DIAL_TIMEOUT,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            retry_delay: Self::DEFAULT_RETRY_DELAY,
        }
    }

    /// Reads `ETCD_ENDPOINTS`, `ETCD_CONFIG_NAMESPACE`, `ETCD_DIAL_TIMEOUT_MS`,
    /// `ETCD_REQUEST_TIMEOUT_MS` and `ETCD_RETRY_DELAY_MS`.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoints = lookup("ETCD_ENDPOINTS").unwrap_or_else(|| {
            warn!("ETCD_ENDPOINTS not set, using {}", Self::DEFAULT_ENDPOINT);
            Self::DEFAULT_ENDPOINT.to_string()
        });
        let namespace = lookup("ETCD_CONFIG_NAMESPACE").ok_or(Error::InvalidSetting {
            name: "ETCD_CONFIG_NAMESPACE",
            reason: "not set".to_string(),
        })?;

        let mut settings = Self::new(parse_endpoints(&endpoints), namespace);
        if let Some(ms) = lookup("ETCD_DIAL_TIMEOUT_MS") {
            settings.dial_timeout = parse_millis("ETCD_DIAL_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("ETCD_REQUEST_TIMEOUT_MS") {
            settings.request_timeout = parse_millis("ETCD_REQUEST_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("ETCD_RETRY_DELAY_MS") {
            settings.retry_delay = parse_millis("ETCD_RETRY_DELAY_MS", &ms)?;
        }
        Ok(settings)
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Splits a comma-separated endpoint list, dropping blanks.
pub fn parse_endpoints(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_millis(name: &'static str, value: &str) -> Result<Duration, Error> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| Error::InvalidSetting {
            name,
            reason: format!("{value:?}: {e}"),
        })
}
