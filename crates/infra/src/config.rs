//! Process configuration read from `COURIER_*` environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use crate::notify::DEFAULT_NOTIFICATION_QUEUE;
use crate::rpc::client::DEFAULT_WORK_QUEUE;

pub const ENV_REDIS_URL: &str = "COURIER_REDIS_URL";
pub const ENV_WORK_QUEUE: &str = "COURIER_WORK_QUEUE";
pub const ENV_NOTIFICATION_QUEUE: &str = "COURIER_NOTIFICATION_QUEUE";
pub const ENV_RPC_TIMEOUT_MS: &str = "COURIER_RPC_TIMEOUT_MS";
pub const ENV_WORKER_CONCURRENCY: &str = "COURIER_WORKER_CONCURRENCY";
pub const ENV_BIND_ADDR: &str = "COURIER_BIND_ADDR";
pub const ENV_OCR_ENDPOINT: &str = "COURIER_OCR_ENDPOINT";
pub const ENV_MAIL_ENDPOINT: &str = "COURIER_MAIL_ENDPOINT";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value `{value}`: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourierConfig {
    /// Redis server; `None` selects the in-process broker
    pub redis_url: Option<String>,
    pub work_queue: String,
    pub notification_queue: String,
    pub rpc_timeout: Duration,
    pub worker_concurrency: usize,
    pub bind_addr: SocketAddr,
    pub ocr_endpoint: Option<String>,
    pub mail_endpoint: Option<String>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            work_queue: DEFAULT_WORK_QUEUE.to_string(),
            notification_queue: DEFAULT_NOTIFICATION_QUEUE.to_string(),
            rpc_timeout: Duration::from_secs(30),
            worker_concurrency: 1,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ocr_endpoint: None,
            mail_endpoint: None,
        }
    }
}

impl CourierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset or empty variables keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = get(ENV_REDIS_URL) {
            config.redis_url = Some(url);
        }
        if let Some(queue) = get(ENV_WORK_QUEUE) {
            config.work_queue = queue;
        }
        if let Some(queue) = get(ENV_NOTIFICATION_QUEUE) {
            config.notification_queue = queue;
        }
        if let Some(raw) = get(ENV_RPC_TIMEOUT_MS) {
            let ms: u64 = parse(ENV_RPC_TIMEOUT_MS, &raw)?;
            if ms == 0 {
                return Err(invalid(ENV_RPC_TIMEOUT_MS, &raw, "must be positive"));
            }
            config.rpc_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = get(ENV_WORKER_CONCURRENCY) {
            let n: usize = parse(ENV_WORKER_CONCURRENCY, &raw)?;
            if n == 0 {
                return Err(invalid(ENV_WORKER_CONCURRENCY, &raw, "must be at least 1"));
            }
            config.worker_concurrency = n;
        }
        if let Some(raw) = get(ENV_BIND_ADDR) {
            config.bind_addr = parse(ENV_BIND_ADDR, &raw)?;
        }
        config.ocr_endpoint = get(ENV_OCR_ENDPOINT);
        config.mail_endpoint = get(ENV_MAIL_ENDPOINT);

        Ok(config)
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_work_queue(mut self, queue: impl Into<String>) -> Self {
        self.work_queue = queue.into();
        self
    }

    pub fn with_notification_queue(mut self, queue: impl Into<String>) -> Self {
        self.notification_queue = queue.into();
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_worker_concurrency(mut self, n: usize) -> Self {
        self.worker_concurrency = n.max(1);
        self
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// The Redis URL, for processes that cannot run without a real broker.
    pub fn require_redis_url(&self) -> Result<&str, ConfigError> {
        self.redis_url
            .as_deref()
            .ok_or(ConfigError::Missing(ENV_REDIS_URL))
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, raw, &e.to_string()))
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = CourierConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, CourierConfig::default());
        assert_eq!(config.work_queue, "ocr_service");
        assert_eq!(config.notification_queue, "email_notification");
        assert!(config.require_redis_url().is_err());
    }

    #[test]
    fn reads_every_variable() {
        let config = CourierConfig::from_lookup(lookup(&[
            (ENV_REDIS_URL, "redis://cache:6379"),
            (ENV_WORK_QUEUE, "ocr_v2"),
            (ENV_NOTIFICATION_QUEUE, "mail"),
            (ENV_RPC_TIMEOUT_MS, "1500"),
            (ENV_WORKER_CONCURRENCY, "4"),
            (ENV_BIND_ADDR, "127.0.0.1:9000"),
            (ENV_OCR_ENDPOINT, "http://ocr:8000/recognize"),
            (ENV_MAIL_ENDPOINT, "http://mail:8025/send"),
        ]))
        .unwrap();

        assert_eq!(config.require_redis_url().unwrap(), "redis://cache:6379");
        assert_eq!(config.work_queue, "ocr_v2");
        assert_eq!(config.notification_queue, "mail");
        assert_eq!(config.rpc_timeout, Duration::from_millis(1500));
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.ocr_endpoint.as_deref(), Some("http://ocr:8000/recognize"));
        assert_eq!(config.mail_endpoint.as_deref(), Some("http://mail:8025/send"));
    }

    #[test]
    fn empty_values_keep_defaults() {
        let config = CourierConfig::from_lookup(lookup(&[(ENV_WORK_QUEUE, "  ")])).unwrap();
        assert_eq!(config.work_queue, DEFAULT_WORK_QUEUE);
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = CourierConfig::from_lookup(lookup(&[(ENV_RPC_TIMEOUT_MS, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: ENV_RPC_TIMEOUT_MS, .. }));

        let err = CourierConfig::from_lookup(lookup(&[(ENV_WORKER_CONCURRENCY, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: ENV_WORKER_CONCURRENCY, .. }));
    }
}
