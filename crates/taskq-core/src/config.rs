//! Configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::domain::{QueueError, QueueResult};
use crate::queue::naming::{shard_prefix, validate_prefix, validate_queue_name};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "QUEUE_PREFIX", default = "pq")]
    pub queue_prefix: String,

    #[envconfig(from = "CLAIM_QUEUE", default = "tq-claim")]
    pub claim_queue: String,

    #[envconfig(from = "DEADLINE_QUEUE", default = "tq-deadline")]
    pub deadline_queue: String,

    #[envconfig(from = "RESOLVED_QUEUE", default = "tq-resolved")]
    pub resolved_queue: String,

    #[envconfig(from = "DEADLINE_DELAY_MS", default = "600000")]
    pub deadline_delay_ms: u64,

    #[envconfig(from = "QUEUE_BACKEND", default = "memory")]
    pub queue_backend: QueueBackend,

    #[envconfig(from = "QUEUE_ENDPOINT", default = "http://localhost:10001")]
    pub queue_endpoint: String,

    #[envconfig(from = "QUEUE_ACCESS_TOKEN")]
    pub queue_access_token: Option<String>,

    #[envconfig(from = "REQUEST_TIMEOUT_MS", default = "30000")]
    pub request_timeout_ms: u64,

    #[envconfig(from = "GC_INTERVAL_SECS", default = "21600")]
    pub gc_interval_secs: u64,

    // 25 時間: 1 日 1 回のメタデータ更新が 23 時間の閾値を必ず越えるように
    #[envconfig(from = "CACHE_RESET_INTERVAL_SECS", default = "90000")]
    pub cache_reset_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Memory,
    Http,
}

impl FromStr for QueueBackend {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(QueueBackend::Memory),
            "http" => Ok(QueueBackend::Http),
            _ => Err(QueueError::validation("unknown queue backend").with_context("backend", s)),
        }
    }
}

/// 検証済みの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub prefix: String,
    pub claim_queue: String,
    pub deadline_queue: String,
    pub resolved_queue: String,
    pub deadline_delay: Duration,
    pub backend: QueueBackend,
    pub endpoint: String,
    pub access_token: Option<String>,
    pub request_timeout: Duration,
    pub gc_interval: Duration,
    pub cache_reset_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prefix: "pq".to_string(),
            claim_queue: "tq-claim".to_string(),
            deadline_queue: "tq-deadline".to_string(),
            resolved_queue: "tq-resolved".to_string(),
            deadline_delay: Duration::from_secs(600),
            backend: QueueBackend::Memory,
            endpoint: "http://localhost:10001".to_string(),
            access_token: None,
            request_timeout: Duration::from_secs(30),
            gc_interval: Duration::from_secs(6 * 60 * 60),
            cache_reset_interval: Duration::from_secs(25 * 60 * 60),
        }
    }
}

impl QueueSettings {
    /// 名前のルールと、expiration キューが GC の prefix にかからないことを確認する
    pub fn validate(&self) -> QueueResult<()> {
        validate_prefix(&self.prefix)?;
        let gc_prefix = shard_prefix(&self.prefix);
        for (setting, name) in [
            ("CLAIM_QUEUE", &self.claim_queue),
            ("DEADLINE_QUEUE", &self.deadline_queue),
            ("RESOLVED_QUEUE", &self.resolved_queue),
        ] {
            validate_queue_name(name).map_err(|err| err.with_context("setting", setting))?;
            if name.starts_with(&gc_prefix) {
                return Err(QueueError::validation(
                    "expiration queue name would be swept by the pending queue GC",
                )
                .with_context("setting", setting)
                .with_context("queue", name.as_str())
                .with_context("prefix", self.prefix.as_str()));
            }
        }
        if self.request_timeout.is_zero() {
            return Err(QueueError::validation("request timeout must be positive"));
        }
        if self.gc_interval.is_zero() || self.cache_reset_interval.is_zero() {
            return Err(QueueError::validation("background intervals must be positive"));
        }
        Ok(())
    }
}

impl Config {
    pub fn queue_settings(&self) -> QueueResult<QueueSettings> {
        let settings = QueueSettings {
            prefix: self.queue_prefix.clone(),
            claim_queue: self.claim_queue.clone(),
            deadline_queue: self.deadline_queue.clone(),
            resolved_queue: self.resolved_queue.clone(),
            deadline_delay: Duration::from_millis(self.deadline_delay_ms),
            backend: self.queue_backend,
            endpoint: self.queue_endpoint.clone(),
            access_token: self.queue_access_token.clone().filter(|t| !t.is_empty()),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            gc_interval: Duration::from_secs(self.gc_interval_secs),
            cache_reset_interval: Duration::from_secs(self.cache_reset_interval_secs),
        };
        settings.validate()?;
        Ok(settings)
    }
}
