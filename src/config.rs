//! Adapter configuration
//!
//! Mirrors the `mq_*` configuration keys of the messaging layer. The host
//! application owns config parsing; this struct is the already-typed view the
//! adapter consumes, with `from_env` as a convenience for processes that
//! configure through the environment.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MqError, Result};

/// SQS/SNS adapter configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqConfig {
    /// Adapter selector (e.g. "sqs_sns", "memory")
    pub adapter: String,

    /// Prefix applied to every queue and topic name
    pub namespace: String,

    /// Default `query` deadline in seconds
    pub default_query_timeout: u64,

    /// Name prefix of the per-process ephemeral reply queue
    pub reply_queue_prefix: String,

    /// Worker pool: workers kept warm
    pub worker_pool_min_threads: usize,

    /// Worker pool: concurrency ceiling
    pub worker_pool_max_threads: usize,

    /// Worker pool: pending-submission backlog bound
    pub worker_pool_max_backlog: usize,

    /// AWS region override (SDK environment chain otherwise)
    pub aws_region: Option<String>,

    /// Static credentials override
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,

    /// Endpoint overrides, mainly for localstack-style deployments
    pub aws_sqs_endpoint: Option<String>,
    pub aws_sns_endpoint: Option<String>,

    /// KMS key id; when set, created queues and topics are encrypted at rest
    pub aws_sqs_sns_kms_master_key_id: Option<String>,

    /// Long-poll window for `receive_message`, seconds (SQS caps this at 20)
    pub aws_sqs_read_timeout: u64,

    /// Cross-account queue ownership, `"queue1:account1,queue2:account2"`
    pub aws_sqs_cross_account_mapping: String,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            adapter: "sqs_sns".to_string(),
            namespace: String::new(),
            default_query_timeout: 15,
            reply_queue_prefix: "reply-".to_string(),
            worker_pool_min_threads: 1,
            worker_pool_max_threads: 16,
            worker_pool_max_backlog: 16,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_sqs_endpoint: None,
            aws_sns_endpoint: None,
            aws_sqs_sns_kms_master_key_id: None,
            aws_sqs_read_timeout: 20,
            aws_sqs_cross_account_mapping: String::new(),
        }
    }
}

impl MqConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.adapter.is_empty() {
            return Err(MqError::Config("mq_adapter cannot be empty".to_string()));
        }

        if self.worker_pool_min_threads == 0 {
            return Err(MqError::Config(
                "mq_worker_pool_min_threads must be at least 1".to_string(),
            ));
        }

        if self.worker_pool_max_threads < self.worker_pool_min_threads {
            return Err(MqError::Config(
                "mq_worker_pool_max_threads cannot be lower than mq_worker_pool_min_threads"
                    .to_string(),
            ));
        }

        if self.worker_pool_max_backlog == 0 {
            return Err(MqError::Config(
                "mq_worker_pool_max_backlog must be at least 1".to_string(),
            ));
        }

        if self.aws_sqs_read_timeout == 0 || self.aws_sqs_read_timeout > 20 {
            return Err(MqError::Config(
                "mq_aws_sqs_read_timeout must be between 1 and 20 seconds".to_string(),
            ));
        }

        if self.default_query_timeout == 0 {
            return Err(MqError::Config(
                "mq_default_query_timeout must be at least 1 second".to_string(),
            ));
        }

        // Fail fast on a malformed mapping instead of at first lookup
        self.cross_account_map()?;

        Ok(())
    }

    /// Create configuration from environment variables
    ///
    /// Each `mq_*` key maps to its uppercased environment counterpart, e.g.
    /// `MQ_ADAPTER`, `MQ_NAMESPACE`, `MQ_AWS_SQS_READ_TIMEOUT`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            adapter: std::env::var("MQ_ADAPTER").unwrap_or(defaults.adapter),
            namespace: std::env::var("MQ_NAMESPACE").unwrap_or_default(),
            default_query_timeout: env_u64("MQ_DEFAULT_QUERY_TIMEOUT")?
                .unwrap_or(defaults.default_query_timeout),
            reply_queue_prefix: std::env::var("MQ_REPLY_QUEUE_PREFIX")
                .unwrap_or(defaults.reply_queue_prefix),
            worker_pool_min_threads: env_usize("MQ_WORKER_POOL_MIN_THREADS")?
                .unwrap_or(defaults.worker_pool_min_threads),
            worker_pool_max_threads: env_usize("MQ_WORKER_POOL_MAX_THREADS")?
                .unwrap_or(defaults.worker_pool_max_threads),
            worker_pool_max_backlog: env_usize("MQ_WORKER_POOL_MAX_BACKLOG")?
                .unwrap_or(defaults.worker_pool_max_backlog),
            aws_region: std::env::var("MQ_AWS_REGION").ok(),
            aws_access_key_id: std::env::var("MQ_AWS_ACCESS_KEY_ID").ok(),
            aws_secret_access_key: std::env::var("MQ_AWS_SECRET_ACCESS_KEY").ok(),
            aws_sqs_endpoint: std::env::var("MQ_AWS_SQS_ENDPOINT").ok(),
            aws_sns_endpoint: std::env::var("MQ_AWS_SNS_ENDPOINT").ok(),
            aws_sqs_sns_kms_master_key_id: std::env::var("MQ_AWS_SQS_SNS_KMS_MASTER_KEY_ID").ok(),
            aws_sqs_read_timeout: env_u64("MQ_AWS_SQS_READ_TIMEOUT")?
                .unwrap_or(defaults.aws_sqs_read_timeout),
            aws_sqs_cross_account_mapping: std::env::var("MQ_AWS_SQS_CROSS_ACCOUNT_MAPPING")
                .unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Default query deadline as a `Duration`
    pub fn default_query_timeout(&self) -> Duration {
        Duration::from_secs(self.default_query_timeout)
    }

    /// Parse `aws_sqs_cross_account_mapping` into `queue name -> account id`
    ///
    /// Keys are the original (pre-namespace) queue names.
    pub fn cross_account_map(&self) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();

        for entry in self
            .aws_sqs_cross_account_mapping
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
        {
            let (name, account) = entry.split_once(':').ok_or_else(|| {
                MqError::Config(format!(
                    "invalid mq_aws_sqs_cross_account_mapping entry: {entry:?}"
                ))
            })?;

            if name.is_empty() || account.is_empty() {
                return Err(MqError::Config(format!(
                    "invalid mq_aws_sqs_cross_account_mapping entry: {entry:?}"
                )));
            }

            map.insert(name.to_string(), account.to_string());
        }

        Ok(map)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| MqError::Config(format!("{key} must be an integer, got {raw:?}"))),
        Err(_) => Ok(None),
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| MqError::Config(format!("{key} must be an integer, got {raw:?}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MqConfig::default();
        assert_eq!(config.adapter, "sqs_sns");
        assert_eq!(config.default_query_timeout, 15);
        assert_eq!(config.reply_queue_prefix, "reply-");
        assert_eq!(config.worker_pool_min_threads, 1);
        assert_eq!(config.worker_pool_max_threads, 16);
        assert_eq!(config.worker_pool_max_backlog, 16);
        assert_eq!(config.aws_sqs_read_timeout, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_adapter() {
        let config = MqConfig {
            adapter: String::new(),
            ..MqConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_pool_bounds() {
        let config = MqConfig {
            worker_pool_min_threads: 8,
            worker_pool_max_threads: 4,
            ..MqConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MqConfig {
            worker_pool_max_backlog: 0,
            ..MqConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_read_timeout_range() {
        let config = MqConfig {
            aws_sqs_read_timeout: 21,
            ..MqConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MqConfig {
            aws_sqs_read_timeout: 0,
            ..MqConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cross_account_map_parsing() {
        let config = MqConfig {
            aws_sqs_cross_account_mapping: "shared:999, billing:123".to_string(),
            ..MqConfig::default()
        };

        let map = config.cross_account_map().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("shared").map(String::as_str), Some("999"));
        assert_eq!(map.get("billing").map(String::as_str), Some("123"));
    }

    #[test]
    fn test_cross_account_map_empty() {
        let config = MqConfig::default();
        assert!(config.cross_account_map().unwrap().is_empty());
    }

    #[test]
    fn test_cross_account_map_malformed() {
        let config = MqConfig {
            aws_sqs_cross_account_mapping: "shared".to_string(),
            ..MqConfig::default()
        };
        assert!(config.cross_account_map().is_err());

        let config = MqConfig {
            aws_sqs_cross_account_mapping: "shared:".to_string(),
            ..MqConfig::default()
        };
        assert!(config.cross_account_map().is_err());
    }
}
