use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{DispatchError, DispatchResult};
use crate::quota_config::{QuotaConfig, QuotaRule};
use crate::retry::RetryConfig;

/// Process configuration, read from the environment at startup.
#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:8081")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; empty keeps idempotency records in memory
    #[envconfig(from = "REDIS_URL", default = "")]
    pub redis_url: String,

    #[envconfig(from = "QUEUE_CAPACITY", default = "100")]
    pub queue_capacity: usize,

    #[envconfig(from = "WORKER_COUNT", default = "5")]
    pub worker_count: usize,

    /// Default quota bucket capacity per resource group
    #[envconfig(from = "QUOTA_CAPACITY", default = "10")]
    pub quota_capacity: u32,

    /// Default quota refill rate, tokens per second
    #[envconfig(from = "QUOTA_REFILL_RATE", default = "10.0")]
    pub quota_refill_rate: f64,

    /// Per-group overrides: `group=capacity:rate,...`
    #[envconfig(from = "QUOTA_GROUPS", default = "")]
    pub quota_groups: String,

    #[envconfig(from = "RETRY_MAX_ATTEMPTS", default = "5")]
    pub retry_max_attempts: u32,

    #[envconfig(from = "RETRY_BASE_DELAY_MS", default = "500")]
    pub retry_base_delay_ms: u64,

    #[envconfig(from = "RETRY_MAX_DELAY_MS", default = "60000")]
    pub retry_max_delay_ms: u64,

    /// Deadline for a single adapter call
    #[envconfig(from = "CALL_TIMEOUT_MS", default = "30000")]
    pub call_timeout_ms: u64,

    #[envconfig(from = "IDEMPOTENCY_TTL_SECS", default = "86400")]
    pub idempotency_ttl_secs: u64,

    /// Expired record sweep interval; 0 disables the sweeper
    #[envconfig(from = "SWEEP_INTERVAL_SECS", default = "300")]
    pub sweep_interval_secs: u64,

    /// How often waiters re-check records settled by other processes
    #[envconfig(from = "WAIT_POLL_MS", default = "250")]
    pub wait_poll_ms: u64,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(
        from = "CALENDAR_API_BASE",
        default = "https://www.googleapis.com/calendar/v3"
    )]
    pub calendar_api_base: String,

    /// Bearer token for the calendar API, obtained outside this service
    #[envconfig(from = "CALENDAR_ACCESS_TOKEN")]
    pub calendar_access_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// The settings the dispatch core is constructed from.
    pub fn dispatch_config(&self) -> DispatchResult<DispatchConfig> {
        let mut quota = QuotaConfig {
            groups: Default::default(),
            default_rule: QuotaRule::new(self.quota_capacity, self.quota_refill_rate),
        };
        let groups = QuotaConfig::parse_groups(&self.quota_groups)
            .map_err(DispatchError::ConfigurationError)?;
        for (group, rule) in groups {
            quota.set_rule(group, rule);
        }

        Ok(DispatchConfig {
            queue_capacity: self.queue_capacity,
            worker_count: self.worker_count,
            quota,
            retry: RetryConfig {
                max_attempts: self.retry_max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
            idempotency_ttl: Duration::from_secs(self.idempotency_ttl_secs),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            wait_poll_interval: Duration::from_millis(self.wait_poll_ms),
            sweep_interval: match self.sweep_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }

    pub fn uses_redis(&self) -> bool {
        !self.redis_url.trim().is_empty()
    }
}

/// Explicit settings handed to the router, pool and limiter constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub quota: QuotaConfig,
    pub retry: RetryConfig,
    #[serde(with = "humantime_serde")]
    pub idempotency_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub wait_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            worker_count: 5,
            quota: QuotaConfig::default(),
            retry: RetryConfig::default(),
            idempotency_ttl: Duration::from_secs(86400),
            call_timeout: Duration::from_secs(30),
            wait_poll_interval: Duration::from_millis(250),
            sweep_interval: Some(Duration::from_secs(300)),
        }
    }
}
