use crate::config::{Config, DispatchConfig};
use crate::error::DispatchError;

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the whole process configuration
    pub fn validate(config: &Config) -> Result<(), DispatchError> {
        Self::validate_bind_address(&config.bind_addr.to_string())?;
        Self::validate_redis_url(&config.redis_url)?;
        Self::validate_log_level(&config.log_level)?;
        Self::validate_api_base(&config.calendar_api_base)?;
        Self::validate_dispatch_config(&config.dispatch_config()?)?;
        Ok(())
    }

    /// Validates a Redis URL. Empty means "no Redis".
    pub fn validate_redis_url(url: &str) -> Result<(), DispatchError> {
        if url.trim().is_empty() {
            return Ok(());
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(DispatchError::ValidationError(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a bind address
    pub fn validate_bind_address(address: &str) -> Result<(), DispatchError> {
        if address.is_empty() {
            return Err(DispatchError::ValidationError(
                "Bind address cannot be empty".to_string(),
            ));
        }

        // Check if it looks like host:port format
        if !address.contains(':') {
            return Err(DispatchError::ValidationError(
                "Bind address must be in host:port format".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_log_level(level: &str) -> Result<(), DispatchError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&level.to_lowercase().as_str()) {
            return Err(DispatchError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {:?}",
                level, valid_levels
            )));
        }

        Ok(())
    }

    pub fn validate_api_base(url: &str) -> Result<(), DispatchError> {
        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(DispatchError::ValidationError(format!(
                "Calendar API base '{}' must be an http(s) URL",
                url
            )));
        }

        Ok(())
    }

    /// Validates the settings the dispatch core runs with
    pub fn validate_dispatch_config(config: &DispatchConfig) -> Result<(), DispatchError> {
        if config.queue_capacity == 0 {
            return Err(DispatchError::ValidationError(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }

        if config.worker_count == 0 {
            return Err(DispatchError::ValidationError(
                "Worker count must be greater than 0".to_string(),
            ));
        }

        if config.retry.max_attempts == 0 {
            return Err(DispatchError::ValidationError(
                "Retry max attempts must be greater than 0".to_string(),
            ));
        }

        if config.retry.base_delay > config.retry.max_delay {
            return Err(DispatchError::ValidationError(
                "Retry base delay cannot exceed max delay".to_string(),
            ));
        }

        if config.idempotency_ttl.is_zero() {
            return Err(DispatchError::ValidationError(
                "Idempotency TTL must be greater than 0".to_string(),
            ));
        }

        if config.call_timeout.is_zero() || config.wait_poll_interval.is_zero() {
            return Err(DispatchError::ValidationError(
                "Call timeout and wait poll interval must be greater than 0".to_string(),
            ));
        }

        config
            .quota
            .validate()
            .map_err(DispatchError::ValidationError)?;

        Ok(())
    }
}
