use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Quota rules per external-API resource group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub groups: HashMap<String, QuotaRule>,
    pub default_rule: QuotaRule,
}

/// Published rate limit of one resource group
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaRule {
    pub capacity: u32,
    /// Tokens per second
    pub refill_rate: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            groups: HashMap::new(),
            default_rule: QuotaRule::default(),
        }
    }
}

impl Default for QuotaRule {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_rate: 10.0,
        }
    }
}

impl QuotaConfig {
    /// Get the rule for a resource group, falling back to the default
    pub fn get_rule(&self, group: &str) -> QuotaRule {
        self.groups.get(group).copied().unwrap_or(self.default_rule)
    }

    pub fn set_rule(&mut self, group: impl Into<String>, rule: QuotaRule) {
        self.groups.insert(group.into(), rule);
    }

    /// Parse `group=capacity:rate` entries separated by commas, e.g.
    /// `primary=5:1.5,team@example.com=20:10`.
    pub fn parse_groups(raw: &str) -> Result<HashMap<String, QuotaRule>, String> {
        let mut groups = HashMap::new();

        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (group, limits) = entry
                .rsplit_once('=')
                .ok_or_else(|| format!("Quota group '{}' must be group=capacity:rate", entry))?;
            let (capacity, rate) = limits
                .split_once(':')
                .ok_or_else(|| format!("Quota limits '{}' must be capacity:rate", limits))?;

            let rule = QuotaRule {
                capacity: capacity
                    .trim()
                    .parse()
                    .map_err(|_| format!("Invalid quota capacity '{}'", capacity))?,
                refill_rate: rate
                    .trim()
                    .parse()
                    .map_err(|_| format!("Invalid quota refill rate '{}'", rate))?,
            };
            rule.validate()?;

            let group = group.trim();
            if group.is_empty() {
                return Err("Quota group name cannot be empty".to_string());
            }
            groups.insert(group.to_string(), rule);
        }

        Ok(groups)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.default_rule.validate()?;
        for (group, rule) in &self.groups {
            rule.validate()
                .map_err(|e| format!("Quota group '{}': {}", group, e))?;
        }
        Ok(())
    }
}

impl QuotaRule {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("Quota capacity must be greater than 0".to_string());
        }
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err("Quota refill rate must be greater than 0".to_string());
        }
        Ok(())
    }
}
