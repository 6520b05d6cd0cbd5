//! External calendar API collaborator.
//!
//! The dispatch core treats the adapter as opaque: it performs one call and
//! reports success or a classified failure. Retries, quotas and deduplication
//! all live in the core.

pub mod google;

use crate::tool::ToolCall;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use google::GoogleCalendarClient;

/// Result payload of a successful tool call.
pub type ToolOutput = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rate limited, server error, network failure or deadline exceeded.
    Transient,
    /// Rejected by the API: invalid request, not found, permission denied.
    Fatal,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} adapter error: {detail}")]
pub struct AdapterError {
    pub kind: ErrorKind,
    pub detail: String,
    /// Server-provided hint for when to try again.
    pub retry_after: Option<Duration>,
}

impl AdapterError {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn deadline_exceeded(timeout: Duration) -> Self {
        Self::transient(format!("call exceeded deadline of {:?}", timeout))
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

#[async_trait]
pub trait AdapterClient: Send + Sync {
    /// Perform the external call for `call`.
    async fn execute(&self, call: &ToolCall) -> Result<ToolOutput, AdapterError>;

    /// Current state of the event a call is about to modify, for the audit
    /// trail. Adapters that cannot provide one return `None`.
    async fn snapshot(&self, _call: &ToolCall) -> Option<serde_json::Value> {
        None
    }
}
