//! Audit trail for terminal job outcomes.
//!
//! The pool emits one [`AuditEvent`] per job when it settles. Where the
//! events end up is the sink's business; the default sink writes them as
//! JSON on the `audit` tracing target.

use crate::idempotency::ErrorDescriptor;
use crate::key_generator::IdempotencyKey;
use crate::tool::{ToolCall, ToolName};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const SENSITIVE_FIELDS: [&str; 5] = ["password", "token", "secret", "key", "credential"];
const REDACTED: &str = "***REDACTED***";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Read,
}

impl From<ToolName> for AuditAction {
    fn from(name: ToolName) -> Self {
        match name {
            ToolName::CreateEvent => AuditAction::Create,
            ToolName::UpdateEvent => AuditAction::Update,
            ToolName::DeleteEvent => AuditAction::Delete,
            ToolName::FreebusyQuery => AuditAction::Read,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    Failed(ErrorDescriptor),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub job_id: Uuid,
    pub idempotency_key: IdempotencyKey,
    pub tool_name: ToolName,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub arguments: Value,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub outcome: AuditOutcome,
    pub attempts: u32,
    pub retry_delays_ms: Vec<u64>,
    pub timestamp_ms: u64,
}

impl AuditEvent {
    /// Build an event for `call`, redacting sensitive fields in the
    /// arguments and both state snapshots.
    pub fn new(
        job_id: Uuid,
        key: IdempotencyKey,
        call: &ToolCall,
        outcome: AuditOutcome,
        before_state: Option<Value>,
        after_state: Option<Value>,
    ) -> Self {
        let request = call.request();
        Self {
            job_id,
            idempotency_key: key,
            tool_name: call.tool_name(),
            action: call.tool_name().into(),
            calendar_id: request.calendar_id().map(str::to_string),
            event_id: request.event_id().map(str::to_string),
            arguments: redact(request.arguments_value()),
            before_state: before_state.map(redact),
            after_state: after_state.map(redact),
            outcome,
            attempts: 0,
            retry_delays_ms: Vec::new(),
            timestamp_ms: millis(SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()),
        }
    }

    pub fn with_attempts(mut self, attempts: u32, retry_delays: &[Duration]) -> Self {
        self.attempts = attempts;
        self.retry_delays_ms = retry_delays.iter().copied().map(millis).collect();
        self
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AuditOutcome::Succeeded)
    }
}

/// Destination for audit events. Implementations must not block for long;
/// they are called from worker tasks.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes each event as one JSON line on the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => tracing::info!(target: "audit", "{}", line),
            Err(e) => tracing::error!(
                target: "audit",
                job_id = %event.job_id,
                error = %e,
                "Failed to serialize audit event"
            ),
        }
    }
}

/// Keeps events in memory. Used by tests and embedders that ship events
/// elsewhere themselves.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn events_for(&self, key: &IdempotencyKey) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|event| &event.idempotency_key == key)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(_) => tracing::error!("Failed to acquire lock on audit events"),
        }
    }
}

fn is_sensitive(field: &str) -> bool {
    let field = field.to_ascii_lowercase();
    SENSITIVE_FIELDS.iter().any(|s| field.contains(s))
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Mask values of object fields with sensitive names, at any depth.
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(field, inner)| {
                    if is_sensitive(&field) {
                        (field, Value::String(REDACTED.to_string()))
                    } else {
                        (field, redact(inner))
                    }
                })
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}
