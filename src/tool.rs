//! Typed tool calls accepted by the dispatcher.
//!
//! Every call is a [`ToolRequest`] variant tagged by `tool_name`, carrying the
//! already-validated arguments for that tool. Optional fields are omitted when
//! serialized so that two calls with the same content produce the same
//! canonical form (see [`crate::key_generator`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    CreateEvent,
    UpdateEvent,
    DeleteEvent,
    FreebusyQuery,
}

impl ToolName {
    pub const ALL: [ToolName; 4] = [
        ToolName::CreateEvent,
        ToolName::UpdateEvent,
        ToolName::DeleteEvent,
        ToolName::FreebusyQuery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::CreateEvent => "create_event",
            ToolName::UpdateEvent => "update_event",
            ToolName::DeleteEvent => "delete_event",
            ToolName::FreebusyQuery => "freebusy_query",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == name)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start or end of an event: either a timed `date_time` or an all-day `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_event_time"))]
pub struct EventTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl EventTime {
    pub fn at(date_time: impl Into<String>) -> Self {
        Self {
            date_time: Some(date_time.into()),
            date: None,
            time_zone: None,
        }
    }
}

fn validate_event_time(time: &EventTime) -> Result<(), ValidationError> {
    match (&time.date_time, &time.date) {
        (Some(_), None) | (None, Some(_)) => Ok(()),
        (Some(_), Some(_)) => Err(ValidationError::new("date_and_date_time")),
        (None, None) => Err(ValidationError::new("missing_date_or_date_time")),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Attendee {
    #[validate(email)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CreateEvent {
    #[validate(length(min = 1))]
    pub calendar_id: String,
    #[validate(length(min = 1))]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[validate(nested)]
    pub start: EventTime,
    #[validate(nested)]
    pub end: EventTime,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(nested)]
    pub attendees: Vec<Attendee>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_has_changes"))]
pub struct UpdateEvent {
    #[validate(length(min = 1))]
    pub calendar_id: String,
    #[validate(length(min = 1))]
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub start: Option<EventTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub end: Option<EventTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub attendees: Option<Vec<Attendee>>,
}

impl UpdateEvent {
    /// Names of the fields this update changes, in declaration order.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.summary.is_some() {
            fields.push("summary");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.location.is_some() {
            fields.push("location");
        }
        if self.start.is_some() {
            fields.push("start");
        }
        if self.end.is_some() {
            fields.push("end");
        }
        if self.attendees.is_some() {
            fields.push("attendees");
        }
        fields
    }
}

fn validate_has_changes(update: &UpdateEvent) -> Result<(), ValidationError> {
    if update.changed_fields().is_empty() {
        return Err(ValidationError::new("no_fields_to_change"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DeleteEvent {
    #[validate(length(min = 1))]
    pub calendar_id: String,
    #[validate(length(min = 1))]
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_send_updates"))]
    pub send_updates: Option<String>,
}

fn validate_send_updates(value: &str) -> Result<(), ValidationError> {
    match value {
        "all" | "externalOnly" | "none" => Ok(()),
        _ => Err(ValidationError::new("send_updates")),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_calendar_ids"))]
pub struct FreebusyQuery {
    #[validate(length(min = 1))]
    pub calendar_ids: Vec<String>,
    #[validate(length(min = 1))]
    pub time_min: String,
    #[validate(length(min = 1))]
    pub time_max: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

fn validate_calendar_ids(query: &FreebusyQuery) -> Result<(), ValidationError> {
    if query.calendar_ids.iter().any(|id| id.trim().is_empty()) {
        return Err(ValidationError::new("empty_calendar_id"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool_name", content = "arguments", rename_all = "snake_case")]
pub enum ToolRequest {
    CreateEvent(CreateEvent),
    UpdateEvent(UpdateEvent),
    DeleteEvent(DeleteEvent),
    FreebusyQuery(FreebusyQuery),
}

impl ToolRequest {
    pub fn name(&self) -> ToolName {
        match self {
            ToolRequest::CreateEvent(_) => ToolName::CreateEvent,
            ToolRequest::UpdateEvent(_) => ToolName::UpdateEvent,
            ToolRequest::DeleteEvent(_) => ToolName::DeleteEvent,
            ToolRequest::FreebusyQuery(_) => ToolName::FreebusyQuery,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            ToolRequest::CreateEvent(args) => args.validate(),
            ToolRequest::UpdateEvent(args) => args.validate(),
            ToolRequest::DeleteEvent(args) => args.validate(),
            ToolRequest::FreebusyQuery(args) => args.validate(),
        }
    }

    /// Quota group this call is charged against. Free/busy queries are
    /// charged to their first calendar.
    pub fn resource_group(&self) -> &str {
        match self {
            ToolRequest::CreateEvent(args) => &args.calendar_id,
            ToolRequest::UpdateEvent(args) => &args.calendar_id,
            ToolRequest::DeleteEvent(args) => &args.calendar_id,
            ToolRequest::FreebusyQuery(args) => args
                .calendar_ids
                .first()
                .map(String::as_str)
                .unwrap_or_default(),
        }
    }

    pub fn calendar_id(&self) -> Option<&str> {
        match self {
            ToolRequest::FreebusyQuery(_) => None,
            other => Some(other.resource_group()),
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        match self {
            ToolRequest::UpdateEvent(args) => Some(&args.event_id),
            ToolRequest::DeleteEvent(args) => Some(&args.event_id),
            _ => None,
        }
    }

    /// Whether the call modifies an existing event whose prior state is worth
    /// capturing for the audit trail.
    pub fn mutates_existing(&self) -> bool {
        matches!(
            self,
            ToolRequest::UpdateEvent(_) | ToolRequest::DeleteEvent(_)
        )
    }

    pub fn arguments_value(&self) -> serde_json::Value {
        let value = match self {
            ToolRequest::CreateEvent(args) => serde_json::to_value(args),
            ToolRequest::UpdateEvent(args) => serde_json::to_value(args),
            ToolRequest::DeleteEvent(args) => serde_json::to_value(args),
            ToolRequest::FreebusyQuery(args) => serde_json::to_value(args),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// A validated call. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    request: ToolRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<String>,
}

impl ToolCall {
    pub fn new(request: ToolRequest) -> Self {
        Self {
            request,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn request(&self) -> &ToolRequest {
        &self.request
    }

    pub fn tool_name(&self) -> ToolName {
        self.request.name()
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }
}

impl From<ToolRequest> for ToolCall {
    fn from(request: ToolRequest) -> Self {
        Self::new(request)
    }
}
