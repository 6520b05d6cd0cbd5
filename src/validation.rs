use crate::error::{DispatchError, DispatchResult};
use crate::key_generator::{IdempotencyKey, KeyGenerator};
use crate::tool::{ToolCall, ToolName, ToolRequest};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Untyped call as received from the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Turn a raw call into a typed, validated [`ToolCall`].
    pub fn validate_call(request: CallRequest) -> DispatchResult<ToolCall> {
        let name = ToolName::parse(request.tool_name.trim()).ok_or_else(|| {
            DispatchError::ValidationError(format!(
                "Unknown tool '{}'. Must be one of: {:?}",
                request.tool_name,
                ToolName::ALL.map(|tool| tool.as_str())
            ))
        })?;

        if !request.arguments.is_object() {
            return Err(DispatchError::ValidationError(
                "'arguments' must be a JSON object".to_string(),
            ));
        }

        let tool_request = match name {
            ToolName::CreateEvent => ToolRequest::CreateEvent(parse_arguments(name, request.arguments)?),
            ToolName::UpdateEvent => ToolRequest::UpdateEvent(parse_arguments(name, request.arguments)?),
            ToolName::DeleteEvent => ToolRequest::DeleteEvent(parse_arguments(name, request.arguments)?),
            ToolName::FreebusyQuery => {
                ToolRequest::FreebusyQuery(parse_arguments(name, request.arguments)?)
            }
        };

        tool_request.validate().map_err(|e| {
            DispatchError::ValidationError(format!("Invalid arguments for {}: {}", name, e))
        })?;

        let call = ToolCall::new(tool_request);
        match request.idempotency_key {
            Some(key) => {
                let key = key.trim();
                KeyGenerator::caller_key(key)?;
                Ok(call.with_idempotency_key(key))
            }
            None => Ok(call),
        }
    }

    /// Validates a key taken from a request path
    pub fn validate_job_key(raw: &str) -> DispatchResult<IdempotencyKey> {
        IdempotencyKey::parse(raw.trim())
    }
}

fn parse_arguments<T: DeserializeOwned>(tool: ToolName, arguments: Value) -> DispatchResult<T> {
    serde_json::from_value(arguments).map_err(|e| {
        DispatchError::ValidationError(format!("Invalid arguments for {}: {}", tool, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(tool_name: &str, arguments: Value) -> CallRequest {
        CallRequest {
            tool_name: tool_name.to_string(),
            arguments,
            idempotency_key: None,
        }
    }

    #[test]
    fn test_valid_create_event() {
        let call = RequestValidator::validate_call(request(
            "create_event",
            json!({
                "calendar_id": "primary",
                "summary": "Planning",
                "start": {"date_time": "2024-05-01T10:00:00Z"},
                "end": {"date_time": "2024-05-01T11:00:00Z"},
                "attendees": [{"email": "a@example.com"}]
            }),
        ))
        .unwrap();
        assert_eq!(call.tool_name(), ToolName::CreateEvent);
        assert_eq!(call.request().resource_group(), "primary");
    }

    #[test]
    fn test_unknown_tool() {
        let result = RequestValidator::validate_call(request("list_events", json!({})));
        assert!(matches!(result, Err(DispatchError::ValidationError(_))));
    }

    #[test]
    fn test_arguments_must_be_object() {
        let result = RequestValidator::validate_call(request("delete_event", json!([1, 2])));
        assert!(result.is_err());
    }

    #[test]
    fn test_schema_and_field_rules() {
        // missing event_id
        assert!(RequestValidator::validate_call(request(
            "delete_event",
            json!({"calendar_id": "primary"})
        ))
        .is_err());

        // empty calendar_id
        assert!(RequestValidator::validate_call(request(
            "delete_event",
            json!({"calendar_id": "", "event_id": "e1"})
        ))
        .is_err());

        // update with nothing to change
        assert!(RequestValidator::validate_call(request(
            "update_event",
            json!({"calendar_id": "primary", "event_id": "e1"})
        ))
        .is_err());

        // bad attendee email
        assert!(RequestValidator::validate_call(request(
            "update_event",
            json!({"calendar_id": "primary", "event_id": "e1", "attendees": [{"email": "nope"}]})
        ))
        .is_err());

        // both date and date_time
        assert!(RequestValidator::validate_call(request(
            "create_event",
            json!({
                "calendar_id": "primary",
                "summary": "x",
                "start": {"date": "2024-05-01", "date_time": "2024-05-01T10:00:00Z"},
                "end": {"date": "2024-05-02"}
            })
        ))
        .is_err());
    }

    #[test]
    fn test_caller_key() {
        let mut raw = request(
            "freebusy_query",
            json!({
                "calendar_ids": ["primary"],
                "time_min": "2024-05-01T00:00:00Z",
                "time_max": "2024-05-02T00:00:00Z"
            }),
        );
        raw.idempotency_key = Some("client-42".to_string());
        let call = RequestValidator::validate_call(raw.clone()).unwrap();
        assert_eq!(call.idempotency_key(), Some("client-42"));

        raw.idempotency_key = Some("has spaces".to_string());
        assert!(RequestValidator::validate_call(raw).is_err());
    }

    #[test]
    fn test_validate_job_key() {
        assert!(RequestValidator::validate_job_key("idem:abc").is_ok());
        assert!(RequestValidator::validate_job_key("abc").is_err());
    }
}
