//! Google Calendar v3 REST adapter.
//!
//! Maps each tool onto one endpoint (`events.insert`, `events.patch`,
//! `events.delete`, `freeBusy.query`) and classifies failures for the retry
//! policy. The bearer token is supplied from outside; acquiring or refreshing
//! it is not this adapter's concern.

use super::{AdapterClient, AdapterError, ToolOutput};
use crate::error::{DispatchError, DispatchResult};
use crate::retry::MAX_RETRY_AFTER;
use crate::tool::{
    Attendee, CreateEvent, DeleteEvent, EventTime, FreebusyQuery, ToolCall, ToolRequest,
    UpdateEvent,
};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Map, Value};
use std::time::Duration;

const MAX_DETAIL_CHARS: usize = 200;

pub struct GoogleCalendarClient {
    http: reqwest::Client,
    base_url: Url,
    access_token: Option<String>,
}

impl GoogleCalendarClient {
    pub fn new(
        base_url: &str,
        access_token: Option<String>,
        timeout: Duration,
    ) -> DispatchResult<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            DispatchError::ConfigurationError(format!("Invalid calendar API base URL: {}", e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(DispatchError::ConfigurationError(format!(
                "Calendar API base URL '{}' cannot carry a path",
                base_url
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::ConfigurationError(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            access_token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value, AdapterError> {
        let response = builder.send().await.map_err(classify_transport)?;
        read_response(response).await
    }

    async fn create_event(&self, args: &CreateEvent) -> Result<ToolOutput, AdapterError> {
        let url = self.endpoint(&["calendars", &args.calendar_id, "events"]);
        let created = self
            .send(self.request(Method::POST, url).json(&event_body(args)))
            .await?;

        Ok(json!({ "event_id": created.get("id").cloned().unwrap_or(Value::Null) }))
    }

    async fn update_event(&self, args: &UpdateEvent) -> Result<ToolOutput, AdapterError> {
        let url = self.endpoint(&["calendars", &args.calendar_id, "events", &args.event_id]);
        let updated = self
            .send(self.request(Method::PATCH, url).json(&patch_body(args)))
            .await?;

        let event_id = updated
            .get("id")
            .cloned()
            .unwrap_or_else(|| Value::String(args.event_id.clone()));
        Ok(json!({
            "event_id": event_id,
            "updated_fields": args.changed_fields(),
        }))
    }

    async fn delete_event(&self, args: &DeleteEvent) -> Result<ToolOutput, AdapterError> {
        let mut url = self.endpoint(&["calendars", &args.calendar_id, "events", &args.event_id]);
        if let Some(send_updates) = &args.send_updates {
            url.query_pairs_mut().append_pair("sendUpdates", send_updates);
        }
        self.send(self.request(Method::DELETE, url)).await?;

        Ok(json!({ "deleted": true }))
    }

    async fn freebusy_query(&self, args: &FreebusyQuery) -> Result<ToolOutput, AdapterError> {
        let url = self.endpoint(&["freeBusy"]);
        let mut body = json!({
            "timeMin": args.time_min,
            "timeMax": args.time_max,
            "items": args.calendar_ids.iter().map(|id| json!({ "id": id })).collect::<Vec<_>>(),
        });
        if let Some(time_zone) = &args.time_zone {
            body["timeZone"] = json!(time_zone);
        }

        let response = self.send(self.request(Method::POST, url).json(&body)).await?;
        Ok(json!({ "busy_intervals": busy_intervals(&response, &args.calendar_ids) }))
    }
}

#[async_trait]
impl AdapterClient for GoogleCalendarClient {
    async fn execute(&self, call: &ToolCall) -> Result<ToolOutput, AdapterError> {
        match call.request() {
            ToolRequest::CreateEvent(args) => self.create_event(args).await,
            ToolRequest::UpdateEvent(args) => self.update_event(args).await,
            ToolRequest::DeleteEvent(args) => self.delete_event(args).await,
            ToolRequest::FreebusyQuery(args) => self.freebusy_query(args).await,
        }
    }

    async fn snapshot(&self, call: &ToolCall) -> Option<Value> {
        let request = call.request();
        let (calendar_id, event_id) = (request.calendar_id()?, request.event_id()?);

        let url = self.endpoint(&["calendars", calendar_id, "events", event_id]);
        match self.send(self.request(Method::GET, url)).await {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(event_id = %event_id, error = %e, "Could not fetch event snapshot for audit");
                None
            }
        }
    }
}

async fn read_response(response: Response) -> Result<Value, AdapterError> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body, retry_after));
    }

    let bytes = response.bytes().await.map_err(classify_transport)?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| AdapterError::fatal(format!("Invalid response body: {}", e)))
}

/// 408, 429 and 5xx are worth retrying; every other status is final.
pub fn classify_status(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> AdapterError {
    let detail: String = format!("HTTP {}: {}", status.as_u16(), body.trim())
        .chars()
        .take(MAX_DETAIL_CHARS)
        .collect();

    let transient = status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error();

    if transient {
        let error = AdapterError::transient(detail);
        match retry_after {
            Some(hint) => error.with_retry_after(hint),
            None => error,
        }
    } else {
        AdapterError::fatal(detail)
    }
}

fn classify_transport(err: reqwest::Error) -> AdapterError {
    if err.is_builder() || err.is_decode() || err.is_redirect() {
        AdapterError::fatal(err.to_string())
    } else {
        // timeouts, refused connections, reset streams
        AdapterError::transient(err.to_string())
    }
}

/// Only the delta-seconds form of `Retry-After` is honoured, up to
/// [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

fn time_body(time: &EventTime) -> Value {
    let mut body = Map::new();
    if let Some(date_time) = &time.date_time {
        body.insert("dateTime".into(), json!(date_time));
    }
    if let Some(date) = &time.date {
        body.insert("date".into(), json!(date));
    }
    if let Some(time_zone) = &time.time_zone {
        body.insert("timeZone".into(), json!(time_zone));
    }
    Value::Object(body)
}

fn attendees_body(attendees: &[Attendee]) -> Value {
    attendees
        .iter()
        .map(|a| {
            let mut body = json!({ "email": a.email, "optional": a.optional });
            if let Some(name) = &a.display_name {
                body["displayName"] = json!(name);
            }
            body
        })
        .collect()
}

fn event_body(args: &CreateEvent) -> Value {
    let mut body = json!({
        "summary": args.summary,
        "start": time_body(&args.start),
        "end": time_body(&args.end),
    });
    if let Some(description) = &args.description {
        body["description"] = json!(description);
    }
    if let Some(location) = &args.location {
        body["location"] = json!(location);
    }
    if !args.attendees.is_empty() {
        body["attendees"] = attendees_body(&args.attendees);
    }
    body
}

fn patch_body(args: &UpdateEvent) -> Value {
    let mut body = Map::new();
    if let Some(summary) = &args.summary {
        body.insert("summary".into(), json!(summary));
    }
    if let Some(description) = &args.description {
        body.insert("description".into(), json!(description));
    }
    if let Some(location) = &args.location {
        body.insert("location".into(), json!(location));
    }
    if let Some(start) = &args.start {
        body.insert("start".into(), time_body(start));
    }
    if let Some(end) = &args.end {
        body.insert("end".into(), time_body(end));
    }
    if let Some(attendees) = &args.attendees {
        body.insert("attendees".into(), attendees_body(attendees));
    }
    Value::Object(body)
}

fn busy_intervals(response: &Value, calendar_ids: &[String]) -> Value {
    let mut intervals = Map::new();
    for id in calendar_ids {
        let busy = response
            .pointer(&format!("/calendars/{}/busy", json_pointer_escape(id)))
            .cloned()
            .unwrap_or_else(|| json!([]));
        intervals.insert(id.clone(), busy);
    }
    Value::Object(intervals)
}

fn json_pointer_escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ErrorKind;

    fn client() -> GoogleCalendarClient {
        GoogleCalendarClient::new(
            "https://calendar.example.test/calendar/v3",
            Some("token".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_status_classification() {
        for code in [408u16, 429, 500, 502, 503, 504] {
            let error = classify_status(StatusCode::from_u16(code).unwrap(), "", None);
            assert_eq!(error.kind, ErrorKind::Transient, "status {}", code);
        }
        for code in [400u16, 401, 403, 404, 410] {
            let error = classify_status(StatusCode::from_u16(code).unwrap(), "", None);
            assert_eq!(error.kind, ErrorKind::Fatal, "status {}", code);
        }
    }

    #[test]
    fn test_retry_after_attached_to_transient_only() {
        let hint = Some(Duration::from_secs(7));
        let limited = classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down", hint);
        assert_eq!(limited.retry_after, hint);
        assert!(limited.detail.starts_with("HTTP 429: slow down"));

        let missing = classify_status(StatusCode::NOT_FOUND, "", hint);
        assert_eq!(missing.retry_after, None);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(
            parse_retry_after("18446744073709551615"),
            Some(MAX_RETRY_AFTER)
        );
    }

    #[test]
    fn test_endpoint_encodes_calendar_ids() {
        let url = client().endpoint(&["calendars", "team@example.com", "events", "a/b#c"]);
        assert_eq!(
            url.path(),
            "/calendar/v3/calendars/team@example.com/events/a%2Fb%23c"
        );
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(GoogleCalendarClient::new("not a url", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_patch_body_only_contains_changes() {
        let update = UpdateEvent {
            calendar_id: "primary".into(),
            event_id: "evt1".into(),
            summary: Some("Renamed".into()),
            description: None,
            location: None,
            start: Some(EventTime::at("2026-03-02T10:00:00Z")),
            end: None,
            attendees: None,
        };
        assert_eq!(
            patch_body(&update),
            json!({"summary": "Renamed", "start": {"dateTime": "2026-03-02T10:00:00Z"}})
        );
    }

    #[test]
    fn test_busy_intervals_default_to_empty() {
        let response = json!({
            "calendars": {
                "primary": {"busy": [{"start": "t0", "end": "t1"}]}
            }
        });
        let ids = vec!["primary".to_string(), "missing".to_string()];
        assert_eq!(
            busy_intervals(&response, &ids),
            json!({
                "primary": [{"start": "t0", "end": "t1"}],
                "missing": []
            })
        );
    }
}
