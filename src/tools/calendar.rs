//! Calendar tools backed by the Google Calendar REST API.
//!
//! The OAuth access token is resolved from `api_keys.google_calendar`
//! (commonly an `env:` reference).

use async_trait::async_trait;
use serde_json::json;

use super::{
    ToolCategory, ToolContext, ToolErrorType, ToolExecutionContext, ToolHandler, ToolResult,
    ToolSpec,
};

/// Google Calendar API base.
const CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3/calendars/primary/events";

/// API key name in the tools config.
const API_KEY_NAME: &str = "google_calendar";

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

async fn resolve_token(store: &crate::store::Store) -> Result<String, ToolResult> {
    let config = super::config::load_tools_config(store)
        .await
        .unwrap_or_default();
    config.get_api_key(API_KEY_NAME).ok_or_else(|| {
        ToolResult::error_result(
            format!("No calendar token configured (api_keys.{API_KEY_NAME})"),
            ToolErrorType::MissingApiKey,
        )
    })
}

fn map_status(status: reqwest::StatusCode) -> Option<ToolErrorType> {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Some(ToolErrorType::AuthFailed)
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Some(ToolErrorType::RateLimited)
    } else if !status.is_success() {
        Some(ToolErrorType::HttpError)
    } else {
        None
    }
}

/// List upcoming calendar events.
pub struct CalendarEventsHandler {
    store: crate::store::Store,
}

#[async_trait]
impl ToolHandler for CalendarEventsHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "calendar_events".to_owned(),
            description: "List upcoming calendar events from the primary calendar.".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "max_results": {
                        "type": "integer", "default": 10, "minimum": 1, "maximum": 50,
                        "description": "Maximum events to return."
                    },
                    "time_min": {
                        "type": "string",
                        "description": "RFC 3339 lower bound (default: now)."
                    }
                }
            }),
            category: ToolCategory::Calendar,
            energy_cost: 2,
            requires_approval: false,
            is_read_only: true,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        context: &ToolExecutionContext,
    ) -> ToolResult {
        if !context.allow_network {
            return ToolResult::error_result(
                "Network access not allowed in this context",
                ToolErrorType::PermissionDenied,
            );
        }
        let token = match resolve_token(&self.store).await {
            Ok(token) => token,
            Err(result) => return result,
        };

        let max_results = arguments
            .get("max_results")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(10)
            .clamp(1, 50);
        let time_min = arguments
            .get("time_min")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());

        let response = client()
            .get(CALENDAR_API)
            .bearer_auth(&token)
            .query(&[
                ("maxResults", max_results.to_string()),
                ("timeMin", time_min),
                ("singleEvents", "true".to_owned()),
                ("orderBy", "startTime".to_owned()),
            ])
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return ToolResult::error_result(e.to_string(), ToolErrorType::NetworkError)
            }
        };
        if let Some(kind) = map_status(response.status()) {
            return ToolResult::error_result(
                format!("calendar API returned HTTP {}", response.status()),
                kind,
            );
        }

        let doc: serde_json::Value = match response.json().await {
            Ok(doc) => doc,
            Err(e) => {
                return ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed)
            }
        };

        let events: Vec<serde_json::Value> = doc
            .get("items")
            .and_then(serde_json::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|e| {
                        json!({
                            "id": e.get("id"),
                            "summary": e.get("summary"),
                            "start": e.get("start"),
                            "end": e.get("end"),
                            "location": e.get("location"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let count = events.len();
        ToolResult::success_result(
            json!({"events": events, "count": count}),
            Some(format!("{count} upcoming events")),
        )
    }
}

/// Create a calendar event.
pub struct CalendarCreateHandler {
    store: crate::store::Store,
}

#[async_trait]
impl ToolHandler for CalendarCreateHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "calendar_create".to_owned(),
            description: "Create an event on the primary calendar.".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string", "description": "Event title."},
                    "start": {"type": "string", "description": "RFC 3339 start time."},
                    "end": {"type": "string", "description": "RFC 3339 end time."},
                    "description": {"type": "string", "description": "Optional event body."},
                    "location": {"type": "string", "description": "Optional location."}
                },
                "required": ["summary", "start", "end"]
            }),
            category: ToolCategory::Calendar,
            energy_cost: 3,
            requires_approval: true,
            is_read_only: false,
            supports_parallel: false,
            allowed_contexts: vec![ToolContext::Heartbeat, ToolContext::Chat],
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        context: &ToolExecutionContext,
    ) -> ToolResult {
        if !context.allow_network {
            return ToolResult::error_result(
                "Network access not allowed in this context",
                ToolErrorType::PermissionDenied,
            );
        }
        let token = match resolve_token(&self.store).await {
            Ok(token) => token,
            Err(result) => return result,
        };

        let summary = arguments
            .get("summary")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let body = json!({
            "summary": summary,
            "description": arguments.get("description"),
            "location": arguments.get("location"),
            "start": {"dateTime": arguments.get("start")},
            "end": {"dateTime": arguments.get("end")},
        });

        let response = client()
            .post(CALENDAR_API)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return ToolResult::error_result(e.to_string(), ToolErrorType::NetworkError)
            }
        };
        if let Some(kind) = map_status(response.status()) {
            return ToolResult::error_result(
                format!("calendar API returned HTTP {}", response.status()),
                kind,
            );
        }

        let doc: serde_json::Value = response.json().await.unwrap_or_else(|_| json!({}));
        ToolResult::success_result(
            json!({"event_id": doc.get("id"), "summary": summary}),
            Some(format!("Created event: {summary}")),
        )
    }
}

/// Create all calendar tool handlers.
pub fn create_calendar_tools(store: crate::store::Store) -> Vec<std::sync::Arc<dyn ToolHandler>> {
    vec![
        std::sync::Arc::new(CalendarEventsHandler {
            store: store.clone(),
        }),
        std::sync::Arc::new(CalendarCreateHandler { store }),
    ]
}
