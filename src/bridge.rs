//! RabbitMQ bridge over the management HTTP API.
//!
//! The broker is optional: every operation degrades to a no-op when the
//! management API is unreachable, and outbox writes stay durable in the
//! store regardless. Wire format is JSON `{id, kind, payload}` in both
//! directions; the inbox consumer extracts `payload.content` when present.

use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, warn};

use crate::config::RabbitSettings;
use crate::store::{OutboxPayload, Store};

/// HTTP timeout for management-API requests.
const REQUEST_TIMEOUT_SECS: u64 = 5;

/// Bridge between the store's outbox/inbox and a RabbitMQ broker.
pub struct RabbitBridge {
    settings: RabbitSettings,
    store: Store,
    client: reqwest::Client,
    last_inbox_poll: tokio::sync::Mutex<Option<Instant>>,
}

impl RabbitBridge {
    /// Create a bridge; call [`RabbitBridge::ensure_ready`] before use.
    pub fn new(store: Store, settings: RabbitSettings) -> Self {
        Self {
            settings,
            store,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            last_inbox_poll: tokio::sync::Mutex::new(None),
        }
    }

    fn vhost_path(&self) -> String {
        if self.settings.vhost == "/" {
            "%2F".to_owned()
        } else {
            percent_encode(&self.settings.vhost)
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}{}", self.settings.management_url, path);
        let mut builder = self
            .client
            .request(method, url)
            .basic_auth(&self.settings.user, Some(&self.settings.password));
        if let Some(payload) = payload {
            builder = builder.json(payload);
        }
        builder.send().await
    }

    /// Declare the durable queues. Failures are logged and swallowed; the
    /// bridge simply stays dormant until the broker appears.
    pub async fn ensure_ready(&self) {
        let overview = self.request(reqwest::Method::GET, "/api/overview", None).await;
        match overview {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(status = %response.status(), "rabbitmq overview failed; bridge dormant");
                return;
            }
            Err(e) => {
                warn!(error = %e, "rabbitmq unreachable; bridge dormant");
                return;
            }
        }

        let vhost = self.vhost_path();
        for queue in [&self.settings.outbox_queue, &self.settings.inbox_queue] {
            let path = format!("/api/queues/{vhost}/{}", percent_encode(queue));
            let payload = json!({"durable": true, "auto_delete": false, "arguments": {}});
            match self.request(reqwest::Method::PUT, &path, Some(&payload)).await {
                Ok(response)
                    if matches!(response.status().as_u16(), 200 | 201 | 204) => {}
                Ok(response) => {
                    warn!(queue = %queue, status = %response.status(), "queue declare failed");
                    return;
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "queue declare failed");
                    return;
                }
            }
        }
        debug!("rabbitmq bridge ready");
    }

    /// Publish specific payloads (e.g. just-applied effects). Returns how
    /// many were acked; store rows transition together with the ack.
    pub async fn publish_outbox_payloads(&self, payloads: &[OutboxPayload]) -> usize {
        let vhost = self.vhost_path();
        let mut published = 0usize;

        for message in payloads {
            let body = json!({
                "id": message.id,
                "kind": message.kind,
                "payload": message.payload,
            });
            let publish = json!({
                "properties": {"content_type": "application/json"},
                "routing_key": self.settings.outbox_queue,
                "payload": body.to_string(),
                "payload_encoding": "string",
            });
            let path = format!("/api/exchanges/{vhost}/amq.default/publish");

            let routed = match self.request(reqwest::Method::POST, &path, Some(&publish)).await {
                Ok(response) if response.status().is_success() => response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|doc| doc.get("routed").and_then(serde_json::Value::as_bool))
                    .unwrap_or(false),
                Ok(response) => {
                    warn!(status = %response.status(), "outbox publish failed");
                    false
                }
                Err(e) => {
                    warn!(error = %e, "outbox publish failed");
                    false
                }
            };

            if routed {
                if let Err(e) = self.store.mark_outbox_sent(message.id).await {
                    warn!(error = %e, "failed to mark outbox message sent");
                }
                published = published.saturating_add(1);
            } else {
                if let Err(e) = self
                    .store
                    .mark_outbox_failed(message.id, "publish not routed")
                    .await
                {
                    warn!(error = %e, "failed to mark outbox message failed");
                }
                // Stop on the first failure; order within the outbox is
                // publish order.
                break;
            }
        }

        published
    }

    /// Flush pending outbox rows from the store, in write order.
    pub async fn flush_outbox(&self, max_messages: i64) -> usize {
        let pending = match self.store.pending_outbox(max_messages).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "failed to read pending outbox");
                return 0;
            }
        };
        if pending.is_empty() {
            return 0;
        }
        self.publish_outbox_payloads(&pending).await
    }

    /// Pull up to `max_messages` inbox messages, writing each to working
    /// memory and bumping `last_user_contact`. Rate-limited by
    /// `RABBITMQ_POLL_INBOX_EVERY`.
    pub async fn poll_inbox_messages(&self, max_messages: u32) -> usize {
        {
            let mut last = self.last_inbox_poll.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < self.settings.poll_inbox_every {
                    return 0;
                }
            }
            *last = Some(Instant::now());
        }

        let vhost = self.vhost_path();
        let path = format!(
            "/api/queues/{vhost}/{}/get",
            percent_encode(&self.settings.inbox_queue)
        );
        let payload = json!({
            "count": max_messages,
            "ackmode": "ack_requeue_false",
            "encoding": "auto",
            "truncate": 50000,
        });

        let messages: Vec<serde_json::Value> =
            match self.request(reqwest::Method::POST, &path, Some(&payload)).await {
                Ok(response) if response.status().is_success() => {
                    response.json().await.unwrap_or_default()
                }
                Ok(response) => {
                    debug!(status = %response.status(), "inbox get failed");
                    return 0;
                }
                Err(e) => {
                    debug!(error = %e, "inbox get failed");
                    return 0;
                }
            };

        let mut ingested = 0usize;
        for message in messages {
            let raw_payload = message.get("payload").cloned().unwrap_or_default();
            let content = extract_inbox_content(&raw_payload);

            let write = async {
                self.store.add_to_working_memory(&content, 86_400).await?;
                self.store.bump_last_user_contact().await
            };
            match write.await {
                Ok(()) => ingested = ingested.saturating_add(1),
                Err(e) => {
                    warn!(error = %e, "failed to ingest inbox message");
                    return ingested;
                }
            }
        }

        ingested
    }
}

/// Extract the logical content from an inbox payload: `payload.content` when
/// present, else the payload itself.
pub fn extract_inbox_content(payload: &serde_json::Value) -> String {
    let parsed: serde_json::Value = match payload {
        serde_json::Value::String(s) => serde_json::from_str(s)
            .unwrap_or_else(|_| serde_json::Value::String(s.clone())),
        other => other.clone(),
    };

    match parsed.get("content") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => match parsed {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        },
    }
}

/// Minimal percent-encoding for path segments.
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(char::from(byte));
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_content_field() {
        let payload = json!({"content": "hello there", "meta": 1});
        assert_eq!(extract_inbox_content(&payload), "hello there");
    }

    #[test]
    fn test_extract_from_json_string() {
        let payload = json!(r#"{"content": "wrapped"}"#);
        assert_eq!(extract_inbox_content(&payload), "wrapped");
    }

    #[test]
    fn test_extract_plain_string_passthrough() {
        let payload = json!("just text");
        assert_eq!(extract_inbox_content(&payload), "just text");
    }

    #[test]
    fn test_extract_object_without_content() {
        let payload = json!({"kind": "ping"});
        assert_eq!(extract_inbox_content(&payload), r#"{"kind":"ping"}"#);
    }

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("hexis.outbox"), "hexis.outbox");
        assert_eq!(percent_encode("a/b c"), "a%2Fb%20c");
    }
}
