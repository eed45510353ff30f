//! JSON-mode chat helper with lenient parsing and declared fallbacks.
//!
//! Think-call outputs are strictly-shaped JSON documents, but models drift:
//! they wrap objects in prose or code fences, or fail entirely. Parse
//! failures are not errors here — every call site declares a fallback
//! document and the heartbeat proceeds.

use regex::Regex;

use super::{ChatMessage, ChatRequest, LlmProvider};

/// Extract the outermost `{ … }` object from free text.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let snippet = &text[start..=end];
    serde_json::from_str(snippet)
        .ok()
        .filter(serde_json::Value::is_object)
}

/// Parse a raw model response into a JSON object, else return the fallback.
pub fn parse_json_response(raw: &str, fallback: &serde_json::Value) -> serde_json::Value {
    if raw.is_empty() {
        return fallback.clone();
    }
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(raw) {
        if parsed.is_object() {
            return parsed;
        }
    }
    if let Ok(re) = Regex::new(r"\{[\s\S]*\}") {
        if let Some(m) = re.find(raw) {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(m.as_str()) {
                if parsed.is_object() {
                    return parsed;
                }
            }
        }
    }
    fallback.clone()
}

/// Run a JSON-mode completion, returning `(document, raw_text)`.
///
/// Provider errors and unparseable output both resolve to the fallback; the
/// raw text is preserved for auditability where available.
pub async fn chat_json(
    provider: &dyn LlmProvider,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    fallback: &serde_json::Value,
) -> (serde_json::Value, String) {
    let request = ChatRequest {
        messages,
        max_tokens,
        temperature: 0.2,
        json_mode: true,
    };

    match provider.complete(request).await {
        Ok(raw) => {
            let doc = parse_json_response(&raw, fallback);
            (doc, raw)
        }
        Err(e) => {
            tracing::warn!(model = provider.model_id(), error = %e, "chat_json falling back");
            (fallback.clone(), String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_json_object_plain() {
        let doc = extract_json_object(r#"{"a": 1}"#).expect("object");
        assert_eq!(doc, json!({"a": 1}));
    }

    #[test]
    fn test_extract_json_object_wrapped() {
        let doc = extract_json_object("Sure! Here you go:\n```json\n{\"a\": 1}\n```").expect("object");
        assert_eq!(doc, json!({"a": 1}));
    }

    #[test]
    fn test_extract_json_object_none() {
        assert!(extract_json_object("no braces here").is_none());
        assert!(extract_json_object("").is_none());
    }

    #[test]
    fn test_parse_json_response_fallback() {
        let fallback = json!({"actions": []});
        assert_eq!(parse_json_response("", &fallback), fallback);
        assert_eq!(parse_json_response("garbage", &fallback), fallback);
        assert_eq!(parse_json_response("[1, 2]", &fallback), fallback);
    }

    #[test]
    fn test_parse_json_response_embedded() {
        let fallback = json!({});
        let parsed = parse_json_response("prefix {\"k\": \"v\"} suffix", &fallback);
        assert_eq!(parsed, json!({"k": "v"}));
    }
}
