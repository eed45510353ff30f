//! Web tools: search, fetch with SSRF protection, and LLM-backed summarize.

use async_trait::async_trait;
use serde_json::json;
use url::Url;

use crate::llm::json::chat_json;
use crate::llm::{load_llm_binding, resolve_provider, ChatMessage};
use crate::store::Store;

use super::{
    ToolCategory, ToolErrorType, ToolExecutionContext, ToolHandler, ToolResult, ToolSpec,
};

/// Maximum extracted body size in bytes for web_fetch.
const MAX_BODY_BYTES: usize = 100 * 1024;

/// Maximum redirect hops followed manually (SSRF check runs per hop).
const MAX_REDIRECT_HOPS: usize = 10;

/// HTTP timeout for web requests.
const FETCH_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// SSRF guard
// ---------------------------------------------------------------------------

/// Reject URLs that resolve to localhost or private/link-local addresses.
///
/// Checks the scheme, the hostname patterns, and every resolved address.
pub async fn ssrf_check(url: &Url) -> Result<(), String> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("scheme '{}' not allowed", url.scheme()));
    }

    let Some(host) = url.host_str() else {
        return Err("URL has no host".to_owned());
    };
    let host_lower = host.to_lowercase();
    if host_lower == "localhost" || host_lower.ends_with(".localhost") {
        return Err("localhost is not allowed".to_owned());
    }

    // Literal IPs are checked directly; hostnames are resolved.
    if let Ok(addr) = host.parse::<std::net::IpAddr>() {
        return check_ip(addr);
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| format!("DNS resolution failed: {e}"))?;
    for addr in addrs {
        check_ip(addr.ip())?;
    }
    Ok(())
}

fn check_ip(addr: std::net::IpAddr) -> Result<(), String> {
    let private = match addr {
        std::net::IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        std::net::IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    };
    if private {
        return Err(format!("address {addr} is private or local"));
    }
    Ok(())
}

/// Strip markup from an HTML document into readable text.
pub fn extract_text(html: &str) -> String {
    // Drop script/style bodies first, then all tags, then collapse runs of
    // whitespace.
    let mut text = html.to_owned();
    for pattern in [
        r"(?is)<script[^>]*>.*?</script>",
        r"(?is)<style[^>]*>.*?</style>",
        r"(?is)<!--.*?-->",
    ] {
        if let Ok(re) = regex::Regex::new(pattern) {
            text = re.replace_all(&text, " ").into_owned();
        }
    }
    if let Ok(re) = regex::Regex::new(r"(?s)<[^>]+>") {
        text = re.replace_all(&text, " ").into_owned();
    }
    text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_body(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !body.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    format!("{}...[truncated]", &body[..end])
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
        .build()
        .unwrap_or_default()
}

/// Fetch a URL with manual redirect following, SSRF-checking every hop.
async fn fetch_with_ssrf_guard(url_str: &str) -> Result<String, ToolResult> {
    let mut current = Url::parse(url_str).map_err(|e| {
        ToolResult::error_result(format!("invalid URL: {e}"), ToolErrorType::InvalidParams)
    })?;
    let client = http_client();

    for _hop in 0..MAX_REDIRECT_HOPS {
        if let Err(reason) = ssrf_check(&current).await {
            return Err(ToolResult::error_result(
                format!("blocked URL {current}: {reason}"),
                ToolErrorType::PathNotAllowed,
            ));
        }

        let response = client.get(current.clone()).send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                ToolErrorType::FetchTimeout
            } else {
                ToolErrorType::NetworkError
            };
            ToolResult::error_result(format!("GET failed: {e}"), kind)
        })?;

        let status = response.status();
        if status.is_redirection() {
            let Some(location) = response
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
            else {
                return Err(ToolResult::error_result(
                    "redirect response missing Location header",
                    ToolErrorType::HttpError,
                ));
            };
            current = current.join(location).map_err(|e| {
                ToolResult::error_result(
                    format!("invalid redirect URL: {e}"),
                    ToolErrorType::HttpError,
                )
            })?;
            continue;
        }

        if !status.is_success() {
            return Err(ToolResult::error_result(
                format!("HTTP {status} from {current}"),
                ToolErrorType::HttpError,
            ));
        }

        let body = response.text().await.map_err(|e| {
            ToolResult::error_result(
                format!("failed to read response body: {e}"),
                ToolErrorType::NetworkError,
            )
        })?;
        return Ok(body);
    }

    Err(ToolResult::error_result(
        format!("too many redirects (>{MAX_REDIRECT_HOPS})"),
        ToolErrorType::HttpError,
    ))
}

// ---------------------------------------------------------------------------
// web_search
// ---------------------------------------------------------------------------

/// Web search via a pluggable provider; key under `api_keys.web_search`.
pub struct WebSearchHandler {
    store: Store,
}

/// Default search API endpoint (Tavily-compatible).
const SEARCH_ENDPOINT: &str = "https://api.tavily.com/search";

#[async_trait]
impl ToolHandler for WebSearchHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_search".to_owned(),
            description: "Search the web for current information. Returns titles, URLs, and \
                          snippets."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query."},
                    "max_results": {
                        "type": "integer", "default": 5, "minimum": 1, "maximum": 10,
                        "description": "Maximum results to return."
                    }
                },
                "required": ["query"]
            }),
            category: ToolCategory::Web,
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

        let config = super::config::load_tools_config(&self.store)
            .await
            .unwrap_or_default();
        let Some(api_key) = config.get_api_key("web_search") else {
            return ToolResult::error_result(
                "No search API key configured (api_keys.web_search)",
                ToolErrorType::MissingApiKey,
            );
        };

        let query = arguments
            .get("query")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let max_results = arguments
            .get("max_results")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(5)
            .clamp(1, 10);

        let response = http_client()
            .post(SEARCH_ENDPOINT)
            .json(&json!({
                "api_key": api_key,
                "query": query,
                "max_results": max_results,
            }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let kind = if e.is_timeout() {
                    ToolErrorType::FetchTimeout
                } else {
                    ToolErrorType::NetworkError
                };
                return ToolResult::error_result(format!("search request failed: {e}"), kind);
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return ToolResult::error_result(
                format!("search API auth failed: HTTP {status}"),
                ToolErrorType::AuthFailed,
            );
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return ToolResult::error_result("search API rate limited", ToolErrorType::RateLimited);
        }
        if !status.is_success() {
            return ToolResult::error_result(
                format!("search API returned HTTP {status}"),
                ToolErrorType::HttpError,
            );
        }

        let doc: serde_json::Value = match response.json().await {
            Ok(doc) => doc,
            Err(e) => {
                return ToolResult::error_result(
                    format!("invalid search response: {e}"),
                    ToolErrorType::ExecutionFailed,
                )
            }
        };

        let results: Vec<serde_json::Value> = doc
            .get("results")
            .and_then(serde_json::Value::as_array)
            .map(|list| {
                list.iter()
                    .map(|r| {
                        json!({
                            "title": r.get("title"),
                            "url": r.get("url"),
                            "snippet": r.get("content"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let count = results.len();
        ToolResult::success_result(
            json!({"query": query, "results": results, "count": count}),
            Some(format!("Found {count} results for '{query}'")),
        )
    }
}

// ---------------------------------------------------------------------------
// web_fetch
// ---------------------------------------------------------------------------

/// Fetch a URL and extract readable text.
pub struct WebFetchHandler;

#[async_trait]
impl ToolHandler for WebFetchHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_fetch".to_owned(),
            description: "Fetch a URL and extract its readable text content. Disallows \
                          localhost and private addresses."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "URL to fetch (http/https)."}
                },
                "required": ["url"]
            }),
            category: ToolCategory::Web,
            energy_cost: 2,
            requires_approval: false,
            is_read_only: true,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    fn validate(&self, arguments: &serde_json::Value) -> Vec<String> {
        let mut errors = super::validate_against_schema(&self.spec().parameters, arguments);
        if let Some(url) = arguments.get("url").and_then(serde_json::Value::as_str) {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push("url must start with http:// or https://".to_owned());
            }
        }
        errors
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

        let url = arguments
            .get("url")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();

        let body = match fetch_with_ssrf_guard(url).await {
            Ok(body) => body,
            Err(result) => return result,
        };

        let text = truncate_body(&extract_text(&body), MAX_BODY_BYTES);
        let chars = text.chars().count();
        ToolResult::success_result(
            json!({"url": url, "content": text, "length": chars}),
            Some(format!("Fetched {chars} chars from {url}")),
        )
    }
}

// ---------------------------------------------------------------------------
// web_summarize
// ---------------------------------------------------------------------------

/// Fetch a URL and summarize its content with the heartbeat LLM binding.
pub struct WebSummarizeHandler {
    store: Store,
}

#[async_trait]
impl ToolHandler for WebSummarizeHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_summarize".to_owned(),
            description: "Fetch a URL and get an AI-generated summary of its content. Useful \
                          when you need the key points from a page without reading the full \
                          content."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "URL to fetch and summarize."},
                    "focus": {
                        "type": "string",
                        "description": "Optional focus area for the summary."
                    },
                    "max_length": {
                        "type": "string", "enum": ["brief", "standard", "detailed"],
                        "default": "standard", "description": "Desired summary length."
                    }
                },
                "required": ["url"]
            }),
            category: ToolCategory::Web,
            energy_cost: 4,
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

        let url = arguments
            .get("url")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let focus = arguments.get("focus").and_then(serde_json::Value::as_str);
        let max_length = arguments
            .get("max_length")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("standard");

        let body = match fetch_with_ssrf_guard(url).await {
            Ok(body) => body,
            Err(result) => return result,
        };
        let text = truncate_body(&extract_text(&body), MAX_BODY_BYTES);
        if text.is_empty() {
            return ToolResult::error_result(
                "Failed to extract content from URL",
                ToolErrorType::ExecutionFailed,
            );
        }

        let binding = match load_llm_binding(&self.store, "llm.heartbeat", None).await {
            Ok(binding) => binding,
            Err(e) => {
                return ToolResult::error_result(
                    format!("failed to load LLM binding: {e}"),
                    ToolErrorType::MissingConfig,
                )
            }
        };
        let provider = match resolve_provider(&binding) {
            Ok(provider) => provider,
            Err(e) => {
                return ToolResult::error_result(e.to_string(), ToolErrorType::MissingApiKey)
            }
        };

        let max_tokens = match max_length {
            "brief" => 300,
            "detailed" => 1200,
            _ => 600,
        };
        let focus_line = focus
            .map(|f| format!("Focus on: {f}\n"))
            .unwrap_or_default();
        let system = "Summarize the provided page content. Return STRICT JSON: \
                      { \"summary\": str, \"key_points\": [str] }";
        let user = format!("{focus_line}URL: {url}\n\nContent:\n{text}");

        let (doc, _raw) = chat_json(
            provider.as_ref(),
            vec![ChatMessage::system(system), ChatMessage::user(user)],
            max_tokens,
            &json!({"summary": "", "key_points": []}),
        )
        .await;

        let summary = doc
            .get("summary")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();
        ToolResult::success_result(
            json!({"url": url, "summary": summary, "key_points": doc.get("key_points")}),
            Some(format!("Summarized {url}")),
        )
    }
}

/// Create all web tool handlers.
pub fn create_web_tools(store: Store) -> Vec<std::sync::Arc<dyn ToolHandler>> {
    vec![
        std::sync::Arc::new(WebSearchHandler {
            store: store.clone(),
        }),
        std::sync::Arc::new(WebFetchHandler),
        std::sync::Arc::new(WebSummarizeHandler { store }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ssrf_blocks_localhost() {
        let url = Url::parse("http://localhost:8080/admin").expect("url");
        assert!(ssrf_check(&url).await.is_err());
    }

    #[tokio::test]
    async fn test_ssrf_blocks_loopback_ip() {
        let url = Url::parse("http://127.0.0.1/secret").expect("url");
        assert!(ssrf_check(&url).await.is_err());
    }

    #[tokio::test]
    async fn test_ssrf_blocks_private_ranges() {
        for target in ["http://10.0.0.5/", "http://192.168.1.1/", "http://169.254.169.254/"] {
            let url = Url::parse(target).expect("url");
            assert!(ssrf_check(&url).await.is_err(), "{target} should be blocked");
        }
    }

    #[tokio::test]
    async fn test_ssrf_blocks_non_http_schemes() {
        let url = Url::parse("ftp://example.com/file").expect("url");
        assert!(ssrf_check(&url).await.is_err());
    }

    #[test]
    fn test_extract_text_strips_markup() {
        let html = "<html><head><style>body{}</style><script>x()</script></head>\
                    <body><h1>Title</h1><p>Hello &amp; welcome</p></body></html>";
        let text = extract_text(html);
        assert_eq!(text, "Title Hello & welcome");
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let body = "é".repeat(100);
        let out = truncate_body(&body, 11);
        assert!(out.ends_with("...[truncated]"));
    }
}
