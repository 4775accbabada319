//! Streaming LLM client — tool-use decode, retry, and usage accounting.
//!
//! `LlmClient` wraps an `LlmEndpoint` (the raw streaming Messages API) and
//! the `ApiKeyPool`. One call to [`LlmClient::stream`] performs:
//!
//! 1. key selection (least-loaded) and a proactive budget wait using a
//!    `bytes / 4` token estimate,
//! 2. the streaming request with retry on {429, 500, 502, 503, 529} and
//!    timeouts — `retry-after` capped at 120 s, else exponential back-off
//!    `2^(attempt+1)` capped at 90 s, up to 6 retries,
//! 3. wire-event decoding into `StreamItem`s pushed through a channel:
//!    text deltas immediately, tool calls assembled across
//!    `content_block_start` → `input_json_delta` → `content_block_stop`,
//! 4. usage accumulation (`message_start` input + cache buckets,
//!    `message_delta` output) and post-stream recording of
//!    fresh+cache-read+cache-creation input into the chosen limiter.

pub mod sse;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::LlmError;
use crate::limiter::ApiKeyPool;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Max retries for transient failures.
const MAX_RETRIES: u32 = 6;
/// Exponential back-off base: 2, 4, 8, 16, 32, 64 seconds.
const BASE_BACKOFF: f64 = 2.0;
/// Ceiling for computed back-off.
const MAX_BACKOFF_SECS: f64 = 90.0;
/// Ceiling for a server-supplied retry-after.
const MAX_RETRY_AFTER_SECS: f64 = 120.0;

/// Connect / total-stream timeouts for the live endpoint.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Message model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Tagged content variants — the only shapes that ever enter message
/// history. Explicit wire conversion keeps serialisation bugs out of the
/// echo-back path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: &str) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        }
    }

    pub fn user_blocks(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant_blocks(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Approximate character weight for token estimation.
    fn char_weight(&self) -> usize {
        self.content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::ToolUse { input, .. } => input.to_string().len(),
                ContentBlock::ToolResult { content, .. } => content.len(),
                ContentBlock::Thinking { thinking, .. } => thinking.len(),
            })
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Stream request / items / usage
// ---------------------------------------------------------------------------

/// Everything one streaming call needs.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub model: String,
    /// System prompt blocks; the final block gets a cache-control marker.
    pub system_blocks: Vec<String>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    /// Tool definitions, already rendered to provider JSON. The last tool
    /// is cache-controlled so the whole list joins the cached prefix.
    pub tools: Vec<Value>,
    /// Extended-thinking budget in tokens (0 disables).
    pub thinking_budget: u32,
}

impl StreamRequest {
    pub fn new(model: &str, system: &str, messages: Vec<Message>, max_tokens: u32) -> Self {
        Self {
            model: model.to_string(),
            system_blocks: vec![system.to_string()],
            messages,
            max_tokens,
            tools: Vec::new(),
            thinking_budget: 0,
        }
    }

    /// Estimate input tokens at ~4 chars per token, covering the system
    /// prompt and every message block. The provider meters all of it.
    pub fn estimated_input_tokens(&self) -> u64 {
        let system: usize = self.system_blocks.iter().map(|b| b.len()).sum();
        let messages: usize = self.messages.iter().map(|m| m.char_weight()).sum();
        ((system + messages) / 4) as u64
    }

    /// Render the full provider request payload.
    pub fn to_payload(&self) -> Value {
        let system: Vec<Value> = self
            .system_blocks
            .iter()
            .enumerate()
            .map(|(idx, text)| {
                let mut block = json!({"type": "text", "text": text});
                if idx + 1 == self.system_blocks.len() {
                    block["cache_control"] = json!({"type": "ephemeral"});
                }
                block
            })
            .collect();

        let mut payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": self.messages,
            "stream": true,
        });
        if !self.tools.is_empty() {
            let mut tools = self.tools.clone();
            if let Some(last) = tools.last_mut() {
                last["cache_control"] = json!({"type": "ephemeral"});
            }
            payload["tools"] = Value::Array(tools);
        }
        if self.thinking_budget > 0 {
            payload["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": self.thinking_budget,
            });
        }
        payload
    }
}

/// A tool_use block assembled from the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// One item of the lazy stream the consumer pattern-matches on.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Text(String),
    Tool(ToolCall),
    Thinking(String),
}

/// Accumulated token usage across one or more streaming calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub model: String,
}

impl StreamUsage {
    /// All input buckets — what the provider meters against TPM and what
    /// the ledger prices.
    pub fn total_input(&self) -> u64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }
}

/// Callback fired before each retry sleep:
/// `(status, attempt, wait_secs)`. Status 0 means budget pacing or a
/// timeout rather than a real HTTP code.
pub type RetryCallback = dyn Fn(u16, u32, f64) + Send + Sync;

// ---------------------------------------------------------------------------
// Endpoint trait + live binding
// ---------------------------------------------------------------------------

/// Raw wire events, one JSON value per SSE frame.
pub type EventStream = BoxStream<'static, Result<Value, LlmError>>;

/// One streaming Messages call. The live binding speaks HTTPS; tests use
/// a scripted endpoint.
#[async_trait]
pub trait LlmEndpoint: Send + Sync {
    async fn open_stream(&self, api_key: &str, payload: Value) -> Result<EventStream, LlmError>;
}

/// HTTPS binding to the streaming Messages API.
pub struct HttpLlmEndpoint {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLlmEndpoint {
    pub fn new() -> Self {
        Self::with_base_url(MESSAGES_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(STREAM_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.to_string(),
        }
    }
}

impl Default for HttpLlmEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmEndpoint for HttpLlmEndpoint {
    async fn open_stream(&self, api_key: &str, payload: Value) -> Result<EventStream, LlmError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                retry_after,
                body,
            });
        }

        let frames = sse::frame_stream(response.bytes_stream());
        let events = frames.map(|frame| {
            frame.and_then(|f| {
                serde_json::from_str::<Value>(&f.data).map_err(|e| LlmError::Decode(e.to_string()))
            })
        });
        Ok(Box::pin(events))
    }
}

/// Scripted endpoint replaying canned wire events — the test double used
/// by the scenario suite and `--dry-run` style invocations. Each call
/// pops the next script; the last script repeats once exhausted.
pub struct ScriptedEndpoint {
    scripts: std::sync::Mutex<Vec<Vec<Value>>>,
    pub calls: std::sync::atomic::AtomicU64,
}

impl ScriptedEndpoint {
    pub fn new(scripts: Vec<Vec<Value>>) -> Self {
        Self {
            scripts: std::sync::Mutex::new(scripts),
            calls: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Convenience: wire events for a plain text reply with usage.
    pub fn text_reply(model: &str, text: &str, input_tokens: u64, output_tokens: u64) -> Vec<Value> {
        vec![
            json!({"type": "message_start", "message": {"model": model, "usage": {
                "input_tokens": input_tokens,
                "cache_read_input_tokens": 0,
                "cache_creation_input_tokens": 0,
            }}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "usage": {"output_tokens": output_tokens}, "delta": {"stop_reason": "end_turn"}}),
            json!({"type": "message_stop"}),
        ]
    }

    /// Convenience: wire events for a single tool call.
    pub fn tool_reply(model: &str, id: &str, name: &str, input: &Value) -> Vec<Value> {
        vec![
            json!({"type": "message_start", "message": {"model": model, "usage": {
                "input_tokens": 100,
                "cache_read_input_tokens": 0,
                "cache_creation_input_tokens": 0,
            }}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {
                "type": "tool_use", "id": id, "name": name,
            }}),
            json!({"type": "content_block_delta", "index": 0, "delta": {
                "type": "input_json_delta", "partial_json": input.to_string(),
            }}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "usage": {"output_tokens": 50}, "delta": {"stop_reason": "tool_use"}}),
            json!({"type": "message_stop"}),
        ]
    }
}

#[async_trait]
impl LlmEndpoint for ScriptedEndpoint {
    async fn open_stream(&self, _api_key: &str, _payload: Value) -> Result<EventStream, LlmError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let events = {
            let mut scripts = self.scripts.lock().expect("script lock");
            if scripts.len() > 1 {
                scripts.remove(0)
            } else if let Some(last) = scripts.first() {
                last.clone()
            } else {
                return Err(LlmError::EmptyResponse);
            }
        };
        let stream = futures::stream::iter(events.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Streaming client bound to an endpoint and the key pool.
pub struct LlmClient {
    endpoint: Arc<dyn LlmEndpoint>,
    pool: Arc<ApiKeyPool>,
}

/// Compute the pre-retry wait: server `retry-after` (capped) when present,
/// else exponential back-off.
fn retry_wait(retry_after: Option<u64>, attempt: u32) -> f64 {
    if let Some(secs) = retry_after {
        return (secs as f64).min(MAX_RETRY_AFTER_SECS);
    }
    BASE_BACKOFF.powi(attempt as i32 + 1).min(MAX_BACKOFF_SECS)
}

/// State for one in-flight tool_use block.
#[derive(Default)]
struct ToolAccumulator {
    id: String,
    name: String,
    json: String,
    active: bool,
}

impl LlmClient {
    pub fn new(endpoint: Arc<dyn LlmEndpoint>, pool: Arc<ApiKeyPool>) -> Self {
        Self { endpoint, pool }
    }

    pub fn pool(&self) -> &Arc<ApiKeyPool> {
        &self.pool
    }

    /// Run one streaming call, pushing items through `tx`. Returns the
    /// usage for this call. Retries transparently; items already emitted
    /// before a retry stay emitted (the consumer sees the retried text
    /// again — same behaviour as the tool-use round restarting).
    pub async fn stream(
        &self,
        request: StreamRequest,
        tx: mpsc::Sender<StreamItem>,
        on_retry: Option<Arc<RetryCallback>>,
        cancel: Option<CancellationToken>,
    ) -> Result<StreamUsage, LlmError> {
        let (api_key, limiter) = self.pool.best_key().await;
        tracing::debug!(keys = self.pool.key_count(), "key pool: selected key");

        // Proactive budget wait. With empty history this returns at once.
        let estimate = request.estimated_input_tokens();
        let pacing_retry = on_retry.clone();
        let pacing = move |wait: f64, inp_used: u64, inp_lim: u64, out_used: u64, out_lim: u64| {
            if let Some(cb) = &pacing_retry {
                cb(0, 0, wait);
            }
            tracing::info!(
                wait,
                inp_used,
                inp_lim,
                out_used,
                out_lim,
                "budget pacing before call"
            );
        };
        limiter
            .wait_for_budget(estimate, Some(&pacing), cancel.as_ref())
            .await?;

        let payload = request.to_payload();
        let mut usage = StreamUsage::default();
        let mut last_err: Option<LlmError> = None;

        for attempt in 0..=MAX_RETRIES {
            if let Some(token) = &cancel
                && token.is_cancelled()
            {
                return Err(LlmError::Cancelled);
            }

            let stream = match self.endpoint.open_stream(&api_key, payload.clone()).await {
                Ok(s) => s,
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                    let retry_after = match &err {
                        LlmError::Http { retry_after, .. } => *retry_after,
                        _ => None,
                    };
                    let status = match &err {
                        LlmError::Http { status, .. } => *status,
                        _ => 0,
                    };
                    let wait = retry_wait(retry_after, attempt);
                    tracing::warn!(
                        status,
                        attempt = attempt + 1,
                        wait,
                        "stream error, retrying"
                    );
                    if let Some(cb) = &on_retry {
                        cb(status, attempt + 1, wait);
                    }
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match self
                .decode_stream(stream, &request.model, &tx, &mut usage, cancel.as_ref())
                .await
            {
                Ok((call_input, call_output)) => {
                    limiter.record(call_input, call_output).await;
                    return Ok(usage);
                }
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                    let wait = retry_wait(None, attempt);
                    tracing::warn!(attempt = attempt + 1, wait, "mid-stream error, retrying");
                    if let Some(cb) = &on_retry {
                        cb(0, attempt + 1, wait);
                    }
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: MAX_RETRIES + 1,
            last: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Decode one attempt's wire events. Returns the (input, output)
    /// token counts to record with the limiter.
    async fn decode_stream(
        &self,
        mut stream: EventStream,
        fallback_model: &str,
        tx: &mpsc::Sender<StreamItem>,
        usage: &mut StreamUsage,
        cancel: Option<&CancellationToken>,
    ) -> Result<(u64, u64), LlmError> {
        let mut call_input: u64 = 0;
        let mut call_output: u64 = 0;
        let mut tool = ToolAccumulator::default();
        let mut thinking = String::new();
        let mut in_thinking = false;

        while let Some(event) = stream.next().await {
            if let Some(token) = cancel
                && token.is_cancelled()
            {
                return Err(LlmError::Cancelled);
            }
            let event = event?;
            let etype = event.get("type").and_then(|t| t.as_str()).unwrap_or("");

            match etype {
                "message_start" => {
                    let u = &event["message"]["usage"];
                    let input = u["input_tokens"].as_u64().unwrap_or(0);
                    let cache_read = u["cache_read_input_tokens"].as_u64().unwrap_or(0);
                    let cache_create = u["cache_creation_input_tokens"].as_u64().unwrap_or(0);
                    usage.input_tokens += input;
                    usage.cache_read_input_tokens += cache_read;
                    usage.cache_creation_input_tokens += cache_create;
                    usage.model = event["message"]["model"]
                        .as_str()
                        .unwrap_or(fallback_model)
                        .to_string();
                    // TPM accounting counts every input bucket.
                    call_input += input + cache_read + cache_create;
                }
                "message_delta" => {
                    let output = event["usage"]["output_tokens"].as_u64().unwrap_or(0);
                    usage.output_tokens += output;
                    call_output += output;
                }
                "content_block_start" => {
                    let block = &event["content_block"];
                    match block["type"].as_str().unwrap_or("") {
                        "tool_use" => {
                            tool = ToolAccumulator {
                                id: block["id"].as_str().unwrap_or("").to_string(),
                                name: block["name"].as_str().unwrap_or("").to_string(),
                                json: String::new(),
                                active: true,
                            };
                        }
                        "thinking" => {
                            in_thinking = true;
                            thinking.clear();
                        }
                        _ => {}
                    }
                }
                "content_block_delta" => {
                    let delta = &event["delta"];
                    if tool.active {
                        if let Some(chunk) = delta["partial_json"].as_str() {
                            tool.json.push_str(chunk);
                        }
                    } else if in_thinking {
                        if let Some(chunk) = delta["thinking"].as_str() {
                            thinking.push_str(chunk);
                        }
                    } else if let Some(text) = delta["text"].as_str()
                        && !text.is_empty()
                    {
                        let _ = tx.send(StreamItem::Text(text.to_string())).await;
                    }
                }
                "content_block_stop" => {
                    if tool.active {
                        tool.active = false;
                        let input = if tool.json.is_empty() {
                            json!({})
                        } else {
                            serde_json::from_str(&tool.json)
                                .unwrap_or_else(|_| json!({"_raw": tool.json}))
                        };
                        let _ = tx
                            .send(StreamItem::Tool(ToolCall {
                                id: std::mem::take(&mut tool.id),
                                name: std::mem::take(&mut tool.name),
                                input,
                            }))
                            .await;
                        tool.json.clear();
                    } else if in_thinking {
                        in_thinking = false;
                        if !thinking.is_empty() {
                            let _ = tx.send(StreamItem::Thinking(std::mem::take(&mut thinking))).await;
                        }
                    }
                }
                // message_stop, ping, and unknown events need no handling.
                _ => {}
            }
        }

        Ok((call_input, call_output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_client(scripts: Vec<Vec<Value>>) -> LlmClient {
        let endpoint = Arc::new(ScriptedEndpoint::new(scripts));
        let pool = Arc::new(ApiKeyPool::new(&["test-key".into()], 80_000, 16_000).unwrap());
        LlmClient::new(endpoint, pool)
    }

    async fn collect(
        client: &LlmClient,
        request: StreamRequest,
    ) -> (Vec<StreamItem>, StreamUsage) {
        let (tx, mut rx) = mpsc::channel(64);
        let usage = client.stream(request, tx, None, None).await.unwrap();
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        (items, usage)
    }

    #[test]
    fn test_retry_wait_prefers_header() {
        assert_eq!(retry_wait(Some(10), 0), 10.0);
        assert_eq!(retry_wait(Some(999), 0), 120.0);
        assert_eq!(retry_wait(None, 0), 2.0);
        assert_eq!(retry_wait(None, 2), 8.0);
        assert_eq!(retry_wait(None, 10), 90.0);
    }

    #[test]
    fn test_payload_cache_controls_final_system_block_and_last_tool() {
        let mut request = StreamRequest::new(
            "claude-opus-4-20250514",
            "base prompt",
            vec![Message::user_text("hi")],
            1024,
        );
        request.system_blocks.push("contracts".into());
        request.tools = vec![
            json!({"name": "read_file", "input_schema": {}}),
            json!({"name": "write_file", "input_schema": {}}),
        ];

        let payload = request.to_payload();
        let system = payload["system"].as_array().unwrap();
        assert!(system[0].get("cache_control").is_none());
        assert_eq!(system[1]["cache_control"]["type"], "ephemeral");
        let tools = payload["tools"].as_array().unwrap();
        assert!(tools[0].get("cache_control").is_none());
        assert_eq!(tools[1]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn test_estimate_covers_system_and_messages() {
        let request = StreamRequest::new(
            "m",
            &"s".repeat(400),
            vec![Message::user_text(&"u".repeat(400))],
            1024,
        );
        assert_eq!(request.estimated_input_tokens(), 200);
    }

    #[tokio::test]
    async fn test_stream_yields_text_and_usage() {
        let client = make_client(vec![ScriptedEndpoint::text_reply(
            "claude-opus-4-20250514",
            "hello world",
            120,
            35,
        )]);
        let request = StreamRequest::new(
            "claude-opus-4-20250514",
            "sys",
            vec![Message::user_text("hi")],
            1024,
        );
        let (items, usage) = collect(&client, request).await;

        assert_eq!(items, vec![StreamItem::Text("hello world".into())]);
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 35);
        assert_eq!(usage.model, "claude-opus-4-20250514");
    }

    #[tokio::test]
    async fn test_stream_assembles_tool_call_from_deltas() {
        let events = vec![
            json!({"type": "message_start", "message": {"model": "m", "usage": {"input_tokens": 10}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {
                "type": "tool_use", "id": "tu_1", "name": "read_file",
            }}),
            json!({"type": "content_block_delta", "index": 0, "delta": {
                "type": "input_json_delta", "partial_json": "{\"path\": ",
            }}),
            json!({"type": "content_block_delta", "index": 0, "delta": {
                "type": "input_json_delta", "partial_json": "\"src/a.py\"}",
            }}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_stop"}),
        ];
        let client = make_client(vec![events]);
        let request = StreamRequest::new("m", "sys", vec![Message::user_text("go")], 1024);
        let (items, _) = collect(&client, request).await;

        assert_eq!(items.len(), 1);
        match &items[0] {
            StreamItem::Tool(call) => {
                assert_eq!(call.id, "tu_1");
                assert_eq!(call.name, "read_file");
                assert_eq!(call.input["path"], "src/a.py");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_tool_json_preserved_as_raw() {
        let events = vec![
            json!({"type": "content_block_start", "index": 0, "content_block": {
                "type": "tool_use", "id": "tu_1", "name": "x",
            }}),
            json!({"type": "content_block_delta", "index": 0, "delta": {
                "type": "input_json_delta", "partial_json": "{not json",
            }}),
            json!({"type": "content_block_stop", "index": 0}),
        ];
        let client = make_client(vec![events]);
        let request = StreamRequest::new("m", "sys", vec![Message::user_text("go")], 1024);
        let (items, _) = collect(&client, request).await;

        match &items[0] {
            StreamItem::Tool(call) => assert_eq!(call.input["_raw"], "{not json"),
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_usage_records_into_limiter_with_cache_buckets() {
        let events = vec![
            json!({"type": "message_start", "message": {"model": "m", "usage": {
                "input_tokens": 100,
                "cache_read_input_tokens": 400,
                "cache_creation_input_tokens": 50,
            }}}),
            json!({"type": "message_delta", "usage": {"output_tokens": 30}}),
            json!({"type": "message_stop"}),
        ];
        let client = make_client(vec![events]);
        let request = StreamRequest::new("m", "sys", vec![Message::user_text("go")], 1024);
        let (_, usage) = collect(&client, request).await;

        assert_eq!(usage.total_input(), 550);
        // All buckets landed in the limiter window.
        let (input, output) = client.pool().aggregate_usage().await;
        assert_eq!(input, 550);
        assert_eq!(output, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_then_success() {
        struct FlakyEndpoint {
            inner: ScriptedEndpoint,
            failures_left: std::sync::atomic::AtomicU32,
        }

        #[async_trait]
        impl LlmEndpoint for FlakyEndpoint {
            async fn open_stream(
                &self,
                api_key: &str,
                payload: Value,
            ) -> Result<EventStream, LlmError> {
                if self
                    .failures_left
                    .fetch_update(
                        std::sync::atomic::Ordering::SeqCst,
                        std::sync::atomic::Ordering::SeqCst,
                        |n| n.checked_sub(1),
                    )
                    .is_ok()
                {
                    return Err(LlmError::Http {
                        status: 529,
                        retry_after: Some(1),
                        body: "overloaded".into(),
                    });
                }
                self.inner.open_stream(api_key, payload).await
            }
        }

        let endpoint = Arc::new(FlakyEndpoint {
            inner: ScriptedEndpoint::new(vec![ScriptedEndpoint::text_reply("m", "ok", 10, 5)]),
            failures_left: std::sync::atomic::AtomicU32::new(2),
        });
        let pool = Arc::new(ApiKeyPool::new(&["k".into()], 80_000, 16_000).unwrap());
        let client = LlmClient::new(endpoint, pool);

        let retries = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let retries_cb = Arc::clone(&retries);
        let on_retry: Arc<RetryCallback> = Arc::new(move |status, _attempt, _wait| {
            if status == 529 {
                retries_cb.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        let (tx, mut rx) = mpsc::channel(8);
        let request = StreamRequest::new("m", "sys", vec![Message::user_text("go")], 256);
        let usage = client
            .stream(request, tx, Some(on_retry), None)
            .await
            .unwrap();

        assert_eq!(retries.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(usage.output_tokens, 5);
        assert_eq!(rx.try_recv().unwrap(), StreamItem::Text("ok".into()));
    }

    #[tokio::test]
    async fn test_non_retryable_error_surfaces_immediately() {
        struct AuthFailEndpoint;

        #[async_trait]
        impl LlmEndpoint for AuthFailEndpoint {
            async fn open_stream(&self, _: &str, _: Value) -> Result<EventStream, LlmError> {
                Err(LlmError::Http {
                    status: 401,
                    retry_after: None,
                    body: "bad key".into(),
                })
            }
        }

        let pool = Arc::new(ApiKeyPool::new(&["k".into()], 80_000, 16_000).unwrap());
        let client = LlmClient::new(Arc::new(AuthFailEndpoint), pool);
        let (tx, _rx) = mpsc::channel(8);
        let request = StreamRequest::new("m", "sys", vec![Message::user_text("go")], 256);
        let err = client.stream(request, tx, None, None).await.unwrap_err();
        assert!(matches!(err, LlmError::Http { status: 401, .. }));
    }
}
