//! Uniform gateway over the LLM providers.
//!
//! Exposes one trait, [`LlmGateway`], with a non-streaming and a streaming
//! chat call.  The streaming call forwards [`StreamFragment`]s (reasoning
//! text and answer text separately) over an mpsc channel as they arrive and
//! returns the materialized [`ChatResponse`], including any tool calls,
//! once the stream ends.
//!
//! Two HTTP shapes are supported: the Anthropic messages API (SSE with
//! `thinking_delta` / `text_delta` / `input_json_delta` content blocks) and
//! OpenAI-compatible `chat/completions` (`delta.content`, incremental
//! `tool_calls`).  [`LlmRouter`] picks the client from the model catalog.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use maestro_config::{AppConfig, LlmConfig, ModelEntry};

// ── Chat message types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { role: ChatRole::Assistant, content: None, tool_calls, tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: ChatRole::Tool, content: Some(content.into()), tool_calls: vec![], tool_call_id: Some(tool_call_id.into()) }
    }
}

/// A tool call requested by the model.  Arguments are normalized to a parsed
/// JSON value regardless of how the provider delivered them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// One fragment of a streaming response, split by channel so the caller can
/// route reasoning and answer text to different events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFragment {
    Thinking(String),
    Text(String),
}

/// A chat invocation.  `model` is a catalog *name*, resolved by the router.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// OpenAI-shaped tools array; `None` disables tool calling.
    pub tools: Option<serde_json::Value>,
    /// Extended-reasoning token budget; ignored by models without support.
    pub reasoning_budget: Option<u32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages, ..Default::default() }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: serde_json::Value) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_reasoning(mut self, budget_tokens: u32) -> Self {
        self.reasoning_budget = Some(budget_tokens);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub thinking: String,
    pub tool_calls: Vec<ToolCall>,
    /// "stop", "tool_calls", "length", ...
    pub finish_reason: String,
}

// ── Gateway trait ────────────────────────────────────────────────────────────

/// The seam every orchestrator talks through.  Tests substitute a scripted
/// implementation; production uses [`LlmRouter`].
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Stream fragments into `tx` as they arrive; the returned response holds
    /// the accumulated text plus any tool calls.  Send failures (receiver
    /// dropped) are not errors; the stream keeps accumulating.
    async fn chat_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamFragment>,
    ) -> Result<ChatResponse>;
}

// ── Router ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LlmRouter {
    config: LlmConfig,
    anthropic: AnthropicClient,
    openai: OpenAiCompatClient,
}

impl LlmRouter {
    pub fn new(config: LlmConfig) -> Self {
        let anthropic = AnthropicClient::new(config.anthropic_base_url.clone());
        let openai = OpenAiCompatClient::new(config.openai_base_url.clone());
        Self { config, anthropic, openai }
    }

    fn resolve(&self, name: Option<&str>) -> Result<&ModelEntry> {
        let wanted = name.unwrap_or(&self.config.default_model);
        self.config
            .models
            .iter()
            .find(|m| m.name == wanted)
            .with_context(|| format!("model '{wanted}' not in catalog"))
    }

    /// Catalog name of the configured cheap model.
    pub fn fast_model(&self) -> &str {
        &self.config.fast_model
    }

    /// Whether the resolved model supports an extended-reasoning budget.
    pub fn supports_reasoning(&self, name: Option<&str>) -> bool {
        self.resolve(name).map(|m| m.supports_reasoning).unwrap_or(false)
    }
}

#[async_trait]
impl LlmGateway for LlmRouter {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let entry = self.resolve(request.model.as_deref())?.clone();
        match entry.provider.as_str() {
            "anthropic" => self.anthropic.chat(&entry, &request, None).await,
            "openai" => self.openai.chat(&entry, &request, None).await,
            other => bail!("unknown provider '{other}' for model '{}'", entry.name),
        }
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamFragment>,
    ) -> Result<ChatResponse> {
        let entry = self.resolve(request.model.as_deref())?.clone();
        match entry.provider.as_str() {
            "anthropic" => self.anthropic.chat(&entry, &request, Some(tx)).await,
            "openai" => self.openai.chat(&entry, &request, Some(tx)).await,
            other => bail!("unknown provider '{other}' for model '{}'", entry.name),
        }
    }
}

// ── Anthropic messages API ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(base_url: String) -> Self {
        Self { client: reqwest::Client::new(), base_url }
    }

    async fn chat(
        &self,
        entry: &ModelEntry,
        request: &ChatRequest,
        tx: Option<mpsc::Sender<StreamFragment>>,
    ) -> Result<ChatResponse> {
        let api_key = AppConfig::api_key_for("anthropic")
            .context("ANTHROPIC_API_KEY is not set")?;
        let endpoint = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));

        // The messages API takes the system prompt out-of-band.
        let mut system_text = String::new();
        let mut messages: Vec<serde_json::Value> = Vec::new();
        for m in &request.messages {
            match m.role {
                ChatRole::System => {
                    if !system_text.is_empty() {
                        system_text.push('\n');
                    }
                    system_text.push_str(m.content.as_deref().unwrap_or(""));
                }
                ChatRole::User => {
                    messages.push(json!({"role": "user", "content": m.content.as_deref().unwrap_or("")}));
                }
                ChatRole::Assistant => {
                    if m.tool_calls.is_empty() {
                        messages.push(json!({"role": "assistant", "content": m.content.as_deref().unwrap_or("")}));
                    } else {
                        let blocks: Vec<serde_json::Value> = m
                            .tool_calls
                            .iter()
                            .map(|tc| json!({"type": "tool_use", "id": tc.id, "name": tc.name, "input": tc.arguments}))
                            .collect();
                        messages.push(json!({"role": "assistant", "content": blocks}));
                    }
                }
                ChatRole::Tool => {
                    messages.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": m.tool_call_id.as_deref().unwrap_or(""),
                            "content": m.content.as_deref().unwrap_or("")
                        }]
                    }));
                }
            }
        }

        let mut payload = json!({
            "model": entry.model_id,
            "max_tokens": request.max_tokens.unwrap_or(4096),
            "messages": messages,
            "stream": tx.is_some(),
        });
        if !system_text.is_empty() {
            payload["system"] = json!(system_text);
        }
        if let Some(budget) = request.reasoning_budget {
            if entry.supports_reasoning {
                payload["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
                payload["temperature"] = json!(1);
            }
        }
        if let Some(ref tools) = request.tools {
            payload["tools"] = openai_tools_to_anthropic(tools);
        }

        let response = self
            .client
            .post(&endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await
            .context("anthropic request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("anthropic error ({status}): {body}");
        }

        match tx {
            Some(tx) => self.read_sse(response, tx).await,
            None => {
                let body: serde_json::Value = response.json().await?;
                Ok(parse_anthropic_body(&body))
            }
        }
    }

    /// Parse the SSE stream line by line.  Fragment decode errors are logged
    /// and skipped so one bad frame never kills the stream.
    async fn read_sse(
        &self,
        mut response: reqwest::Response,
        tx: mpsc::Sender<StreamFragment>,
    ) -> Result<ChatResponse> {
        let mut out = ChatResponse { finish_reason: "stop".to_string(), ..Default::default() };
        // index → (id, name, partial json)
        let mut tool_blocks: HashMap<usize, (String, String, String)> = HashMap::new();
        let mut buffer = String::new();

        while let Some(chunk) = response.chunk().await? {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                    debug!("skipping undecodable stream frame");
                    continue;
                };
                match event.get("type").and_then(|t| t.as_str()) {
                    Some("content_block_start") => {
                        let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                        if let Some(block) = event.get("content_block") {
                            if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                                let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                                let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                                tool_blocks.insert(index, (id, name, String::new()));
                            }
                        }
                    }
                    Some("content_block_delta") => {
                        let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                        let Some(delta) = event.get("delta") else { continue };
                        match delta.get("type").and_then(|t| t.as_str()) {
                            Some("thinking_delta") => {
                                if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                                    out.thinking.push_str(text);
                                    let _ = tx.send(StreamFragment::Thinking(text.to_string())).await;
                                }
                            }
                            Some("text_delta") => {
                                if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                                    out.content.push_str(text);
                                    let _ = tx.send(StreamFragment::Text(text.to_string())).await;
                                }
                            }
                            Some("input_json_delta") => {
                                if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                                    if let Some(entry) = tool_blocks.get_mut(&index) {
                                        entry.2.push_str(partial);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                    Some("message_delta") => {
                        if let Some(reason) = event
                            .get("delta")
                            .and_then(|d| d.get("stop_reason"))
                            .and_then(|v| v.as_str())
                        {
                            out.finish_reason = match reason {
                                "tool_use" => "tool_calls".to_string(),
                                other => other.to_string(),
                            };
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut indices: Vec<usize> = tool_blocks.keys().copied().collect();
        indices.sort();
        for index in indices {
            let (id, name, args) = &tool_blocks[&index];
            let arguments = serde_json::from_str(args).unwrap_or(json!({}));
            out.tool_calls.push(ToolCall {
                id: if id.is_empty() { format!("call_{index}") } else { id.clone() },
                name: name.clone(),
                arguments,
            });
        }
        if !out.tool_calls.is_empty() && out.finish_reason == "stop" {
            out.finish_reason = "tool_calls".to_string();
        }
        Ok(out)
    }
}

fn parse_anthropic_body(body: &serde_json::Value) -> ChatResponse {
    let mut out = ChatResponse::default();
    out.finish_reason = body
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .map(|r| if r == "tool_use" { "tool_calls" } else { r })
        .unwrap_or("stop")
        .to_string();
    if let Some(blocks) = body.get("content").and_then(|v| v.as_array()) {
        for (i, block) in blocks.iter().enumerate() {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("thinking") => {
                    out.thinking.push_str(block.get("thinking").and_then(|v| v.as_str()).unwrap_or(""));
                }
                Some("text") => {
                    out.content.push_str(block.get("text").and_then(|v| v.as_str()).unwrap_or(""));
                }
                Some("tool_use") => {
                    out.tool_calls.push(ToolCall {
                        id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(ToString::to_string)
                            .unwrap_or_else(|| format!("call_{i}")),
                        name: block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        arguments: block.get("input").cloned().unwrap_or(json!({})),
                    });
                }
                _ => {}
            }
        }
    }
    out
}

/// Convert the OpenAI-shaped tools array into Anthropic's `tools` parameter.
fn openai_tools_to_anthropic(tools: &serde_json::Value) -> serde_json::Value {
    let Some(items) = tools.as_array() else { return json!([]) };
    let converted: Vec<serde_json::Value> = items
        .iter()
        .filter_map(|t| {
            let func = t.get("function")?;
            Some(json!({
                "name": func.get("name")?,
                "description": func.get("description").cloned().unwrap_or(json!("")),
                "input_schema": func.get("parameters").cloned().unwrap_or(json!({"type": "object"})),
            }))
        })
        .collect();
    json!(converted)
}

// ── OpenAI-compatible chat/completions ───────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiCompatClient {
    pub fn new(base_url: String) -> Self {
        Self { client: reqwest::Client::new(), base_url }
    }

    async fn chat(
        &self,
        entry: &ModelEntry,
        request: &ChatRequest,
        tx: Option<mpsc::Sender<StreamFragment>>,
    ) -> Result<ChatResponse> {
        let api_key = AppConfig::api_key_for("openai").context("OPENAI_API_KEY is not set")?;
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut payload = json!({
            "model": entry.model_id,
            "messages": messages_to_openai(&request.messages),
            "stream": tx.is_some(),
        });
        if let Some(ref tools) = request.tools {
            payload["tools"] = tools.clone();
        }
        if let Some(max) = request.max_tokens {
            payload["max_tokens"] = json!(max);
        }

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .context("openai request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("openai error ({status}): {body}");
        }

        match tx {
            Some(tx) => self.read_sse(response, tx).await,
            None => {
                let body: serde_json::Value = response.json().await?;
                parse_openai_body(&body)
            }
        }
    }

    async fn read_sse(
        &self,
        mut response: reqwest::Response,
        tx: mpsc::Sender<StreamFragment>,
    ) -> Result<ChatResponse> {
        let mut out = ChatResponse { finish_reason: "stop".to_string(), ..Default::default() };
        // index → (id, name, arguments)
        let mut tool_call_map: HashMap<usize, (String, String, String)> = HashMap::new();
        let mut buffer = String::new();

        while let Some(chunk) = response.chunk().await? {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                    debug!("skipping undecodable stream frame");
                    continue;
                };
                let Some(choice) = event.get("choices").and_then(|c| c.get(0)) else { continue };

                if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                    out.finish_reason = reason.to_string();
                }
                let Some(delta) = choice.get("delta") else { continue };

                if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                    if !content.is_empty() {
                        out.content.push_str(content);
                        let _ = tx.send(StreamFragment::Text(content.to_string())).await;
                    }
                }

                if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                    for tc in calls {
                        let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                        let entry = tool_call_map
                            .entry(index)
                            .or_insert_with(|| (String::new(), String::new(), String::new()));
                        if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                            entry.0 = id.to_string();
                        }
                        if let Some(func) = tc.get("function") {
                            if let Some(name) = func.get("name").and_then(|v| v.as_str()) {
                                // Name arrives whole in the first delta, not
                                // incrementally, so assign rather than append.
                                entry.1 = name.to_string();
                            }
                            if let Some(args) = func.get("arguments").and_then(|v| v.as_str()) {
                                entry.2.push_str(args);
                            }
                        }
                    }
                }
            }
        }

        let mut indices: Vec<usize> = tool_call_map.keys().copied().collect();
        indices.sort();
        for index in indices {
            let (id, name, args) = &tool_call_map[&index];
            let arguments = serde_json::from_str(args).unwrap_or(json!({}));
            out.tool_calls.push(ToolCall {
                id: if id.is_empty() { format!("call_{index}") } else { id.clone() },
                name: name.clone(),
                arguments,
            });
        }
        if !out.tool_calls.is_empty() && out.finish_reason == "stop" {
            out.finish_reason = "tool_calls".to_string();
        }
        Ok(out)
    }
}

fn messages_to_openai(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            };
            let mut msg = json!({ "role": role, "content": m.content.clone() });
            if !m.tool_calls.is_empty() {
                let calls: Vec<serde_json::Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(calls);
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

fn parse_openai_body(body: &serde_json::Value) -> Result<ChatResponse> {
    let choice = body.get("choices").and_then(|c| c.get(0));
    let message = choice.and_then(|c| c.get("message"));

    let content = message
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();

    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, tc)| {
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let arguments = func
                        .get("arguments")
                        .map(|v| {
                            if let Some(s) = v.as_str() {
                                serde_json::from_str(s).unwrap_or(json!({}))
                            } else {
                                v.clone()
                            }
                        })
                        .unwrap_or(json!({}));
                    let id = tc.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    Some(ToolCall {
                        id: if id.is_empty() { format!("call_{i}") } else { id },
                        name,
                        arguments,
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(ChatResponse { content, thinking: String::new(), tool_calls, finish_reason })
}

// ── Tolerant JSON extraction ─────────────────────────────────────────────────

/// Extract a typed JSON value from an LLM reply that may wrap it in prose or
/// a fenced code block.
///
/// Strategy 1 takes the first ```json fence; strategy 2 spans the first `{`
/// to the last `}`.  Returns `None` when neither parses.
pub fn extract_json<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    let trimmed = response.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                let candidate = &trimmed[start..=end];
                if let Ok(val) = serde_json::from_str(candidate) {
                    return Some(val);
                }
            }
        }
    }

    None
}

/// Relabel prior assistant turns as tagged user messages.  Providers reject
/// reasoning-mode requests whose history contains bare assistant turns from a
/// non-reasoning context, so the orchestrators call this whenever extended
/// reasoning is active for the current request.
pub fn relabel_history_for_reasoning(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| {
            if m.role == ChatRole::Assistant && m.tool_calls.is_empty() {
                ChatMessage::user(format!(
                    "[previous assistant reply]:\n{}",
                    m.content.as_deref().unwrap_or("")
                ))
            } else {
                m.clone()
            }
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────
