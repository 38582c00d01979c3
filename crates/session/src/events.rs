use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One choice offered by a mid-step user-assistance request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistanceOption {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Every event a session can stream to its client.  Serialized adjacently
/// tagged so the wire shape is `{"type": ..., "data": {...}}`; [`Envelope`]
/// adds the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Message { role: String, content: String },
    MessageStart { role: String, message_id: String, content: String },
    MessageChunk { role: String, message_id: String, chunk: String, content: String },
    MessageComplete { role: String, message_id: String, content: String },
    ThinkingChunk { content: String },
    ResponseChunk { content: String },
    PlanGenerated { plan: String, steps: Vec<String>, confirmation_id: String },
    PlanThinkingChunk { content: String },
    PlanThinkingComplete {},
    PlanUpdated { plan: String, steps: Vec<String>, confirmation_id: String },
    AwaitingConfirmation {},
    StepStart { step: usize, title: String },
    StepComplete { step: usize },
    ToolCall {
        tool_name: String,
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    ToolResult { tool_name: String, result: String },
    UserAssistanceRequest {
        assistance_id: String,
        question: String,
        options: Vec<AssistanceOption>,
        context: Value,
    },
    FinalResultStart {},
    FinalResultChunk { content: String },
    FinalResultComplete { content: String },
    WorkflowComplete {},
    WorkflowStopped { reason: String, step: usize, remaining_steps: usize },
    WorkflowPaused { reason: String, step: usize, remaining_steps: usize },
    Error { message: String },
    ReactStart { goal: String },
    ReactThinking { thought: String, iteration: u32 },
    ReactAction { action: String, tool: String, params: Value, iteration: u32 },
    ReactObservation { result: String, iteration: u32 },
    ReactAdapting { reason: String, new_strategy: String, iteration: u32 },
    ReactComplete { result: String },
    ReactFailed { reason: String, tried: Vec<String> },
}

impl StreamEvent {
    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::MessageStart { .. } => "message_start",
            Self::MessageChunk { .. } => "message_chunk",
            Self::MessageComplete { .. } => "message_complete",
            Self::ThinkingChunk { .. } => "thinking_chunk",
            Self::ResponseChunk { .. } => "response_chunk",
            Self::PlanGenerated { .. } => "plan_generated",
            Self::PlanThinkingChunk { .. } => "plan_thinking_chunk",
            Self::PlanThinkingComplete {} => "plan_thinking_complete",
            Self::PlanUpdated { .. } => "plan_updated",
            Self::AwaitingConfirmation {} => "awaiting_confirmation",
            Self::StepStart { .. } => "step_start",
            Self::StepComplete { .. } => "step_complete",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::UserAssistanceRequest { .. } => "user_assistance_request",
            Self::FinalResultStart {} => "final_result_start",
            Self::FinalResultChunk { .. } => "final_result_chunk",
            Self::FinalResultComplete { .. } => "final_result_complete",
            Self::WorkflowComplete {} => "workflow_complete",
            Self::WorkflowStopped { .. } => "workflow_stopped",
            Self::WorkflowPaused { .. } => "workflow_paused",
            Self::Error { .. } => "error",
            Self::ReactStart { .. } => "react_start",
            Self::ReactThinking { .. } => "react_thinking",
            Self::ReactAction { .. } => "react_action",
            Self::ReactObservation { .. } => "react_observation",
            Self::ReactAdapting { .. } => "react_adapting",
            Self::ReactComplete { .. } => "react_complete",
            Self::ReactFailed { .. } => "react_failed",
        }
    }

    /// Content events are the ones the stop protocol must silence.
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            Self::MessageChunk { .. }
                | Self::ResponseChunk { .. }
                | Self::ThinkingChunk { .. }
                | Self::FinalResultChunk { .. }
        )
    }
}

/// Wire envelope: `{type, timestamp, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: StreamEvent,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn now(event: StreamEvent) -> Self {
        Self { event, timestamp: Utc::now() }
    }
}
