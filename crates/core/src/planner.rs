use std::sync::Arc;

use maestro_llm::{
    ChatMessage, ChatRequest, ChatResponse, LlmGateway, StreamFragment, extract_json,
    relabel_history_for_reasoning,
};
use maestro_session::{EventBus, StreamEvent};
use maestro_tools::ToolSpec;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::gate::StopSignal;
use crate::{OrchestratorError, prompts};

/// Reasoning budget for plan generation.  Kept low so the model plans
/// instead of musing.
const PLAN_REASONING_BUDGET: u32 = 3_000;

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedPlan {
    pub plan: String,
    pub steps: Vec<String>,
    /// Stop was requested while the plan streamed; whatever parsed is a
    /// salvage, not a commitment.
    pub stopped: bool,
}

#[derive(Debug, Deserialize)]
struct PlanShape {
    #[serde(default)]
    plan: String,
    #[serde(default)]
    steps: Vec<String>,
}

/// Inputs assembled by the orchestrator for one planning call.
pub struct PlanContext {
    pub model: Option<String>,
    pub use_reasoning: bool,
    /// Prior conversation turns, oldest first.
    pub history: Vec<ChatMessage>,
    /// Rendered uploaded-files section (may be empty).
    pub files_section: String,
    /// Rendered entity listing (may be empty).
    pub entity_listing: String,
    pub specs: Vec<ToolSpec>,
}

/// Turns a request plus context into `{plan, steps}`.  Never invokes tools;
/// only produces text.
pub struct Planner {
    gateway: Arc<dyn LlmGateway>,
}

impl Planner {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }

    /// Generate a plan, streaming reasoning fragments as
    /// `plan_thinking_chunk` events.  Infallible by design: gateway or parse
    /// failures degrade to a trivial single-step plan.
    pub async fn generate(
        &self,
        user_request: &str,
        ctx: PlanContext,
        bus: &EventBus,
        session_id: &str,
        stop: &StopSignal,
    ) -> GeneratedPlan {
        if stop.is_stopped() {
            return GeneratedPlan { plan: "Execution plan (stopped)".into(), steps: vec![], stopped: true };
        }

        let mut system_prompt = prompts::build_planning_prompt(&ctx.specs);
        system_prompt.push_str(&prompts::entity_context_block(&ctx.entity_listing));

        let mut messages = vec![ChatMessage::system(system_prompt)];
        let history = if ctx.use_reasoning {
            relabel_history_for_reasoning(&ctx.history)
        } else {
            ctx.history
        };
        messages.extend(history);
        messages.push(ChatMessage::user(format!(
            "{}Create a detailed execution plan for this request:\n\n{user_request}",
            ctx.files_section
        )));

        let mut request = ChatRequest::new(messages);
        if let Some(model) = ctx.model {
            request = request.with_model(model);
        }
        if ctx.use_reasoning {
            request = request.with_reasoning(PLAN_REASONING_BUDGET);
        }

        let mut collected = String::new();
        let streamed = stream_with_stop(&self.gateway, request, stop, |fragment| match fragment {
            StreamFragment::Thinking(text) => {
                bus.send(session_id, StreamEvent::PlanThinkingChunk { content: text });
            }
            StreamFragment::Text(text) => collected.push_str(&text),
        })
        .await;

        match streamed {
            Ok(response) => {
                bus.send(session_id, StreamEvent::PlanThinkingComplete {});
                self.parse_plan(user_request, &response.content, false)
            }
            Err(OrchestratorError::Stopped) => {
                info!("plan generation stopped mid-stream; salvaging partial output");
                if collected.is_empty() {
                    GeneratedPlan {
                        plan: "Execution plan (stopped)".into(),
                        steps: vec![],
                        stopped: true,
                    }
                } else {
                    self.parse_plan(user_request, &collected, true)
                }
            }
            Err(err) => {
                warn!(?err, "plan generation failed; falling back to a trivial plan");
                GeneratedPlan {
                    plan: format!("Execute: {user_request}"),
                    steps: vec![user_request.to_string()],
                    stopped: false,
                }
            }
        }
    }

    fn parse_plan(&self, user_request: &str, response: &str, stopped: bool) -> GeneratedPlan {
        match extract_json::<PlanShape>(response) {
            Some(parsed) => {
                let steps = if parsed.steps.is_empty() {
                    // Fewer than one step degrades to a trivial plan rather
                    // than a validation error.
                    warn!("planner returned no steps; using the request as a single step");
                    vec![user_request.to_string()]
                } else {
                    parsed.steps
                };
                let plan = if parsed.plan.is_empty() { "Execution plan".to_string() } else { parsed.plan };
                info!(step_count = steps.len(), "plan generated");
                GeneratedPlan { plan, steps, stopped }
            }
            None => {
                warn!("plan response was not valid JSON; falling back to a trivial plan");
                GeneratedPlan {
                    plan: format!("Execute: {user_request}"),
                    steps: vec![user_request.to_string()],
                    stopped,
                }
            }
        }
    }
}

/// Run a streaming gateway call under the stop protocol: fragments are
/// forwarded to `on_fragment` as they arrive, and a stop request aborts the
/// in-flight task and surfaces as [`OrchestratorError::Stopped`].
pub(crate) async fn stream_with_stop(
    gateway: &Arc<dyn LlmGateway>,
    request: ChatRequest,
    stop: &StopSignal,
    mut on_fragment: impl FnMut(StreamFragment),
) -> Result<ChatResponse, OrchestratorError> {
    let (tx, mut rx) = mpsc::channel::<StreamFragment>(64);
    let gateway = gateway.clone();
    let mut task = tokio::spawn(async move { gateway.chat_stream(request, tx).await });

    loop {
        tokio::select! {
            fragment = rx.recv() => {
                match fragment {
                    Some(fragment) => {
                        if stop.is_stopped() {
                            task.abort();
                            return Err(OrchestratorError::Stopped);
                        }
                        on_fragment(fragment);
                    }
                    // Sender dropped: the call is finishing; fall through to
                    // collect the response.
                    None => break,
                }
            }
            _ = stop.notified() => {
                task.abort();
                return Err(OrchestratorError::Stopped);
            }
        }
    }

    if stop.is_stopped() {
        task.abort();
        return Err(OrchestratorError::Stopped);
    }

    match task.await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => Err(OrchestratorError::Fatal(err)),
        Err(join_err) if join_err.is_cancelled() => Err(OrchestratorError::Stopped),
        Err(join_err) => Err(OrchestratorError::Fatal(join_err.into())),
    }
}
