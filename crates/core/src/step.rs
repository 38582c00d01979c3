//! The step orchestrator: plan → (approve) → execute steps → final answer.
//!
//! One instance drives one complex turn.  The wrapper owns the instance and
//! forwards approval, plan edits, assistance responses, and stop requests to
//! it while `execute` runs; all cross-task state therefore lives behind
//! gates and mutexes, and `execute` takes `&self`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use maestro_config::WorkspaceFolder;
use maestro_llm::{
    ChatMessage, ChatRequest, LlmGateway, StreamFragment, relabel_history_for_reasoning,
};
use maestro_session::{
    AssistanceOption, ConversationContext, EventBus, Role, PlanSnapshot, StreamEvent,
};
use maestro_tools::{ToolRegistry, specs_to_tools_json};
use regex::Regex;
use serde_json::{Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::assist::{self, CRITICAL_FAILURE_MARKER};
use crate::gate::{Gate, StopSignal};
use crate::planner::{PlanContext, Planner, stream_with_stop};
use crate::{OrchestratorError, prompts, truncate_chars};

/// Transport-side cap on `tool_result` event payloads.  The model always
/// sees the full result; only the streamed event is truncated.
pub const TOOL_RESULT_EVENT_LIMIT: usize = 2_000;

/// Reasoning budget for step execution.
const STEP_REASONING_BUDGET: u32 = 3_000;

/// How many prior context messages each prompt replays.
const HISTORY_WINDOW: usize = 10;

const STOPPED_BY_USER: &str = "Stopped by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorMode {
    /// Generate a plan and execute immediately.
    PlanAndExecute,
    /// Generate a plan, gate on user approval, then execute.
    PlanAndConfirm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Completed,
    Rejected,
    Stopped,
    Timeout,
    Paused,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub step: usize,
    pub title: String,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub status: ExecStatus,
    pub plan: Option<String>,
    pub steps: Vec<StepRecord>,
    pub confirmation_id: Option<String>,
    pub result: Option<String>,
}

impl ExecutionReport {
    fn bare(status: ExecStatus) -> Self {
        Self { status, plan: None, steps: Vec::new(), confirmation_id: None, result: None }
    }
}

struct PendingAssistance {
    id: String,
    options: Vec<AssistanceOption>,
}

pub struct StepOrchestrator {
    bus: Arc<EventBus>,
    gateway: Arc<dyn LlmGateway>,
    registry: Arc<ToolRegistry>,
    planner: Planner,
    session_id: String,
    model_name: Option<String>,
    model_supports_reasoning: bool,
    workspace: Option<WorkspaceFolder>,
    gate_timeout: Duration,
    stop: StopSignal,
    confirm_gate: Gate<bool>,
    assist_gate: Gate<AssistanceOption>,
    confirmation_id: Mutex<Option<String>>,
    pending_assistance: Mutex<Option<PendingAssistance>>,
    /// Current plan text + steps; replaced by `update_pending_plan`.
    pending_plan: Mutex<(String, Vec<String>)>,
}

impl StepOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<EventBus>,
        gateway: Arc<dyn LlmGateway>,
        registry: Arc<ToolRegistry>,
        session_id: impl Into<String>,
        model_name: Option<String>,
        model_supports_reasoning: bool,
        workspace: Option<WorkspaceFolder>,
        gate_timeout: Duration,
    ) -> Self {
        let planner = Planner::new(gateway.clone());
        Self {
            bus,
            gateway,
            registry,
            planner,
            session_id: session_id.into(),
            model_name,
            model_supports_reasoning,
            workspace,
            gate_timeout,
            stop: StopSignal::new(),
            confirm_gate: Gate::new(),
            assist_gate: Gate::new(),
            confirmation_id: Mutex::new(None),
            pending_assistance: Mutex::new(None),
            pending_plan: Mutex::new((String::new(), Vec::new())),
        }
    }

    // ── Control surface (called from other tasks) ───────────────────────────

    pub fn stop(&self) {
        info!(session_id = %self.session_id, "stop requested");
        self.stop.trigger();
    }

    pub fn confirm_plan(&self) {
        self.confirm_gate.resolve(true);
    }

    pub fn reject_plan(&self) {
        self.confirm_gate.resolve(false);
    }

    pub fn get_confirmation_id(&self) -> Option<String> {
        self.confirmation_id.lock().expect("lock poisoned").clone()
    }

    pub fn get_user_assistance_id(&self) -> Option<String> {
        self.pending_assistance
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(|p| p.id.clone())
    }

    /// Replace the not-yet-approved plan and tell the client.
    pub fn update_pending_plan(&self, plan: String, steps: Vec<String>) {
        let confirmation_id = self.get_confirmation_id().unwrap_or_default();
        {
            let mut pending = self.pending_plan.lock().expect("lock poisoned");
            *pending = (plan.clone(), steps.clone());
        }
        self.bus.send(
            &self.session_id,
            StreamEvent::PlanUpdated { plan, steps, confirmation_id },
        );
    }

    /// Match the user's reply to an option and unblock the waiting step.
    /// Unmatched replies fall back to the first option.
    pub fn resolve_user_assistance(&self, assistance_id: &str, user_response: &str) {
        let pending = self.pending_assistance.lock().expect("lock poisoned");
        let Some(ref assistance) = *pending else {
            warn!(assistance_id, "no assistance request pending");
            return;
        };
        if assistance.id != assistance_id {
            warn!(
                expected = %assistance.id,
                got = assistance_id,
                "assistance id mismatch; ignoring"
            );
            return;
        }
        let selected = assist::parse_user_selection(user_response, &assistance.options)
            .or_else(|| assistance.options.first())
            .cloned();
        drop(pending);
        if let Some(option) = selected {
            info!(option_id = %option.id, "user assistance resolved");
            self.assist_gate.resolve(option);
        }
    }

    // ── Execution ───────────────────────────────────────────────────────────

    pub async fn execute(
        &self,
        user_request: &str,
        mode: OrchestratorMode,
        context: &Arc<AsyncMutex<ConversationContext>>,
        file_ids: &[String],
    ) -> anyhow::Result<ExecutionReport> {
        let specs = self.registry.list_specs();
        let use_reasoning = self.model_supports_reasoning && !is_simple_generative(user_request);

        // Snapshot what planning needs, then release the context before any
        // model call.
        let (history, files_section, entity_listing) = {
            let ctx = context.lock().await;
            let mut files_section = prompts::uploaded_files_section(&ctx.files_for(file_ids));
            files_section.push_str(&prompts::open_files_section(&ctx.open_files));
            (chat_history(&ctx), files_section, ctx.entity_context_string())
        };

        let generated = self
            .planner
            .generate(
                user_request,
                PlanContext {
                    model: self.model_name.clone(),
                    use_reasoning,
                    history,
                    files_section: files_section.clone(),
                    entity_listing,
                    specs: specs.clone(),
                },
                &self.bus,
                &self.session_id,
                &self.stop,
            )
            .await;

        if generated.stopped || self.stop.is_stopped() {
            self.emit_stopped(0, generated.steps.len());
            return Ok(ExecutionReport {
                plan: Some(generated.plan),
                ..ExecutionReport::bare(ExecStatus::Stopped)
            });
        }

        let confirmation_id = Uuid::new_v4().to_string();
        *self.confirmation_id.lock().expect("lock poisoned") = Some(confirmation_id.clone());
        *self.pending_plan.lock().expect("lock poisoned") =
            (generated.plan.clone(), generated.steps.clone());

        // Single-step fast path: no plan emission, no approval gate.
        if generated.steps.len() == 1 {
            return self
                .execute_single_step(user_request, &generated.plan, &generated.steps[0], context, &files_section, use_reasoning, &specs, &confirmation_id)
                .await;
        }

        self.bus.send(
            &self.session_id,
            StreamEvent::PlanGenerated {
                plan: generated.plan.clone(),
                steps: generated.steps.clone(),
                confirmation_id: confirmation_id.clone(),
            },
        );

        if self.stop.is_stopped() {
            self.emit_stopped(0, generated.steps.len());
            return Ok(ExecutionReport {
                plan: Some(generated.plan),
                ..ExecutionReport::bare(ExecStatus::Stopped)
            });
        }

        if mode == OrchestratorMode::PlanAndConfirm {
            if let Some(report) = self.await_approval(&confirmation_id, &generated, context).await? {
                return Ok(report);
            }
        }

        // The plan may have been edited while pending.
        let (plan_text, steps) = self.pending_plan.lock().expect("lock poisoned").clone();

        let mut records: Vec<StepRecord> = Vec::new();
        let mut paused = false;

        for (index, title) in steps.iter().enumerate() {
            let step_number = index + 1;
            if self.stop.is_stopped() {
                self.emit_stopped(index, steps.len() - index);
                return Ok(ExecutionReport {
                    status: ExecStatus::Stopped,
                    plan: Some(plan_text.clone()),
                    steps: records,
                    confirmation_id: Some(confirmation_id.clone()),
                    result: None,
                });
            }

            self.bus.send(
                &self.session_id,
                StreamEvent::StepStart { step: step_number, title: title.clone() },
            );

            let step_result = self
                .run_step(
                    step_number,
                    title,
                    user_request,
                    &plan_text,
                    steps.len(),
                    &records,
                    context,
                    &files_section,
                    use_reasoning,
                    &specs,
                )
                .await;

            let result_text = match step_result {
                Ok(text) => text,
                Err(OrchestratorError::Stopped) => {
                    // Stopped mid-step: the current step counts as reached.
                    self.emit_stopped(step_number, steps.len() - step_number);
                    return Ok(ExecutionReport {
                        status: ExecStatus::Stopped,
                        plan: Some(plan_text.clone()),
                        steps: records,
                        confirmation_id: Some(confirmation_id.clone()),
                        result: None,
                    });
                }
                Err(err) => {
                    self.bus.send(
                        &self.session_id,
                        StreamEvent::Error { message: format!("Error in step {step_number}: {err}") },
                    );
                    return Err(anyhow!("step {step_number} failed: {err}"));
                }
            };

            records.push(StepRecord { step: step_number, title: title.clone(), result: result_text.clone() });
            self.bus.send(&self.session_id, StreamEvent::StepComplete { step: step_number });

            if result_text.contains(CRITICAL_FAILURE_MARKER) {
                warn!(step = step_number, "step reported a critical failure; pausing workflow");
                self.bus.send(
                    &self.session_id,
                    StreamEvent::WorkflowPaused {
                        reason: "A step needs the user's help".to_string(),
                        step: step_number,
                        remaining_steps: steps.len() - step_number,
                    },
                );
                paused = true;
                break;
            }

            if self.stop.is_stopped() {
                self.emit_stopped(step_number, steps.len() - step_number);
                return Ok(ExecutionReport {
                    status: ExecStatus::Stopped,
                    plan: Some(plan_text.clone()),
                    steps: records,
                    confirmation_id: Some(confirmation_id.clone()),
                    result: None,
                });
            }
        }

        if paused {
            return Ok(ExecutionReport {
                status: ExecStatus::Paused,
                plan: Some(plan_text),
                steps: records,
                confirmation_id: Some(confirmation_id),
                result: None,
            });
        }

        self.bus.send(&self.session_id, StreamEvent::WorkflowComplete {});
        info!(steps = records.len(), "workflow completed");

        let final_answer = self.finalize(user_request, &records, context).await;

        Ok(ExecutionReport {
            status: ExecStatus::Completed,
            plan: Some(plan_text),
            steps: records,
            confirmation_id: Some(confirmation_id),
            result: Some(final_answer),
        })
    }

    /// Approval gate.  Returns `Some(report)` when the turn ends here.
    async fn await_approval(
        &self,
        confirmation_id: &str,
        generated: &crate::planner::GeneratedPlan,
        context: &Arc<AsyncMutex<ConversationContext>>,
    ) -> anyhow::Result<Option<ExecutionReport>> {
        self.bus.send(&self.session_id, StreamEvent::AwaitingConfirmation {});
        {
            let mut ctx = context.lock().await;
            ctx.add_pending_confirmation(
                confirmation_id,
                PlanSnapshot {
                    plan: generated.plan.clone(),
                    steps: generated.steps.clone(),
                    mode: "plan_and_confirm".to_string(),
                },
            );
        }

        let decision = self.confirm_gate.wait(&self.stop, self.gate_timeout).await;

        // Whatever happened, the confirmation is no longer pending.
        {
            let mut ctx = context.lock().await;
            ctx.resolve_confirmation(confirmation_id);
        }

        match decision {
            Ok(true) => Ok(None),
            Ok(false) => {
                self.bus.send(
                    &self.session_id,
                    StreamEvent::Error { message: "Plan rejected by user".to_string() },
                );
                Ok(Some(ExecutionReport {
                    plan: Some(generated.plan.clone()),
                    confirmation_id: Some(confirmation_id.to_string()),
                    ..ExecutionReport::bare(ExecStatus::Rejected)
                }))
            }
            Err(OrchestratorError::Stopped) => {
                self.emit_stopped(0, generated.steps.len());
                Ok(Some(ExecutionReport {
                    plan: Some(generated.plan.clone()),
                    ..ExecutionReport::bare(ExecStatus::Stopped)
                }))
            }
            Err(OrchestratorError::Timeout) => {
                warn!(session_id = %self.session_id, "confirmation timed out; plan discarded");
                self.bus.send(
                    &self.session_id,
                    StreamEvent::Error {
                        message: "Confirmation timeout. Plan execution cancelled.".to_string(),
                    },
                );
                Ok(Some(ExecutionReport {
                    plan: Some(generated.plan.clone()),
                    ..ExecutionReport::bare(ExecStatus::Timeout)
                }))
            }
            Err(err) => Err(err.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_single_step(
        &self,
        user_request: &str,
        plan_text: &str,
        title: &str,
        context: &Arc<AsyncMutex<ConversationContext>>,
        files_section: &str,
        use_reasoning: bool,
        specs: &[maestro_tools::ToolSpec],
        confirmation_id: &str,
    ) -> anyhow::Result<ExecutionReport> {
        info!("single-step plan; executing directly without plan emission");
        if self.stop.is_stopped() {
            self.emit_stopped(0, 1);
            return Ok(ExecutionReport::bare(ExecStatus::Stopped));
        }

        self.bus.send(&self.session_id, StreamEvent::StepStart { step: 1, title: title.to_string() });
        let result = self
            .run_step(1, title, user_request, plan_text, 1, &[], context, files_section, use_reasoning, specs)
            .await;

        let result_text = match result {
            Ok(text) => text,
            Err(OrchestratorError::Stopped) => {
                self.emit_stopped(1, 0);
                return Ok(ExecutionReport::bare(ExecStatus::Stopped));
            }
            Err(err) => {
                self.bus.send(
                    &self.session_id,
                    StreamEvent::Error { message: format!("Error in step 1: {err}") },
                );
                return Err(anyhow!("step 1 failed: {err}"));
            }
        };

        self.bus.send(&self.session_id, StreamEvent::StepComplete { step: 1 });

        // The step output is the final answer, verbatim.
        self.bus.send(&self.session_id, StreamEvent::FinalResultStart {});
        self.bus.send(
            &self.session_id,
            StreamEvent::FinalResultComplete { content: result_text.clone() },
        );
        context.lock().await.add_message(Role::Assistant, result_text.clone());

        Ok(ExecutionReport {
            status: ExecStatus::Completed,
            plan: Some(plan_text.to_string()),
            steps: vec![StepRecord { step: 1, title: title.to_string(), result: result_text.clone() }],
            confirmation_id: Some(confirmation_id.to_string()),
            result: Some(result_text),
        })
    }

    /// Run one step: stream the model, collect tool calls, dispatch them,
    /// fetch the closing narrative, and handle a mid-step assistance pause.
    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        step_number: usize,
        title: &str,
        user_request: &str,
        plan_text: &str,
        total_steps: usize,
        previous: &[StepRecord],
        context: &Arc<AsyncMutex<ConversationContext>>,
        files_section: &str,
        use_reasoning: bool,
        specs: &[maestro_tools::ToolSpec],
    ) -> Result<String, OrchestratorError> {
        if self.stop.is_stopped() {
            return Err(OrchestratorError::Stopped);
        }

        let (history, entity_listing) = {
            let ctx = context.lock().await;
            (chat_history(&ctx), ctx.entity_context_string())
        };

        let mut system_prompt = prompts::build_step_executor_prompt(specs, self.workspace.as_ref());
        system_prompt.push_str(&prompts::entity_context_block(&entity_listing));

        let mut step_context = String::new();
        step_context.push_str(files_section);
        step_context.push_str(&prompts::workspace_section(self.workspace.as_ref()));
        step_context.push_str(&format!("Original request: {user_request}\n\n"));
        step_context.push_str(&format!("Overall plan: {plan_text}\n"));
        step_context.push_str("\nCompleted steps:\n");
        for record in previous {
            step_context.push_str(&format!("  {}. {}: {}\n", record.step, record.title, record.result));
        }
        step_context.push_str(&format!(
            "\nCurrent step ({step_number} of {total_steps}): {title}\n\n\
             Execute this step. Provide a clear, specific answer."
        ));

        let mut messages = vec![ChatMessage::system(system_prompt)];
        let history = if use_reasoning { relabel_history_for_reasoning(&history) } else { history };
        messages.extend(history);
        messages.push(ChatMessage::user(step_context));

        let tools = specs_to_tools_json(specs);
        let mut request = ChatRequest::new(messages.clone()).with_tools(tools.clone());
        if let Some(ref model) = self.model_name {
            request = request.with_model(model.clone());
        }
        if use_reasoning {
            request = request.with_reasoning(STEP_REASONING_BUDGET);
        }

        // Streaming pass: thinking and text go to the client as they arrive;
        // tool_use deltas stay off the user-visible channel.
        let streamed = stream_with_stop(&self.gateway, request, &self.stop, |fragment| {
            match fragment {
                StreamFragment::Thinking(text) => {
                    self.bus.send(&self.session_id, StreamEvent::ThinkingChunk { content: text });
                }
                StreamFragment::Text(text) => {
                    self.bus.send(&self.session_id, StreamEvent::ResponseChunk { content: text });
                }
            }
        })
        .await?;

        let mut accumulated = streamed.content;
        info!(step = step_number, response_len = accumulated.len(), "step streaming pass complete");

        // Materialize tool calls with one non-streaming call, then dispatch.
        let mut tool_request = ChatRequest::new(messages.clone()).with_tools(tools);
        if let Some(ref model) = self.model_name {
            tool_request = tool_request.with_model(model.clone());
        }
        match self.gateway.chat(tool_request).await {
            Ok(tool_response) if !tool_response.tool_calls.is_empty() => {
                let mut followup = messages;
                followup.push(ChatMessage::assistant_tool_calls(tool_response.tool_calls.clone()));

                for call in &tool_response.tool_calls {
                    if self.stop.is_stopped() {
                        return Err(OrchestratorError::Stopped);
                    }
                    let result_text = self.dispatch_tool_call(&call.name, &call.arguments, context).await?;
                    accumulated.push_str(&format!("\n\nTool {} result: {}\n", call.name, result_text));
                    followup.push(ChatMessage::tool_result(&call.id, &result_text));
                }

                // One more call for the step's closing narrative.
                let mut closing_request = ChatRequest::new(followup);
                if let Some(ref model) = self.model_name {
                    closing_request = closing_request.with_model(model.clone());
                }
                match self.gateway.chat(closing_request).await {
                    Ok(closing) => {
                        if !closing.content.is_empty() && !accumulated.contains(&closing.content) {
                            accumulated.push_str(&closing.content);
                        }
                    }
                    Err(err) => warn!(?err, "closing narrative call failed; keeping tool results"),
                }
            }
            Ok(_) => {}
            Err(err) => return Err(OrchestratorError::Fatal(err)),
        }

        if self.stop.is_stopped() {
            return Err(OrchestratorError::Stopped);
        }

        // Mid-step assistance pause.
        if let Some(request) = assist::parse_assistance_request(&accumulated) {
            if let Some(selected) = self.request_assistance(request, step_number).await? {
                accumulated.push_str(&format!("\n\nUser selected option: {}\n", selected.label));
                if let Some(ref data) = selected.data {
                    accumulated.push_str(&format!("Selection data: {data}\n"));
                }
            }
        }

        Ok(accumulated)
    }

    /// Look up and invoke one tool, emitting `tool_call`/`tool_result`
    /// around it.  An unknown tool name is a validation failure that aborts
    /// the turn; a failing tool is surfaced to both the client and the
    /// model, which may choose to re-invoke it.
    async fn dispatch_tool_call(
        &self,
        name: &str,
        arguments: &Value,
        context: &Arc<AsyncMutex<ConversationContext>>,
    ) -> Result<String, OrchestratorError> {
        self.bus.send(
            &self.session_id,
            StreamEvent::ToolCall {
                tool_name: name.to_string(),
                arguments: arguments.clone(),
                status: Some("calling".to_string()),
            },
        );

        let Some(tool) = self.registry.get(name) else {
            return Err(OrchestratorError::Validation(format!("unknown tool: {name}")));
        };

        let output = match tool.run(arguments).await {
            Ok(output) => output,
            Err(err) => maestro_tools::ToolOutput::failure(format!("Error: {err}")),
        };

        if !output.success {
            self.bus.send(
                &self.session_id,
                StreamEvent::Error { message: format!("Tool {name} failed: {}", truncate_chars(&output.output, 300)) },
            );
        }

        let event_text = if output.output.chars().count() > TOOL_RESULT_EVENT_LIMIT {
            format!(
                "{}\n\n… (result truncated, first {TOOL_RESULT_EVENT_LIMIT} chars shown)",
                truncate_chars(&output.output, TOOL_RESULT_EVENT_LIMIT)
            )
        } else {
            output.output.clone()
        };
        self.bus.send(
            &self.session_id,
            StreamEvent::ToolResult { tool_name: name.to_string(), result: event_text },
        );

        // Entity extraction is best-effort and never fatal.
        {
            let mut ctx = context.lock().await;
            let turn = ctx.messages().len();
            let structured = output
                .structured
                .clone()
                .or_else(|| serde_json::from_str(&output.output).ok())
                .unwrap_or(Value::Null);
            if !structured.is_null() {
                ctx.record_entities_from_tool(name, &structured, turn);
            }
        }

        Ok(output.output)
    }

    /// Emit the assistance request and block until the user answers, the
    /// wait times out, or the turn stops.  `Ok(None)` means "continue the
    /// step without a selection" (timeout).
    async fn request_assistance(
        &self,
        request: assist::AssistanceRequest,
        step_number: usize,
    ) -> Result<Option<AssistanceOption>, OrchestratorError> {
        let assistance_id = Uuid::new_v4().to_string();
        {
            let mut pending = self.pending_assistance.lock().expect("lock poisoned");
            *pending = Some(PendingAssistance {
                id: assistance_id.clone(),
                options: request.options.clone(),
            });
        }
        self.assist_gate.reset();

        let mut context_payload = json!({"step": step_number});
        if let Value::Object(extra) = request.context {
            for (key, value) in extra {
                context_payload[key] = value;
            }
        }

        self.bus.send(
            &self.session_id,
            StreamEvent::UserAssistanceRequest {
                assistance_id: assistance_id.clone(),
                question: request.question,
                options: request.options,
                context: context_payload,
            },
        );
        info!(step = step_number, %assistance_id, "user assistance requested");

        let outcome = self.assist_gate.wait(&self.stop, self.gate_timeout).await;
        *self.pending_assistance.lock().expect("lock poisoned") = None;

        match outcome {
            Ok(option) => Ok(Some(option)),
            Err(OrchestratorError::Timeout) => {
                self.bus.send(
                    &self.session_id,
                    StreamEvent::Error {
                        message: "User assistance timeout. Execution cancelled.".to_string(),
                    },
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Decide between reusing the last step's output and generating a fresh
    /// summary, then stream the final answer.
    async fn finalize(
        &self,
        user_request: &str,
        records: &[StepRecord],
        context: &Arc<AsyncMutex<ConversationContext>>,
    ) -> String {
        let reuse = !needs_final_generation(user_request, records);
        let last_result = records.last().map(|r| r.result.clone()).unwrap_or_default();

        if reuse {
            info!("using the last step result as the final answer");
            self.bus.send(&self.session_id, StreamEvent::FinalResultStart {});
            self.bus.send(
                &self.session_id,
                StreamEvent::FinalResultComplete { content: last_result.clone() },
            );
            context.lock().await.add_message(Role::Assistant, last_result.clone());
            return last_result;
        }

        let mut steps_summary = String::new();
        for record in records {
            steps_summary.push_str(&truncate_chars(&record.result, 1_000));
            steps_summary.push_str("\n\n");
        }

        let messages = vec![
            ChatMessage::system(prompts::FINAL_ANSWER_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Original user request: {user_request}\n\n\
                 Data gathered while executing the request:\n{steps_summary}\n\
                 Write the final answer to the user. Answer the request directly from the data; \
                 do not mention the execution process, steps, or tools."
            )),
        ];
        let mut request = ChatRequest::new(messages);
        if let Some(ref model) = self.model_name {
            request = request.with_model(model.clone());
        }

        self.bus.send(&self.session_id, StreamEvent::FinalResultStart {});
        let streamed = stream_with_stop(&self.gateway, request, &self.stop, |fragment| {
            if let StreamFragment::Text(text) = fragment {
                self.bus.send(&self.session_id, StreamEvent::FinalResultChunk { content: text });
            }
        })
        .await;

        let final_answer = match streamed {
            Ok(response) => response.content.trim().to_string(),
            Err(err) => {
                // Summarizer failure must not sink the whole workflow; fall
                // back to concatenated step previews.
                warn!(?err, "final answer generation failed; using step results");
                let mut combined: Vec<String> = records
                    .iter()
                    .filter(|r| !r.result.trim().is_empty())
                    .map(|r| truncate_chars(&r.result, 300))
                    .collect();
                if combined.is_empty() {
                    combined.push("Request completed.".to_string());
                }
                combined.join("\n\n")
            }
        };

        self.bus.send(
            &self.session_id,
            StreamEvent::FinalResultComplete { content: final_answer.clone() },
        );
        context.lock().await.add_message(Role::Assistant, final_answer.clone());
        final_answer
    }

    fn emit_stopped(&self, step: usize, remaining_steps: usize) {
        self.bus.send(
            &self.session_id,
            StreamEvent::WorkflowStopped {
                reason: STOPPED_BY_USER.to_string(),
                step,
                remaining_steps,
            },
        );
    }
}

/// Prior turns rendered for a prompt, windowed to the last
/// [`HISTORY_WINDOW`] messages.
fn chat_history(ctx: &ConversationContext) -> Vec<ChatMessage> {
    ctx.recent_messages(HISTORY_WINDOW)
        .iter()
        .filter_map(|turn| match turn.role {
            Role::User => Some(ChatMessage::user(turn.content.clone())),
            Role::Assistant => Some(ChatMessage::assistant(turn.content.clone())),
            Role::System => None,
        })
        .collect()
}

/// Generative requests where the model's own prose IS the deliverable; the
/// planner runs without extended reasoning for these.
fn is_simple_generative(user_request: &str) -> bool {
    static PATTERNS: std::sync::OnceLock<Vec<Regex>> = std::sync::OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"напиши\s+(краткое\s+)?(поздравление|стих|стихотворение|шутку|анекдот|сообщение|текст|хокку|хайку)",
            r"придумай\s+(поздравление|стих|шутку|название|имя|историю)",
            r"сочини\s+(стих|песню|историю|сказку|хокку|хайку)",
            r"write\s+(a\s+|me\s+a\s+)?(greeting|poem|joke|message|story|haiku)",
            r"compose\s+(a\s+)?(poem|song|story|message)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });
    let lower = user_request.to_lowercase();
    patterns.iter().any(|p| p.is_match(&lower))
}

/// Reuse-last-step-as-final heuristics.  Returns `true` when a separate
/// summarization pass is warranted.
fn needs_final_generation(user_request: &str, records: &[StepRecord]) -> bool {
    if records.len() <= 1 {
        return false;
    }

    let request_lower = user_request.to_lowercase();

    const GENERATIVE: &[&str] = &[
        "напиши", "создай текст", "придумай", "сочини", "write", "compose", "create a message",
    ];
    if GENERATIVE.iter().any(|k| request_lower.contains(k)) {
        return false;
    }

    const STRUCTURED: &[&str] = &["таблиц", "список", "спис", "table", "list"];
    if STRUCTURED.iter().any(|k| request_lower.contains(k)) {
        if let Some(last) = records.last() {
            let result = &last.result;
            let has_table = result.contains('|') || result.contains("---");
            let has_list = ["- ", "* ", "1. ", "• "].iter().any(|m| result.contains(m));
            if (has_table || has_list) && result.chars().count() > 200 {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: usize, result: &str) -> StepRecord {
        StepRecord { step, title: format!("step {step}"), result: result.to_string() }
    }

    #[test]
    fn single_step_reuses_last_result() {
        assert!(!needs_final_generation("собери данные", &[record(1, "data")]));
        assert!(!needs_final_generation("anything", &[]));
    }

    #[test]
    fn generative_requests_reuse_last_result() {
        let records = vec![record(1, "draft"), record(2, "final poem text")];
        assert!(!needs_final_generation("напиши стихотворение про осень", &records));
        assert!(!needs_final_generation("write a poem about autumn and send it", &records));
    }

    #[test]
    fn structured_data_with_markers_reuses_last_result() {
        let table = format!("| Name | Total |\n|---|---|\n{}", "| row | 1 |\n".repeat(30));
        let records = vec![record(1, "found the sheet"), record(2, &table)];
        assert!(!needs_final_generation("сделай таблицу продаж", &records));
    }

    #[test]
    fn short_structured_output_still_generates() {
        let records = vec![record(1, "found"), record(2, "| a | b |")];
        assert!(needs_final_generation("сделай таблицу продаж", &records));
    }

    #[test]
    fn multi_step_action_workflows_generate_a_summary() {
        let records = vec![
            record(1, "report created"),
            record(2, "email sent to boss@example.com"),
        ];
        assert!(needs_final_generation("подготовь отчёт и отправь его", &records));
    }

    #[test]
    fn simple_generative_detection() {
        assert!(is_simple_generative("напиши стихотворение про весну"));
        assert!(is_simple_generative("write me a poem about rust"));
        assert!(is_simple_generative("сочини сказку для детей"));
        assert!(!is_simple_generative("составь отчёт по продажам"));
        assert!(!is_simple_generative("create a spreadsheet with totals"));
    }

    #[test]
    fn execution_report_bare_defaults() {
        let report = ExecutionReport::bare(ExecStatus::Timeout);
        assert_eq!(report.status, ExecStatus::Timeout);
        assert!(report.steps.is_empty());
        assert!(report.result.is_none());
    }
}
