//! The per-message front door.
//!
//! One wrapper serves all sessions.  It waits for a subscriber, classifies
//! the task, routes SIMPLE turns to a direct streaming path and COMPLEX
//! turns to a fresh step orchestrator, and owns the active-orchestrator map
//! so approval, plan edits, assistance responses, and stop requests find
//! their way to the right in-flight turn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, bail};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use maestro_config::AppConfig;
use maestro_core::{
    ExecStatus, ExecutionReport, OrchestratorMode, StepOrchestrator, TaskClassifier, TaskType,
};
use maestro_llm::{ChatMessage, ChatRequest, LlmGateway, LlmRouter, StreamFragment};
use maestro_session::{
    ConversationContext, EventBus, ExecutionMode, Role, SessionStore, StreamEvent,
};
use maestro_tools::ToolRegistry;

use crate::audit::AuditLogger;

/// Poll interval while waiting for a subscriber to attach.
const SUBSCRIBER_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    Simple { response: String },
    Workflow(ExecutionReport),
}

pub struct AgentWrapper {
    bus: Arc<EventBus>,
    store: Arc<SessionStore>,
    gateway: Arc<dyn LlmGateway>,
    registry: Arc<ToolRegistry>,
    config: AppConfig,
    classifier: TaskClassifier,
    audit: Option<AuditLogger>,
    /// Model catalog lookup for the reasoning capability flag; `None` when
    /// the gateway is not the production router (tests).
    router: Option<Arc<LlmRouter>>,
    active: Mutex<HashMap<String, Arc<StepOrchestrator>>>,
}

impl AgentWrapper {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<SessionStore>,
        gateway: Arc<dyn LlmGateway>,
        registry: Arc<ToolRegistry>,
        config: AppConfig,
    ) -> Self {
        let classifier = TaskClassifier::new(gateway.clone(), config.llm.fast_model.clone());
        let audit = config
            .telemetry
            .audit_enabled
            .then(|| AuditLogger::new(&config.telemetry.logs_dir));
        Self {
            bus,
            store,
            gateway,
            registry,
            config,
            classifier,
            audit,
            router: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Production constructor: the router doubles as the gateway and as the
    /// catalog for reasoning-capability lookups.
    pub fn with_router(
        bus: Arc<EventBus>,
        store: Arc<SessionStore>,
        router: Arc<LlmRouter>,
        registry: Arc<ToolRegistry>,
        config: AppConfig,
    ) -> Self {
        let mut wrapper = Self::new(bus, store, router.clone(), registry, config);
        wrapper.router = Some(router);
        wrapper
    }

    fn audit(&self, session_id: &str, kind: &str, detail: serde_json::Value) {
        if let Some(ref audit) = self.audit {
            audit.record(session_id, kind, detail);
        }
    }

    fn orchestrator(&self, session_id: &str) -> Option<Arc<StepOrchestrator>> {
        self.active.lock().expect("active map lock poisoned").get(session_id).cloned()
    }

    /// Process one user message end to end.
    pub async fn process_message(
        &self,
        user_message: &str,
        session_id: &str,
        file_ids: &[String],
    ) -> Result<TurnResult> {
        let context = self
            .store
            .get(session_id)
            .with_context(|| format!("unknown session: {session_id}"))?;

        // Give a subscriber a moment to attach before any event is emitted.
        let wait_budget = Duration::from_secs(self.config.server.subscriber_wait_secs);
        let started = tokio::time::Instant::now();
        while self.bus.subscriber_count(session_id) == 0 && started.elapsed() < wait_budget {
            tokio::time::sleep(SUBSCRIBER_POLL).await;
        }
        if self.bus.subscriber_count(session_id) == 0 {
            warn!(session_id, "no subscriber attached; proceeding anyway");
        }

        self.bus.send(
            session_id,
            StreamEvent::Message { role: "user".to_string(), content: user_message.to_string() },
        );
        self.audit(session_id, "message", json!({"content": user_message}));
        context.lock().await.add_message(Role::User, user_message);

        let task_type = self.classifier.classify(user_message).await;
        match task_type {
            TaskType::Simple => {
                info!(session_id, "simple task; direct streaming path");
                let response = self.execute_simple(user_message, session_id, &context).await?;
                self.audit(session_id, "simple_turn", json!({"status": "completed"}));
                Ok(TurnResult::Simple { response })
            }
            TaskType::Complex => {
                info!(session_id, "complex task; step orchestrator path");
                let report = self
                    .execute_workflow(user_message, session_id, &context, file_ids)
                    .await?;
                Ok(TurnResult::Workflow(report))
            }
        }
    }

    // ── SIMPLE path ─────────────────────────────────────────────────────────

    async fn execute_simple(
        &self,
        user_message: &str,
        session_id: &str,
        context: &Arc<tokio::sync::Mutex<ConversationContext>>,
    ) -> Result<String> {
        let message_id = format!("stream_{session_id}_{}", Uuid::new_v4().simple());
        let (history, model_name) = {
            let ctx = context.lock().await;
            (simple_history(&ctx), ctx.model_name.clone())
        };

        let mut messages = vec![ChatMessage::system(
            "You are a helpful assistant for a multi-service workspace. Answer directly and \
             conversationally. Use the bound tools only when the request actually needs them.",
        )];
        messages.extend(history);
        messages.push(ChatMessage::user(user_message));

        let tools = maestro_tools::specs_to_tools_json(&self.registry.list_specs());
        let mut request = ChatRequest::new(messages.clone()).with_tools(tools);
        if let Some(ref model) = model_name {
            request = request.with_model(model.clone());
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel::<StreamFragment>(64);
        let gateway = self.gateway.clone();
        let mut task = tokio::spawn(async move { gateway.chat_stream(request, tx).await });

        let mut message_started = false;
        let mut accumulated = String::new();
        while let Some(fragment) = rx.recv().await {
            if let StreamFragment::Text(text) = fragment {
                if !message_started {
                    self.bus.send(
                        session_id,
                        StreamEvent::MessageStart {
                            role: "assistant".to_string(),
                            message_id: message_id.clone(),
                            content: String::new(),
                        },
                    );
                    message_started = true;
                }
                accumulated.push_str(&text);
                self.bus.send(
                    session_id,
                    StreamEvent::MessageChunk {
                        role: "assistant".to_string(),
                        message_id: message_id.clone(),
                        chunk: text,
                        content: accumulated.clone(),
                    },
                );
            }
        }

        let response = match (&mut task).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                // A fully failed stream: error, then a terminal
                // message_complete with empty content so the UI recovers.
                self.bus.send(session_id, StreamEvent::Error { message: err.to_string() });
                self.bus.send(
                    session_id,
                    StreamEvent::MessageComplete {
                        role: "assistant".to_string(),
                        message_id,
                        content: accumulated,
                    },
                );
                return Err(err);
            }
            Err(join_err) => bail!("streaming task panicked: {join_err}"),
        };

        let mut full_response = response.content.clone();

        // Surface any tool calls the model made, then fetch a closing reply.
        if !response.tool_calls.is_empty() {
            let mut followup = messages;
            followup.push(ChatMessage::assistant_tool_calls(response.tool_calls.clone()));
            for call in &response.tool_calls {
                self.bus.send(
                    session_id,
                    StreamEvent::ToolCall {
                        tool_name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        status: Some("calling".to_string()),
                    },
                );
                let output = match self.registry.get(&call.name) {
                    Some(tool) => match tool.run(&call.arguments).await {
                        Ok(output) => output,
                        Err(err) => maestro_tools::ToolOutput::failure(format!("Error: {err}")),
                    },
                    None => maestro_tools::ToolOutput::failure(format!("Error: unknown tool {}", call.name)),
                };
                self.bus.send(
                    session_id,
                    StreamEvent::ToolResult { tool_name: call.name.clone(), result: output.output.clone() },
                );
                followup.push(ChatMessage::tool_result(&call.id, &output.output));
            }
            let mut closing_request = ChatRequest::new(followup);
            if let Some(ref model) = model_name {
                closing_request = closing_request.with_model(model.clone());
            }
            if let Ok(closing) = self.gateway.chat(closing_request).await {
                if !closing.content.is_empty() {
                    full_response.push_str(&closing.content);
                }
            }
        }

        if !message_started {
            self.bus.send(
                session_id,
                StreamEvent::MessageStart {
                    role: "assistant".to_string(),
                    message_id: message_id.clone(),
                    content: String::new(),
                },
            );
            self.bus.send(
                session_id,
                StreamEvent::MessageChunk {
                    role: "assistant".to_string(),
                    message_id: message_id.clone(),
                    chunk: full_response.clone(),
                    content: full_response.clone(),
                },
            );
        }
        self.bus.send(
            session_id,
            StreamEvent::MessageComplete {
                role: "assistant".to_string(),
                message_id,
                content: full_response.clone(),
            },
        );

        context.lock().await.add_message(Role::Assistant, full_response.clone());

        // Short final answer from the cheap model; the raw response is the
        // fallback when that fails.
        let final_answer = self.summarize_simple(user_message, &full_response).await;
        self.bus.send(session_id, StreamEvent::FinalResultStart {});
        self.bus.send(session_id, StreamEvent::FinalResultComplete { content: final_answer });

        Ok(full_response)
    }

    async fn summarize_simple(&self, user_request: &str, response: &str) -> String {
        let messages = vec![
            ChatMessage::system(
                "You produce the final user-facing answer. Be direct, keep the key information, \
                 and never mention the execution process.",
            ),
            ChatMessage::user(format!(
                "Original request: {user_request}\n\nDraft answer:\n{response}\n\n\
                 Produce the final answer."
            )),
        ];
        let request = ChatRequest::new(messages).with_model(self.config.llm.fast_model.clone());
        match self.gateway.chat(request).await {
            Ok(summary) if !summary.content.trim().is_empty() => summary.content.trim().to_string(),
            _ => response.to_string(),
        }
    }

    // ── COMPLEX path ────────────────────────────────────────────────────────

    async fn execute_workflow(
        &self,
        user_message: &str,
        session_id: &str,
        context: &Arc<tokio::sync::Mutex<ConversationContext>>,
        file_ids: &[String],
    ) -> Result<ExecutionReport> {
        // A new request displaces any previous orchestrator for the session
        // so contexts never mix.
        if let Some(previous) = self.active.lock().expect("active map lock poisoned").remove(session_id) {
            info!(session_id, "stopping previous orchestrator");
            previous.stop();
        }

        let (mode, model_name) = {
            let ctx = context.lock().await;
            let mode = match ctx.execution_mode {
                ExecutionMode::Approval => OrchestratorMode::PlanAndConfirm,
                ExecutionMode::Instant => OrchestratorMode::PlanAndExecute,
            };
            (mode, ctx.model_name.clone())
        };

        let supports_reasoning = self
            .router
            .as_ref()
            .map(|router| router.supports_reasoning(model_name.as_deref()))
            .unwrap_or(false);

        let orchestrator = Arc::new(StepOrchestrator::new(
            self.bus.clone(),
            self.gateway.clone(),
            self.registry.clone(),
            session_id,
            model_name,
            supports_reasoning,
            self.config.workspace_folder(),
            Duration::from_secs(self.config.server.gate_timeout_secs),
        ));
        self.active
            .lock()
            .expect("active map lock poisoned")
            .insert(session_id.to_string(), orchestrator.clone());

        let result = orchestrator.execute(user_message, mode, context, file_ids).await;

        // Remove only when the map still holds THIS orchestrator: a newer
        // turn may already have displaced it.
        let remove_own_entry = |wrapper: &Self| {
            let mut active = wrapper.active.lock().expect("active map lock poisoned");
            if active
                .get(session_id)
                .is_some_and(|current| Arc::ptr_eq(current, &orchestrator))
            {
                active.remove(session_id);
            }
        };

        match &result {
            Ok(report) => {
                self.audit(
                    session_id,
                    "workflow",
                    json!({"status": status_name(report.status), "steps": report.steps.len()}),
                );
                if matches!(
                    report.status,
                    ExecStatus::Completed | ExecStatus::Rejected | ExecStatus::Stopped | ExecStatus::Timeout
                ) {
                    remove_own_entry(self);
                }
            }
            Err(err) => {
                self.audit(session_id, "workflow", json!({"status": "error", "error": err.to_string()}));
                remove_own_entry(self);
            }
        }

        result
    }

    // ── Routing ─────────────────────────────────────────────────────────────

    pub fn approve_plan(&self, confirmation_id: &str, session_id: &str) -> Result<()> {
        let orchestrator = self
            .orchestrator(session_id)
            .ok_or_else(|| anyhow!("no active orchestrator for session {session_id}"))?;
        if orchestrator.get_confirmation_id().as_deref() != Some(confirmation_id) {
            warn!(
                expected = ?orchestrator.get_confirmation_id(),
                got = confirmation_id,
                "confirmation id mismatch on approve"
            );
        }
        orchestrator.confirm_plan();
        self.audit(session_id, "approve", json!({"confirmation_id": confirmation_id}));
        Ok(())
    }

    pub fn reject_plan(&self, confirmation_id: &str, session_id: &str) -> Result<()> {
        let orchestrator = self
            .orchestrator(session_id)
            .ok_or_else(|| anyhow!("no active orchestrator for session {session_id}"))?;
        if orchestrator.get_confirmation_id().as_deref() != Some(confirmation_id) {
            warn!(
                expected = ?orchestrator.get_confirmation_id(),
                got = confirmation_id,
                "confirmation id mismatch on reject"
            );
        }
        orchestrator.reject_plan();
        self.audit(session_id, "reject", json!({"confirmation_id": confirmation_id}));
        Ok(())
    }

    pub fn update_plan(
        &self,
        confirmation_id: &str,
        plan: String,
        steps: Vec<String>,
        session_id: &str,
    ) -> Result<()> {
        let orchestrator = self
            .orchestrator(session_id)
            .ok_or_else(|| anyhow!("no active orchestrator for session {session_id}"))?;
        if orchestrator.get_confirmation_id().as_deref() != Some(confirmation_id) {
            warn!(
                expected = ?orchestrator.get_confirmation_id(),
                got = confirmation_id,
                "confirmation id mismatch on update"
            );
        }
        orchestrator.update_pending_plan(plan, steps);
        self.audit(session_id, "update_plan", json!({"confirmation_id": confirmation_id}));
        Ok(())
    }

    pub fn resolve_assistance(
        &self,
        assistance_id: &str,
        response: &str,
        session_id: &str,
    ) -> Result<()> {
        let orchestrator = self
            .orchestrator(session_id)
            .ok_or_else(|| anyhow!("no active orchestrator for session {session_id}"))?;
        orchestrator.resolve_user_assistance(assistance_id, response);
        self.audit(session_id, "assistance_response", json!({"assistance_id": assistance_id}));
        Ok(())
    }

    /// Stop in-flight work.  The orchestrator itself emits
    /// `workflow_stopped` with step/remaining detail; emitting a second copy
    /// here would break the single-terminal-event invariant.
    pub fn stop_generation(&self, session_id: &str) {
        match self.orchestrator(session_id) {
            Some(orchestrator) => {
                orchestrator.stop();
                self.audit(session_id, "stop", json!({}));
            }
            None => warn!(session_id, "stop requested but no orchestrator is active"),
        }
    }
}

fn status_name(status: ExecStatus) -> &'static str {
    match status {
        ExecStatus::Completed => "completed",
        ExecStatus::Rejected => "rejected",
        ExecStatus::Stopped => "stopped",
        ExecStatus::Timeout => "timeout",
        ExecStatus::Paused => "paused",
    }
}

fn simple_history(ctx: &ConversationContext) -> Vec<ChatMessage> {
    ctx.recent_messages(10)
        .iter()
        .filter_map(|turn| match turn.role {
            Role::User => Some(ChatMessage::user(turn.content.clone())),
            Role::Assistant => Some(ChatMessage::assistant(turn.content.clone())),
            Role::System => None,
        })
        .collect()
}
