//! End-to-end orchestrator scenarios against a scripted gateway.
//!
//! The gateway routes on prompt shape (planning / step / closing / judge /
//! final-answer), so each test scripts model behavior without touching the
//! network.  A recording subscriber on the event bus checks the ordered
//! event contracts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use maestro_core::{
    ExecStatus, OrchestratorMode, ReActOrchestrator, StepOrchestrator,
};
use maestro_llm::{ChatRequest, ChatResponse, ChatRole, LlmGateway, StreamFragment, ToolCall};
use maestro_session::{ConversationContext, EventBus, StreamEvent, Subscription};
use maestro_tools::{Tool, ToolOutput, ToolRegistry, ToolSpec, classify_category};

// ── Harness ──────────────────────────────────────────────────────────────────

/// Routes each request to a response by inspecting the prompt.  `streaming`
/// distinguishes the streaming pass from the materialization pass.
type RouteFn = dyn Fn(&ChatRequest, bool) -> ChatResponse + Send + Sync;

struct ScriptedGateway {
    route: Box<RouteFn>,
    stream_delay: Duration,
}

impl ScriptedGateway {
    fn new(route: impl Fn(&ChatRequest, bool) -> ChatResponse + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { route: Box::new(route), stream_delay: Duration::from_millis(0) })
    }

    fn with_delay(
        route: impl Fn(&ChatRequest, bool) -> ChatResponse + Send + Sync + 'static,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self { route: Box::new(route), stream_delay: delay })
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        Ok((self.route)(&request, false))
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamFragment>,
    ) -> Result<ChatResponse> {
        let response = (self.route)(&request, true);
        if !response.thinking.is_empty() {
            let _ = tx.send(StreamFragment::Thinking(response.thinking.clone())).await;
        }
        // Two chunks so chunk ordering is observable.
        let content = response.content.clone();
        let mid = content.chars().count() / 2;
        let (a, b): (String, String) = {
            let mut chars = content.chars();
            let first: String = chars.by_ref().take(mid).collect();
            (first, chars.collect())
        };
        for part in [a, b] {
            if !part.is_empty() {
                if !self.stream_delay.is_zero() {
                    tokio::time::sleep(self.stream_delay).await;
                }
                let _ = tx.send(StreamFragment::Text(part)).await;
            }
        }
        Ok(response)
    }
}

fn system_text(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .filter_map(|m| m.content.clone())
        .collect::<Vec<_>>()
        .join("\n")
}

fn has_tool_results(request: &ChatRequest) -> bool {
    request.messages.iter().any(|m| m.role == ChatRole::Tool)
}

fn text(content: &str) -> ChatResponse {
    ChatResponse { content: content.to_string(), ..Default::default() }
}

struct StubTool {
    name: &'static str,
    service: &'static str,
    result: Value,
}

#[async_trait]
impl Tool for StubTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.to_string(),
            description: format!("stub {}", self.name),
            input_schema: json!({"type": "object"}),
            category: classify_category(self.name),
            service: self.service.to_string(),
            tags: vec![],
        }
    }

    async fn run(&self, _args: &Value) -> Result<ToolOutput> {
        Ok(ToolOutput::structured(self.result.clone()))
    }
}

fn registry_with(tools: Vec<StubTool>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::default();
    for tool in tools {
        registry.register(Arc::new(tool));
    }
    Arc::new(registry)
}

fn orchestrator(
    bus: &Arc<EventBus>,
    gateway: Arc<dyn LlmGateway>,
    registry: Arc<ToolRegistry>,
    session_id: &str,
    gate_timeout: Duration,
) -> Arc<StepOrchestrator> {
    Arc::new(StepOrchestrator::new(
        bus.clone(),
        gateway,
        registry,
        session_id,
        None,
        false,
        None,
        gate_timeout,
    ))
}

fn new_context() -> Arc<AsyncMutex<ConversationContext>> {
    Arc::new(AsyncMutex::new(ConversationContext::new()))
}

/// Drain everything currently buffered.
fn drain_kinds(subscription: &mut Subscription) -> Vec<String> {
    let mut kinds = Vec::new();
    while let Ok(envelope) = subscription.receiver.try_recv() {
        kinds.push(envelope.event.kind().to_string());
    }
    kinds
}

async fn wait_for_event(
    subscription: &mut Subscription,
    kind: &str,
    budget: Duration,
) -> Option<StreamEvent> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, subscription.receiver.recv()).await {
            Ok(Some(envelope)) => {
                if envelope.event.kind() == kind {
                    return Some(envelope.event);
                }
            }
            _ => return None,
        }
    }
}

fn plan_json(plan: &str, steps: &[&str]) -> String {
    json!({"plan": plan, "steps": steps}).to_string()
}

// ── S2: single-step fast path ────────────────────────────────────────────────

#[tokio::test]
async fn single_step_fast_path_skips_plan_and_approval() {
    let gateway = ScriptedGateway::new(|request, streaming| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            ChatResponse {
                thinking: "one action suffices".into(),
                content: plan_json("Create the document", &["Создать README.md"]),
                ..Default::default()
            }
        } else if has_tool_results(request) {
            text("README.md created with id doc-1.")
        } else if system.contains("executing one step") && !streaming {
            ChatResponse {
                tool_calls: vec![ToolCall {
                    id: "call_1".into(),
                    name: "create_document".into(),
                    arguments: json!({"title": "README.md"}),
                }],
                finish_reason: "tool_calls".into(),
                ..Default::default()
            }
        } else {
            text("Creating the document now.")
        }
    });

    let registry = registry_with(vec![StubTool {
        name: "create_document",
        service: "docs",
        result: json!({"document_id": "doc-1", "title": "README.md"}),
    }]);
    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s2");
    let context = new_context();

    let orch = orchestrator(&bus, gateway, registry, "s2", Duration::from_secs(300));
    let report = orch
        .execute("создай файл README.md", OrchestratorMode::PlanAndConfirm, &context, &[])
        .await
        .unwrap();

    assert_eq!(report.status, ExecStatus::Completed);
    assert_eq!(report.steps.len(), 1);

    let kinds = drain_kinds(&mut subscription);
    assert!(kinds.contains(&"plan_thinking_complete".to_string()));
    assert!(!kinds.contains(&"plan_generated".to_string()), "fast path must not emit the plan");
    assert!(!kinds.contains(&"awaiting_confirmation".to_string()));
    assert!(kinds.contains(&"step_start".to_string()));
    assert!(kinds.contains(&"tool_call".to_string()));
    assert!(kinds.contains(&"tool_result".to_string()));
    assert!(kinds.contains(&"step_complete".to_string()));
    // Terminal ordering: final_result_complete is last.
    assert_eq!(kinds.last().map(String::as_str), Some("final_result_complete"));

    // Entity memory picked up the created document.
    let ctx = context.lock().await;
    assert!(ctx.entity_context_string().contains("doc-1"));
}

// ── S3: multi-step with approval ─────────────────────────────────────────────

#[tokio::test]
async fn multi_step_approval_flow_runs_all_steps() {
    let gateway = ScriptedGateway::new(|request, _| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            text(&plan_json(
                "Report and mail it",
                &["Собрать данные о продажах", "Составить отчёт", "Отправить на почту"],
            ))
        } else if system.contains("executing one step") {
            text("step work done")
        } else if system.contains("final answers") {
            text("Отчёт готов и отправлен.")
        } else {
            text("ok")
        }
    });

    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s3");
    let context = new_context();
    let registry = Arc::new(ToolRegistry::default());

    let orch = orchestrator(&bus, gateway, registry, "s3", Duration::from_secs(300));
    let orch2 = orch.clone();
    let context2 = context.clone();
    let handle = tokio::spawn(async move {
        orch2
            .execute(
                "составь отчёт по продажам за июнь и отправь на почту",
                OrchestratorMode::PlanAndConfirm,
                &context2,
                &[],
            )
            .await
    });

    // Approve once the gate event arrives.
    let plan_event = wait_for_event(&mut subscription, "plan_generated", Duration::from_secs(5))
        .await
        .expect("plan_generated");
    let StreamEvent::PlanGenerated { steps, confirmation_id, .. } = plan_event else {
        panic!("wrong event payload");
    };
    assert_eq!(steps.len(), 3);
    assert!(!confirmation_id.is_empty());
    wait_for_event(&mut subscription, "awaiting_confirmation", Duration::from_secs(5))
        .await
        .expect("awaiting_confirmation");
    orch.confirm_plan();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status, ExecStatus::Completed);
    assert_eq!(report.steps.len(), 3);

    let kinds = drain_kinds(&mut subscription);
    let step_starts = kinds.iter().filter(|k| *k == "step_start").count();
    let step_completes = kinds.iter().filter(|k| *k == "step_complete").count();
    assert_eq!(step_starts, 3);
    assert_eq!(step_completes, 3);
    assert!(kinds.contains(&"workflow_complete".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("final_result_complete"));

    // The pending confirmation was consumed.
    assert_eq!(context.lock().await.pending_confirmation_count(), 0);
}

#[tokio::test]
async fn rejecting_the_plan_stops_before_any_step() {
    let gateway = ScriptedGateway::new(|request, _| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            text(&plan_json("p", &["a", "b"]))
        } else {
            text("should never execute")
        }
    });

    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s-reject");
    let context = new_context();
    let orch = orchestrator(&bus, gateway, Arc::new(ToolRegistry::default()), "s-reject", Duration::from_secs(300));
    let orch2 = orch.clone();
    let context2 = context.clone();
    let handle = tokio::spawn(async move {
        orch2.execute("сделай а и б", OrchestratorMode::PlanAndConfirm, &context2, &[]).await
    });

    wait_for_event(&mut subscription, "awaiting_confirmation", Duration::from_secs(5))
        .await
        .expect("awaiting_confirmation");
    orch.reject_plan();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status, ExecStatus::Rejected);

    let kinds = drain_kinds(&mut subscription);
    assert!(!kinds.contains(&"step_start".to_string()));
    assert!(kinds.contains(&"error".to_string()));
}

#[tokio::test]
async fn approval_timeout_discards_the_plan() {
    let gateway = ScriptedGateway::new(|request, _| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            text(&plan_json("p", &["a", "b"]))
        } else {
            text("unused")
        }
    });

    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s-timeout");
    let context = new_context();
    // Short gate so the test runs in real time.
    let orch = orchestrator(&bus, gateway, Arc::new(ToolRegistry::default()), "s-timeout", Duration::from_millis(700));

    let report = orch
        .execute("сделай а и б", OrchestratorMode::PlanAndConfirm, &context, &[])
        .await
        .unwrap();
    assert_eq!(report.status, ExecStatus::Timeout);

    let kinds = drain_kinds(&mut subscription);
    assert!(kinds.contains(&"error".to_string()));
    assert!(!kinds.contains(&"step_start".to_string()));
    assert_eq!(context.lock().await.pending_confirmation_count(), 0);
}

// ── Instant mode skips the gate ──────────────────────────────────────────────

#[tokio::test]
async fn instant_mode_executes_without_confirmation() {
    let gateway = ScriptedGateway::new(|request, _| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            text(&plan_json("p", &["шаг один", "шаг два"]))
        } else if system.contains("final answers") {
            text("готово")
        } else {
            text("done")
        }
    });

    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s-instant");
    let context = new_context();
    let orch = orchestrator(&bus, gateway, Arc::new(ToolRegistry::default()), "s-instant", Duration::from_secs(300));

    let report = orch
        .execute("сделай раз и два", OrchestratorMode::PlanAndExecute, &context, &[])
        .await
        .unwrap();
    assert_eq!(report.status, ExecStatus::Completed);

    let kinds = drain_kinds(&mut subscription);
    assert!(kinds.contains(&"plan_generated".to_string()));
    assert!(!kinds.contains(&"awaiting_confirmation".to_string()));
}

// ── Plan update before approval ──────────────────────────────────────────────

#[tokio::test]
async fn updated_plan_is_the_one_executed() {
    let gateway = ScriptedGateway::new(|request, _| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            text(&plan_json("original", &["old step 1", "old step 2"]))
        } else if system.contains("final answers") {
            text("summary")
        } else {
            text("done")
        }
    });

    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s-update");
    let context = new_context();
    let orch = orchestrator(&bus, gateway, Arc::new(ToolRegistry::default()), "s-update", Duration::from_secs(300));
    let orch2 = orch.clone();
    let context2 = context.clone();
    let handle = tokio::spawn(async move {
        orch2.execute("сделай кое-что из двух шагов", OrchestratorMode::PlanAndConfirm, &context2, &[]).await
    });

    wait_for_event(&mut subscription, "awaiting_confirmation", Duration::from_secs(5))
        .await
        .expect("awaiting_confirmation");
    orch.update_pending_plan(
        "edited".to_string(),
        vec!["new step A".to_string(), "new step B".to_string(), "new step C".to_string()],
    );
    let updated = wait_for_event(&mut subscription, "plan_updated", Duration::from_secs(5))
        .await
        .expect("plan_updated");
    let StreamEvent::PlanUpdated { steps, .. } = updated else { panic!("wrong payload") };
    assert_eq!(steps.len(), 3);

    orch.confirm_plan();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status, ExecStatus::Completed);
    assert_eq!(report.steps.len(), 3);
    assert_eq!(report.steps[0].title, "new step A");
}

// ── S4: stop mid-execution ───────────────────────────────────────────────────

#[tokio::test]
async fn stop_during_step_two_cuts_the_stream() {
    let gateway = ScriptedGateway::with_delay(
        |request, _| {
            let system = system_text(request);
            if system.contains("planning assistant") {
                text(&plan_json("p", &["шаг 1", "шаг 2", "шаг 3"]))
            } else {
                text("streamed step output that takes a while to arrive")
            }
        },
        Duration::from_millis(150),
    );

    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s4");
    let context = new_context();
    let orch = orchestrator(&bus, gateway, Arc::new(ToolRegistry::default()), "s4", Duration::from_secs(300));
    let orch2 = orch.clone();
    let context2 = context.clone();
    let handle = tokio::spawn(async move {
        orch2.execute("сделай три шага", OrchestratorMode::PlanAndExecute, &context2, &[]).await
    });

    // Stop while step 2 is streaming.
    let mut seen_step2 = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(5), subscription.receiver.recv()).await {
            Ok(Some(envelope)) => {
                if let StreamEvent::StepStart { step: 2, .. } = envelope.event {
                    seen_step2 = true;
                    orch.stop();
                    break;
                }
            }
            _ => break,
        }
    }
    assert!(seen_step2, "step 2 never started");

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status, ExecStatus::Stopped);

    // After the stop, no further content events; workflow_stopped closes the turn.
    let mut kinds = Vec::new();
    while let Ok(envelope) = subscription.receiver.try_recv() {
        kinds.push((envelope.event.kind().to_string(), envelope.event.clone()));
    }
    let stopped_pos = kinds.iter().position(|(k, _)| k == "workflow_stopped").expect("workflow_stopped");
    for (kind, event) in &kinds[stopped_pos + 1..] {
        assert!(!event.is_content(), "content event {kind} after stop");
    }
    match &kinds[stopped_pos].1 {
        StreamEvent::WorkflowStopped { step, remaining_steps, .. } => {
            assert_eq!(*step, 2);
            assert_eq!(*remaining_steps, 1);
        }
        other => panic!("unexpected payload {other:?}"),
    }
    assert!(!kinds[stopped_pos + 1..].iter().any(|(k, _)| k.starts_with("step_")));
}

#[tokio::test]
async fn double_stop_matches_single_stop() {
    let gateway = ScriptedGateway::new(|request, _| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            text(&plan_json("p", &["a", "b"]))
        } else {
            text("x")
        }
    });

    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s-double-stop");
    let context = new_context();
    let orch = orchestrator(&bus, gateway, Arc::new(ToolRegistry::default()), "s-double-stop", Duration::from_secs(300));
    orch.stop();
    orch.stop();

    let report = orch
        .execute("сделай а и б", OrchestratorMode::PlanAndExecute, &context, &[])
        .await
        .unwrap();
    assert_eq!(report.status, ExecStatus::Stopped);

    let kinds = drain_kinds(&mut subscription);
    let stopped = kinds.iter().filter(|k| *k == "workflow_stopped").count();
    assert_eq!(stopped, 1, "exactly one workflow_stopped regardless of stop() count");
}

// ── S5: user assistance ──────────────────────────────────────────────────────

#[tokio::test]
async fn assistance_request_pauses_and_resumes_with_selection() {
    let marker_payload = format!(
        "I found three matching files.\n🔍 USER ASSISTANCE REQUEST\n{}",
        json!({
            "question": "Which file did you mean?",
            "options": [
                {"id": "1", "label": "Report-v1.xlsx"},
                {"id": "2", "label": "Report-final.xlsx"},
                {"id": "3", "label": "Report-old.xlsx"}
            ],
            "context": {}
        })
    );
    let marker_payload2 = marker_payload.clone();

    let gateway = ScriptedGateway::new(move |request, _| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            text(&plan_json("p", &["найти файл", "обновить файл"]))
        } else if system.contains("executing one step") {
            let is_first_step = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == ChatRole::User)
                .and_then(|m| m.content.clone())
                .map(|c| c.contains("(1 of 2)"))
                .unwrap_or(false);
            if is_first_step { text(&marker_payload2) } else { text("updated the chosen file") }
        } else if system.contains("final answers") {
            text("Файл обновлён.")
        } else {
            text("ok")
        }
    });

    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s5");
    let context = new_context();
    let orch = orchestrator(&bus, gateway, Arc::new(ToolRegistry::default()), "s5", Duration::from_secs(300));
    let orch2 = orch.clone();
    let context2 = context.clone();
    let handle = tokio::spawn(async move {
        orch2.execute("обнови таблицу с отчётом", OrchestratorMode::PlanAndExecute, &context2, &[]).await
    });

    let event = wait_for_event(&mut subscription, "user_assistance_request", Duration::from_secs(5))
        .await
        .expect("user_assistance_request");
    let StreamEvent::UserAssistanceRequest { assistance_id, options, context: payload, .. } = event
    else {
        panic!("wrong payload")
    };
    assert_eq!(options.len(), 3);
    assert_eq!(payload["step"], 1);
    assert_eq!(orch.get_user_assistance_id().as_deref(), Some(assistance_id.as_str()));

    // Resolve with an ordinal word; option index 1 is appended to the step.
    orch.resolve_user_assistance(&assistance_id, "second");

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status, ExecStatus::Completed);
    assert!(report.steps[0].result.contains("Report-final.xlsx"));
}

// ── Critical failure pauses the workflow ─────────────────────────────────────

#[tokio::test]
async fn critical_failure_marker_pauses_remaining_steps() {
    let gateway = ScriptedGateway::new(|request, _| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            text(&plan_json("p", &["first", "second", "third"]))
        } else if system.contains("executing one step") {
            text("🛑 USER HELP REQUIRED: the mailbox token expired")
        } else {
            text("unused")
        }
    });

    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s-pause");
    let context = new_context();
    let orch = orchestrator(&bus, gateway, Arc::new(ToolRegistry::default()), "s-pause", Duration::from_secs(300));

    let report = orch
        .execute("сделай три вещи", OrchestratorMode::PlanAndExecute, &context, &[])
        .await
        .unwrap();
    assert_eq!(report.status, ExecStatus::Paused);
    assert_eq!(report.steps.len(), 1);

    let kinds = drain_kinds(&mut subscription);
    assert_eq!(kinds.iter().filter(|k| *k == "step_start").count(), 1);
    assert_eq!(kinds.last().map(String::as_str), Some("workflow_paused"));
}

// ── Final-answer reuse ───────────────────────────────────────────────────────

#[tokio::test]
async fn generative_request_reuses_last_step_without_summarizer() {
    let gateway = ScriptedGateway::new(|request, _| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            text(&plan_json("p", &["draft the poem", "polish the poem"]))
        } else if system.contains("final answers") {
            panic!("summarizer must not run for generative requests");
        } else {
            text("Роза красная, фиалка синяя…")
        }
    });

    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s-reuse");
    let context = new_context();
    let orch = orchestrator(&bus, gateway, Arc::new(ToolRegistry::default()), "s-reuse", Duration::from_secs(300));

    let report = orch
        .execute("напиши стихотворение и доработай его", OrchestratorMode::PlanAndExecute, &context, &[])
        .await
        .unwrap();
    assert_eq!(report.status, ExecStatus::Completed);
    assert_eq!(report.result.as_deref(), Some("Роза красная, фиалка синяя…"));

    let kinds = drain_kinds(&mut subscription);
    assert!(kinds.contains(&"final_result_complete".to_string()));
    assert!(!kinds.contains(&"final_result_chunk".to_string()), "no streaming when reusing");
}

// ── Tool result truncation ───────────────────────────────────────────────────

#[tokio::test]
async fn oversized_tool_result_is_truncated_on_the_event_only() {
    let big = "x".repeat(5_000);
    let big2 = big.clone();
    let gateway = ScriptedGateway::new(move |request, streaming| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            text(&plan_json("p", &["прочитать данные"]))
        } else if has_tool_results(request) {
            text("done reading")
        } else if system.contains("executing one step") && !streaming {
            ChatResponse {
                tool_calls: vec![ToolCall {
                    id: "call_big".into(),
                    name: "read_sheet".into(),
                    arguments: json!({"range": "A:Z"}),
                }],
                finish_reason: "tool_calls".into(),
                ..Default::default()
            }
        } else {
            text("reading")
        }
    });

    let registry = registry_with(vec![StubTool {
        name: "read_sheet",
        service: "sheets",
        result: json!({"values": big2}),
    }]);
    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s-trunc");
    let context = new_context();
    let orch = orchestrator(&bus, gateway, registry, "s-trunc", Duration::from_secs(300));

    let report = orch
        .execute("прочитай данные 123", OrchestratorMode::PlanAndExecute, &context, &[])
        .await
        .unwrap();
    assert_eq!(report.status, ExecStatus::Completed);

    let mut tool_result_text = None;
    while let Ok(envelope) = subscription.receiver.try_recv() {
        if let StreamEvent::ToolResult { result, .. } = envelope.event {
            tool_result_text = Some(result);
        }
    }
    let event_text = tool_result_text.expect("tool_result event");
    assert!(event_text.contains("result truncated"));
    assert!(event_text.chars().count() < 2_200);
    // The step (and thus the model) kept the full result.
    assert!(report.steps[0].result.len() > 4_000);
}

// ── S6: ReAct success ────────────────────────────────────────────────────────

#[tokio::test]
async fn react_achieves_goal_in_one_iteration() {
    let gateway = ScriptedGateway::new(|request, _| {
        let system = system_text(request);
        if system.contains("plan tool invocations") {
            text(
                &json!({
                    "tool_name": "search_emails",
                    "arguments": {"query": "from:X", "max_results": 5},
                    "description": "search the mailbox",
                    "reasoning": "the goal asks for recent emails"
                })
                .to_string(),
            )
        } else if system.contains("judge whether a goal") {
            text(r#"{"goal_achieved": true, "progress": 1.0}"#)
        } else if system.contains("analyze task progress") {
            text("Nothing done yet. Search the mailbox first.")
        } else {
            text("ok")
        }
    });

    let registry = registry_with(vec![StubTool {
        name: "search_emails",
        service: "email",
        result: json!({"messages": [{"message_id": "m1", "subject": "hi"}], "count": 5}),
    }]);
    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s6");
    let context = new_context();

    let react = ReActOrchestrator::new(
        bus.clone(),
        gateway,
        registry,
        "s6",
        None,
        "fast-model",
    );
    let report = react
        .execute("получить список последних 5 писем от X", &context)
        .await
        .unwrap();

    assert_eq!(report.status, "completed");
    assert_eq!(report.iterations, 1);

    let kinds = drain_kinds(&mut subscription);
    for expected in ["react_start", "react_thinking", "react_action", "react_observation", "react_complete"] {
        assert!(kinds.contains(&expected.to_string()), "missing {expected}");
    }
    assert!(!kinds.contains(&"react_failed".to_string()));
}

#[tokio::test]
async fn react_exhausts_iteration_budget_and_fails() {
    let gateway = ScriptedGateway::new(|request, _| {
        let system = system_text(request);
        if system.contains("plan tool invocations") {
            text(
                &json!({
                    "tool_name": "search_emails",
                    "arguments": {},
                    "description": "keep searching",
                    "reasoning": "still looking"
                })
                .to_string(),
            )
        } else if system.contains("judge whether a goal") {
            text(r#"{"goal_achieved": false, "progress": 0.2}"#)
        } else {
            text("thinking")
        }
    });

    let registry = registry_with(vec![StubTool {
        name: "search_emails",
        service: "email",
        result: json!({"messages": []}),
    }]);
    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s6-budget");
    let context = new_context();

    let react = ReActOrchestrator::new(bus.clone(), gateway, registry, "s6-budget", None, "fast")
        .with_max_iterations(3);
    let report = react.execute("недостижимая цель", &context).await.unwrap();

    assert_eq!(report.status, "failed");
    assert_eq!(report.iterations, 3);
    assert_eq!(report.error.as_deref(), Some("iteration budget exhausted"));

    let kinds = drain_kinds(&mut subscription);
    assert_eq!(kinds.last().map(String::as_str), Some("react_failed"));
}

#[tokio::test]
async fn react_tries_alternative_after_error_then_fails_gracefully() {
    let gateway = ScriptedGateway::new(|request, _| {
        let system = system_text(request);
        if system.contains("plan tool invocations") {
            text(
                &json!({
                    "tool_name": "query_business_data",
                    "arguments": {"entity": "Sales"},
                    "description": "query the backend",
                    "reasoning": "data lives there"
                })
                .to_string(),
            )
        } else if system.contains("alternative approaches") {
            // First ask yields one alternative; afterwards there is none.
            text(r#"{"alternative": false}"#)
        } else if system.contains("judge whether a goal") {
            text(r#"{"goal_achieved": false, "progress": 0.0}"#)
        } else {
            text("analysis")
        }
    });

    struct FailingTool;
    #[async_trait]
    impl Tool for FailingTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "query_business_data".into(),
                description: "always fails".into(),
                input_schema: json!({"type": "object"}),
                category: classify_category("query_business_data"),
                service: "business".into(),
                tags: vec![],
            }
        }
        async fn run(&self, _args: &Value) -> Result<ToolOutput> {
            Ok(ToolOutput::failure("Error: backend is unreachable"))
        }
    }

    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(FailingTool));
    let bus = Arc::new(EventBus::new());
    let mut subscription = bus.connect("s-react-alt");
    let context = new_context();

    let react = ReActOrchestrator::new(bus.clone(), gateway, Arc::new(registry), "s-react-alt", None, "fast");
    let report = react.execute("получить данные о продажах", &context).await.unwrap();

    assert_eq!(report.status, "failed");
    assert!(report.error.as_deref().unwrap_or_default().contains("unreachable"));

    let kinds = drain_kinds(&mut subscription);
    assert!(kinds.contains(&"react_observation".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("react_failed"));
}
