//! Front-door flows through the agent wrapper: the SIMPLE direct-stream
//! path, COMPLEX routing into the step orchestrator, and control routing
//! (approve / stop) against the active-orchestrator map.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use maestro_config::AppConfig;
use maestro_core::ExecStatus;
use maestro_llm::{ChatRequest, ChatResponse, ChatRole, LlmGateway, StreamFragment};
use maestro_runtime::{AgentWrapper, TurnResult};
use maestro_session::{EventBus, SessionStore, StreamEvent, Subscription};
use maestro_tools::ToolRegistry;

struct ScriptedGateway {
    route: Box<dyn Fn(&ChatRequest) -> ChatResponse + Send + Sync>,
}

impl ScriptedGateway {
    fn new(route: impl Fn(&ChatRequest) -> ChatResponse + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { route: Box::new(route) })
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        Ok((self.route)(&request))
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamFragment>,
    ) -> Result<ChatResponse> {
        let response = (self.route)(&request);
        let chars: Vec<char> = response.content.chars().collect();
        for chunk in chars.chunks(8) {
            let _ = tx.send(StreamFragment::Text(chunk.iter().collect())).await;
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

fn text(content: &str) -> ChatResponse {
    ChatResponse { content: content.to_string(), ..Default::default() }
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.server.subscriber_wait_secs = 1;
    config.server.gate_timeout_secs = 30;
    config.telemetry.audit_enabled = false;
    config
}

struct Rig {
    bus: Arc<EventBus>,
    store: Arc<SessionStore>,
    wrapper: Arc<AgentWrapper>,
}

fn rig(gateway: Arc<dyn LlmGateway>) -> Rig {
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(SessionStore::new());
    let wrapper = Arc::new(AgentWrapper::new(
        bus.clone(),
        store.clone(),
        gateway,
        Arc::new(ToolRegistry::default()),
        test_config(),
    ));
    Rig { bus, store, wrapper }
}

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

// ── S1: simple greeting ──────────────────────────────────────────────────────

#[tokio::test]
async fn greeting_streams_directly_without_planning() {
    let gateway = ScriptedGateway::new(|request| {
        let system = system_text(request);
        if system.contains("final user-facing answer") {
            text("Привет! Чем могу помочь?")
        } else {
            text("Привет! Я на связи.")
        }
    });
    let r = rig(gateway);
    let session_id = r.store.create();
    let mut subscription = r.bus.connect(&session_id);

    let result = r.wrapper.process_message("привет", &session_id, &[]).await.unwrap();
    match result {
        TurnResult::Simple { response } => assert!(response.contains("на связи")),
        other => panic!("expected simple turn, got {other:?}"),
    }

    let kinds = drain_kinds(&mut subscription);
    assert_eq!(kinds.first().map(String::as_str), Some("message"));
    assert!(kinds.contains(&"message_start".to_string()));
    assert!(kinds.iter().filter(|k| *k == "message_chunk").count() >= 1);
    assert!(kinds.contains(&"message_complete".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("final_result_complete"));
    assert!(!kinds.contains(&"plan_generated".to_string()));
    assert!(!kinds.contains(&"tool_call".to_string()));
}

#[tokio::test]
async fn empty_utterance_takes_the_simple_path() {
    let gateway = ScriptedGateway::new(|_| text("Слушаю вас."));
    let r = rig(gateway);
    let session_id = r.store.create();
    let mut subscription = r.bus.connect(&session_id);

    let result = r.wrapper.process_message("", &session_id, &[]).await.unwrap();
    assert!(matches!(result, TurnResult::Simple { .. }));

    let kinds = drain_kinds(&mut subscription);
    assert!(!kinds.contains(&"tool_call".to_string()));
    assert!(!kinds.contains(&"plan_generated".to_string()));
}

// ── COMPLEX routing with approval ────────────────────────────────────────────

#[tokio::test]
async fn complex_turn_routes_through_orchestrator_and_approval() {
    let gateway = ScriptedGateway::new(|request| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            text(&json!({"plan": "report then mail", "steps": ["собрать данные", "отправить письмо"]}).to_string())
        } else if system.contains("final answers") {
            text("Отчёт отправлен.")
        } else {
            text("done")
        }
    });
    let r = rig(gateway);
    let session_id = r.store.create();
    let mut subscription = r.bus.connect(&session_id);

    let wrapper = r.wrapper.clone();
    let session = session_id.clone();
    let handle = tokio::spawn(async move {
        wrapper.process_message("создай отчёт и отправь его", &session, &[]).await
    });

    let plan_event = wait_for_event(&mut subscription, "plan_generated", Duration::from_secs(5))
        .await
        .expect("plan_generated");
    let StreamEvent::PlanGenerated { confirmation_id, .. } = plan_event else {
        panic!("wrong payload");
    };
    wait_for_event(&mut subscription, "awaiting_confirmation", Duration::from_secs(5))
        .await
        .expect("awaiting_confirmation");

    r.wrapper.approve_plan(&confirmation_id, &session_id).unwrap();

    let result = handle.await.unwrap().unwrap();
    match result {
        TurnResult::Workflow(report) => {
            assert_eq!(report.status, ExecStatus::Completed);
            assert_eq!(report.steps.len(), 2);
        }
        other => panic!("expected workflow result, got {other:?}"),
    }

    // Terminal status removed the orchestrator; a second approve has no target.
    assert!(r.wrapper.approve_plan(&confirmation_id, &session_id).is_err());
}

#[tokio::test]
async fn new_message_displaces_previous_orchestrator() {
    let gateway = ScriptedGateway::new(|request| {
        let system = system_text(request);
        if system.contains("planning assistant") {
            text(&json!({"plan": "p", "steps": ["s1", "s2"]}).to_string())
        } else if system.contains("final answers") {
            text("итог")
        } else {
            text("x")
        }
    });
    let r = rig(gateway);
    let session_id = r.store.create();
    let mut subscription = r.bus.connect(&session_id);

    // First turn parks at the approval gate.
    let wrapper = r.wrapper.clone();
    let session = session_id.clone();
    let first = tokio::spawn(async move {
        wrapper.process_message("создай список дел и отправь", &session, &[]).await
    });
    wait_for_event(&mut subscription, "awaiting_confirmation", Duration::from_secs(5))
        .await
        .expect("first turn gate");

    // Second turn tears the first one down.
    let wrapper = r.wrapper.clone();
    let session = session_id.clone();
    let second = tokio::spawn(async move {
        wrapper.process_message("создай другой список и отправь", &session, &[]).await
    });

    let first_result = first.await.unwrap().unwrap();
    match first_result {
        TurnResult::Workflow(report) => assert_eq!(report.status, ExecStatus::Stopped),
        other => panic!("expected stopped workflow, got {other:?}"),
    }

    // Approve the second turn so it can finish.
    let plan_event = wait_for_event(&mut subscription, "plan_generated", Duration::from_secs(5))
        .await
        .expect("second plan");
    let StreamEvent::PlanGenerated { confirmation_id, .. } = plan_event else {
        panic!("wrong payload");
    };
    wait_for_event(&mut subscription, "awaiting_confirmation", Duration::from_secs(5))
        .await
        .expect("second turn gate");
    r.wrapper.approve_plan(&confirmation_id, &session_id).unwrap();

    let second_result = second.await.unwrap().unwrap();
    match second_result {
        TurnResult::Workflow(report) => assert_eq!(report.status, ExecStatus::Completed),
        other => panic!("expected completed workflow, got {other:?}"),
    }
}

#[tokio::test]
async fn stop_without_active_orchestrator_is_harmless() {
    let gateway = ScriptedGateway::new(|_| text("x"));
    let r = rig(gateway);
    let session_id = r.store.create();
    r.wrapper.stop_generation(&session_id);
}

#[tokio::test]
async fn unknown_session_is_rejected() {
    let gateway = ScriptedGateway::new(|_| text("x"));
    let r = rig(gateway);
    let err = r.wrapper.process_message("привет", "no-such-session", &[]).await.unwrap_err();
    assert!(err.to_string().contains("unknown session"));
}
