//! The adaptive think → act → observe → adapt loop.
//!
//! Used when a rigid up-front plan fits the goal poorly.  Shares the tool
//! surface, the event stream, and the stop protocol with the step
//! orchestrator, but decides one action at a time and searches for an
//! alternative when an action fails.

use std::sync::Arc;

use maestro_llm::{ChatMessage, ChatRequest, LlmGateway, extract_json};
use maestro_session::{ConversationContext, EventBus, Role, StreamEvent};
use maestro_tools::ToolRegistry;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::analyzer::ResultAnalyzer;
use crate::gate::StopSignal;
use crate::truncate_chars;

/// Iteration budget.  Small on purpose: a goal that needs more than this
/// wants a plan, not a loop.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Cap on the tool listing included in planning prompts.
const TOOL_LISTING_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReActStatus {
    Thinking,
    Acting,
    Observing,
    Adapting,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    pub tool_name: String,
    pub arguments: Value,
    pub iteration: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub action: ActionRecord,
    pub raw_result: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub extracted_data: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ReasoningStep {
    pub iteration: u32,
    pub kind: &'static str,
    pub content: String,
}

/// All loop state; owned exclusively by one orchestrator instance and
/// destroyed with it.
pub struct ReActState {
    pub goal: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub status: ReActStatus,
    pub action_history: Vec<ActionRecord>,
    pub observations: Vec<Observation>,
    pub reasoning_trail: Vec<ReasoningStep>,
    pub alternatives_tried: Vec<String>,
}

impl ReActState {
    pub fn new(goal: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            goal: goal.into(),
            iteration: 0,
            max_iterations,
            status: ReActStatus::Thinking,
            action_history: Vec::new(),
            observations: Vec::new(),
            reasoning_trail: Vec::new(),
            alternatives_tried: Vec::new(),
        }
    }

    pub fn add_reasoning(&mut self, kind: &'static str, content: impl Into<String>) {
        self.reasoning_trail.push(ReasoningStep {
            iteration: self.iteration,
            kind,
            content: content.into(),
        });
    }

    pub fn add_action(&mut self, tool_name: impl Into<String>, arguments: Value) -> ActionRecord {
        let record = ActionRecord {
            tool_name: tool_name.into(),
            arguments,
            iteration: self.iteration,
        };
        self.action_history.push(record.clone());
        record
    }

    pub fn add_observation(&mut self, action: ActionRecord, raw_result: String) -> usize {
        self.observations.push(Observation {
            action,
            raw_result,
            success: true,
            error_message: None,
            extracted_data: None,
        });
        self.observations.len() - 1
    }
}

#[derive(Debug, Deserialize)]
struct PlannedAction {
    tool_name: String,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    description: String,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct AlternativeShape {
    #[serde(default)]
    alternative: Option<bool>,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    description: String,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReActReport {
    pub status: &'static str,
    pub iterations: u32,
    pub actions_taken: usize,
    pub final_result: Option<String>,
    pub error: Option<String>,
    pub alternatives_tried: Vec<String>,
}

pub struct ReActOrchestrator {
    bus: Arc<EventBus>,
    gateway: Arc<dyn LlmGateway>,
    registry: Arc<ToolRegistry>,
    analyzer: ResultAnalyzer,
    session_id: String,
    model_name: Option<String>,
    max_iterations: u32,
    stop: StopSignal,
}

impl ReActOrchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        gateway: Arc<dyn LlmGateway>,
        registry: Arc<ToolRegistry>,
        session_id: impl Into<String>,
        model_name: Option<String>,
        fast_model: impl Into<String>,
    ) -> Self {
        let analyzer = ResultAnalyzer::new(gateway.clone(), fast_model);
        Self {
            bus,
            gateway,
            registry,
            analyzer,
            session_id: session_id.into(),
            model_name,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            stop: StopSignal::new(),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn stop(&self) {
        info!(session_id = %self.session_id, "react stop requested");
        self.stop.trigger();
    }

    /// Events are dropped silently when no subscriber is attached, so the
    /// loop stays usable from batch jobs and tests.
    fn emit(&self, event: StreamEvent) {
        self.bus.send(&self.session_id, event);
    }

    pub async fn execute(
        &self,
        goal: &str,
        context: &Arc<AsyncMutex<ConversationContext>>,
    ) -> anyhow::Result<ReActReport> {
        let mut state = ReActState::new(goal, self.max_iterations);
        let open_files_block = {
            let ctx = context.lock().await;
            crate::prompts::open_files_section(&ctx.open_files)
        };
        self.emit(StreamEvent::ReactStart { goal: goal.to_string() });

        while state.iteration < state.max_iterations {
            if self.stop.is_stopped() {
                info!(iteration = state.iteration, "react loop stopped");
                break;
            }
            state.iteration += 1;

            // 1. THINK
            state.status = ReActStatus::Thinking;
            let thought = self.think(&state).await;
            state.add_reasoning("think", thought.clone());
            self.emit(StreamEvent::ReactThinking { thought: thought.clone(), iteration: state.iteration });

            if self.stop.is_stopped() {
                break;
            }

            // 2. PLAN one action
            state.status = ReActStatus::Acting;
            let planned = self.plan_action(&state, &thought, &open_files_block).await;

            if planned.tool_name.eq_ignore_ascii_case("finish") {
                info!("model signalled completion with FINISH");
                state.add_reasoning("plan", planned.reasoning.clone());
                self.emit(StreamEvent::ReactAction {
                    action: planned.description.clone(),
                    tool: "FINISH".to_string(),
                    params: json!({}),
                    iteration: state.iteration,
                });
                let summary = if planned.description.is_empty() {
                    "Goal achieved".to_string()
                } else {
                    planned.description
                };
                return Ok(self.finalize_success(&mut state, summary, context).await);
            }

            state.add_reasoning("plan", planned.reasoning.clone());
            self.emit(StreamEvent::ReactAction {
                action: planned.description.clone(),
                tool: planned.tool_name.clone(),
                params: planned.arguments.clone(),
                iteration: state.iteration,
            });

            if self.stop.is_stopped() {
                break;
            }

            // 3. ACT
            let action = state.add_action(planned.tool_name.clone(), planned.arguments.clone());
            let raw_result = self.act(&planned).await;

            // 4. OBSERVE
            state.status = ReActStatus::Observing;
            let obs_index = state.add_observation(action.clone(), raw_result.clone());
            self.emit(StreamEvent::ReactObservation {
                result: truncate_chars(&raw_result, 500),
                iteration: state.iteration,
            });

            let prior = &state.observations[..obs_index];
            let analysis = self.analyzer.analyze(&action, &raw_result, &state.goal, prior).await;
            {
                let observation = &mut state.observations[obs_index];
                observation.success = analysis.is_success;
                observation.error_message = analysis.error_message.clone();
                observation.extracted_data = analysis.extracted_data.clone();
            }
            state.add_reasoning(
                "observe",
                format!("progress {:.0}%", analysis.progress_toward_goal * 100.0),
            );

            // 5. ADAPT
            state.status = ReActStatus::Adapting;
            if analysis.is_goal_achieved {
                info!(iteration = state.iteration, "goal achieved");
                return Ok(self.finalize_success(&mut state, raw_result, context).await);
            }

            if analysis.is_error {
                match self.find_alternative(&state, &analysis).await {
                    Some(alternative) => {
                        let description = alternative.description.clone();
                        info!(%description, "trying alternative action");
                        state.alternatives_tried.push(description.clone());
                        state.add_reasoning("adapt", format!("alternative: {description}"));
                        self.emit(StreamEvent::ReactAdapting {
                            reason: analysis.error_message.clone().unwrap_or_else(|| "action failed".into()),
                            new_strategy: description,
                            iteration: state.iteration,
                        });
                    }
                    None => {
                        warn!("no alternatives available; failing gracefully");
                        return Ok(self.finalize_failure(
                            &mut state,
                            analysis.error_message.unwrap_or_else(|| "goal not reached".into()),
                        ));
                    }
                }
            } else {
                state.add_reasoning("adapt", "continuing with progress");
            }
        }

        if self.stop.is_stopped() {
            return Ok(ReActReport {
                status: "stopped",
                iterations: state.iteration,
                actions_taken: state.action_history.len(),
                final_result: None,
                error: None,
                alternatives_tried: state.alternatives_tried,
            });
        }

        warn!(max = state.max_iterations, "iteration budget exhausted");
        Ok(self.finalize_failure(&mut state, "iteration budget exhausted".to_string()))
    }

    /// Summarize the situation: the goal, the last five actions with
    /// success marks, the last three observation previews.
    async fn think(&self, state: &ReActState) -> String {
        let mut context_block = format!("Goal: {}\n\n", state.goal);
        if !state.action_history.is_empty() {
            context_block.push_str("Actions taken:\n");
            for (i, action) in state.action_history.iter().rev().take(5).rev().enumerate() {
                let mark = state
                    .observations
                    .iter()
                    .find(|o| o.action == *action)
                    .map(|o| if o.success { "✓" } else { "✗" })
                    .unwrap_or("?");
                context_block.push_str(&format!("{}. {mark} {}\n", i + 1, action.tool_name));
            }
        }
        if !state.observations.is_empty() {
            context_block.push_str("\nRecent results:\n");
            for obs in state.observations.iter().rev().take(3).rev() {
                context_block.push_str(&format!(
                    "- {}: {}\n",
                    obs.action.tool_name,
                    truncate_chars(&obs.raw_result, 200)
                ));
            }
        }

        let messages = vec![
            ChatMessage::system(
                "You analyze task progress and pick the next move. Be brief and concrete.",
            ),
            ChatMessage::user(format!(
                "{context_block}\nAnalyze the situation: what is done, what remains, and what \
                 single action would be most effective next? Answer in 2-3 sentences."
            )),
        ];
        let mut request = ChatRequest::new(messages);
        if let Some(ref model) = self.model_name {
            request = request.with_model(model.clone());
        }
        match self.gateway.chat(request).await {
            Ok(response) => response.content.trim().to_string(),
            Err(err) => {
                warn!(?err, "think call failed");
                format!("Assessing the situation (iteration {})", state.iteration)
            }
        }
    }

    /// Pick exactly one next action as strict JSON; `FINISH` means done.
    async fn plan_action(&self, state: &ReActState, thought: &str, open_files: &str) -> PlannedAction {
        let specs = self.registry.list_specs();
        let mut tool_listing = String::new();
        for spec in specs.iter().take(TOOL_LISTING_CAP) {
            tool_listing.push_str(&format!("- {}: {}\n", spec.name, spec.description));
        }

        let mut context_block = format!("Goal: {}\n\nCurrent analysis: {thought}\n\n", state.goal);
        if !state.action_history.is_empty() {
            context_block.push_str("Already done:\n");
            for action in state.action_history.iter().rev().take(3).rev() {
                context_block.push_str(&format!("- {}\n", action.tool_name));
            }
        }
        context_block.push_str(open_files);

        let prompt = format!(
            "{context_block}\nAvailable tools:\n{tool_listing}\n\
             Choose ONE tool and its arguments. Respond with JSON only:\n\
             {{\"tool_name\": \"...\", \"arguments\": {{...}}, \"description\": \"...\", \
             \"reasoning\": \"...\"}}\n\n\
             If the goal is fully achieved and no action is needed, use the special marker:\n\
             {{\"tool_name\": \"FINISH\", \"arguments\": {{}}, \"description\": \"what was \
             accomplished\", \"reasoning\": \"why the goal is complete\"}}",
        );

        let messages = vec![
            ChatMessage::system("You plan tool invocations. Respond with valid JSON only."),
            ChatMessage::user(prompt),
        ];
        let mut request = ChatRequest::new(messages);
        if let Some(ref model) = self.model_name {
            request = request.with_model(model.clone());
        }

        match self.gateway.chat(request).await {
            Ok(response) => match extract_json::<PlannedAction>(&response.content) {
                Some(planned) if !planned.tool_name.is_empty() => planned,
                _ => self.fallback_action("planner returned no usable action"),
            },
            Err(err) => self.fallback_action(&format!("planning call failed: {err}")),
        }
    }

    fn fallback_action(&self, reason: &str) -> PlannedAction {
        warn!(reason, "falling back to the first registered tool");
        let first = self.registry.list_specs().into_iter().next();
        match first {
            Some(spec) => PlannedAction {
                tool_name: spec.name.clone(),
                arguments: json!({}),
                description: format!("Fallback: invoke {}", spec.name),
                reasoning: reason.to_string(),
            },
            None => PlannedAction {
                tool_name: "FINISH".to_string(),
                arguments: json!({}),
                description: "No tools available".to_string(),
                reasoning: reason.to_string(),
            },
        }
    }

    /// Invoke the planned tool; exceptions become result text so the
    /// analyzer can classify them.
    async fn act(&self, planned: &PlannedAction) -> String {
        let Some(tool) = self.registry.get(&planned.tool_name) else {
            return format!("Error: tool not found: {}", planned.tool_name);
        };
        match tool.run(&planned.arguments).await {
            Ok(output) if output.success => output.output,
            Ok(output) => {
                if output.output.starts_with("Error") {
                    output.output
                } else {
                    format!("Error: {}", output.output)
                }
            }
            Err(err) => format!("Error: {err}"),
        }
    }

    /// Ask for one alternative after a failure.  `{"alternative": false}`
    /// or anything unparseable means there is none.
    async fn find_alternative(
        &self,
        state: &ReActState,
        analysis: &crate::analyzer::Analysis,
    ) -> Option<PlannedAction> {
        let specs = self.registry.list_specs();
        let mut tool_listing = String::new();
        for spec in specs.iter().take(TOOL_LISTING_CAP) {
            tool_listing.push_str(&format!("- {}: {}\n", spec.name, spec.description));
        }

        let mut failed = String::new();
        for action in state.action_history.iter().rev().take(3).rev() {
            failed.push_str(&format!("- {}\n", action.tool_name));
        }
        let tried = if state.alternatives_tried.is_empty() {
            "none".to_string()
        } else {
            state.alternatives_tried.join(", ")
        };

        let prompt = format!(
            "The previous action failed. Find an alternative way toward the goal.\n\n\
             Goal: {}\nError: {}\nFailed attempts:\n{failed}\nAlternatives already tried: {tried}\n\n\
             Available tools:\n{tool_listing}\n\
             Respond with JSON only:\n\
             {{\"tool_name\": \"...\", \"arguments\": {{...}}, \"description\": \"...\", \
             \"reasoning\": \"...\"}}\n\n\
             If there is no alternative, respond with {{\"alternative\": false}}.",
            state.goal,
            analysis.error_message.as_deref().unwrap_or("unknown"),
        );

        let messages = vec![
            ChatMessage::system("You find alternative approaches. Respond with valid JSON only."),
            ChatMessage::user(prompt),
        ];
        let mut request = ChatRequest::new(messages);
        if let Some(ref model) = self.model_name {
            request = request.with_model(model.clone());
        }

        let response = self.gateway.chat(request).await.ok()?;
        let shape = extract_json::<AlternativeShape>(&response.content)?;
        if shape.alternative == Some(false) {
            return None;
        }
        let tool_name = shape.tool_name?;
        Some(PlannedAction {
            tool_name,
            arguments: shape.arguments,
            description: shape.description,
            reasoning: shape.reasoning,
        })
    }

    async fn finalize_success(
        &self,
        state: &mut ReActState,
        final_result: String,
        context: &Arc<AsyncMutex<ConversationContext>>,
    ) -> ReActReport {
        state.status = ReActStatus::Done;
        self.emit(StreamEvent::ReactComplete { result: truncate_chars(&final_result, 1_000) });
        context
            .lock()
            .await
            .add_message(Role::Assistant, format!("Goal completed: {}", state.goal));
        info!(iterations = state.iteration, "react loop succeeded");
        ReActReport {
            status: "completed",
            iterations: state.iteration,
            actions_taken: state.action_history.len(),
            final_result: Some(final_result),
            error: None,
            alternatives_tried: state.alternatives_tried.clone(),
        }
    }

    fn finalize_failure(&self, state: &mut ReActState, reason: String) -> ReActReport {
        state.status = ReActStatus::Failed;
        self.emit(StreamEvent::ReactFailed {
            reason: reason.clone(),
            tried: state.alternatives_tried.clone(),
        });
        warn!(iterations = state.iteration, %reason, "react loop failed");
        ReActReport {
            status: "failed",
            iterations: state.iteration,
            actions_taken: state.action_history.len(),
            final_result: None,
            error: Some(reason),
            alternatives_tried: state.alternatives_tried.clone(),
        }
    }
}
