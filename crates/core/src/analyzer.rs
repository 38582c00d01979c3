use std::sync::Arc;

use maestro_llm::{ChatMessage, ChatRequest, LlmGateway, extract_json};
use maestro_tools::ToolCategory;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::react::{ActionRecord, Observation};
use crate::truncate_chars;

/// Result strings carrying these prefixes are failures regardless of what
/// the tool reported.
const ERROR_MARKERS: &[&str] = &["Error:", "Exception", "HttpError", "Traceback", "ОШИБКА", "Ошибка:"];

/// Structured verdict over one action's raw output.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub is_success: bool,
    pub is_goal_achieved: bool,
    pub is_error: bool,
    pub error_message: Option<String>,
    pub extracted_data: Option<Value>,
    /// Progress toward the goal in [0, 1].
    pub progress_toward_goal: f64,
}

#[derive(Debug, Deserialize)]
struct GoalJudgment {
    #[serde(default)]
    goal_achieved: bool,
    #[serde(default)]
    progress: f64,
}

/// Classifies action results and judges goal completion.  The error rules
/// are local string checks; the goal judgment asks a cheap model and
/// defaults to "not achieved" on any failure.
pub struct ResultAnalyzer {
    gateway: Arc<dyn LlmGateway>,
    fast_model: String,
}

impl ResultAnalyzer {
    pub fn new(gateway: Arc<dyn LlmGateway>, fast_model: impl Into<String>) -> Self {
        Self { gateway, fast_model: fast_model.into() }
    }

    /// Pure rule layer, shared with tests: error iff a known marker appears
    /// or a read-category tool produced nothing.
    pub fn detect_error(result: &str, category: Option<ToolCategory>) -> Option<String> {
        let trimmed = result.trim();
        for marker in ERROR_MARKERS {
            if trimmed.contains(marker) {
                return Some(truncate_chars(trimmed, 300));
            }
        }
        if trimmed.is_empty() && category == Some(ToolCategory::Read) {
            return Some("read tool returned an empty result".to_string());
        }
        None
    }

    pub async fn analyze(
        &self,
        action: &ActionRecord,
        result: &str,
        goal: &str,
        prior_observations: &[Observation],
    ) -> Analysis {
        let category = Some(maestro_tools::classify_category(&action.tool_name));

        if let Some(error_message) = Self::detect_error(result, category) {
            return Analysis {
                is_success: false,
                is_goal_achieved: false,
                is_error: true,
                error_message: Some(error_message),
                extracted_data: None,
                progress_toward_goal: 0.0,
            };
        }

        let extracted_data = serde_json::from_str::<Value>(result.trim()).ok();

        let (is_goal_achieved, progress) = self.judge_goal(result, goal, prior_observations).await;

        Analysis {
            is_success: true,
            is_goal_achieved,
            is_error: false,
            error_message: None,
            extracted_data,
            progress_toward_goal: progress.clamp(0.0, 1.0),
        }
    }

    /// LLM judgment over the accumulated observations.  Conservative: any
    /// failure means "not achieved yet".
    async fn judge_goal(
        &self,
        latest_result: &str,
        goal: &str,
        prior_observations: &[Observation],
    ) -> (bool, f64) {
        let mut history = String::new();
        for obs in prior_observations.iter().rev().take(5).rev() {
            history.push_str(&format!(
                "- {}: {}\n",
                obs.action.tool_name,
                truncate_chars(&obs.raw_result, 150)
            ));
        }
        if history.is_empty() {
            history.push_str("(none)\n");
        }

        let prompt = format!(
            "Goal: {goal}\n\nEarlier results:\n{history}\nLatest result:\n{}\n\n\
             Does the accumulated evidence satisfy the goal? Respond with JSON only:\n\
             {{\"goal_achieved\": true|false, \"progress\": 0.0-1.0}}",
            truncate_chars(latest_result, 800)
        );
        let messages = vec![
            ChatMessage::system(
                "You judge whether a goal is fully satisfied by the evidence. Be strict: \
                 partial progress is not achievement. Respond with JSON only.",
            ),
            ChatMessage::user(prompt),
        ];
        let chat = ChatRequest::new(messages).with_model(self.fast_model.clone());

        match self.gateway.chat(chat).await {
            Ok(response) => match extract_json::<GoalJudgment>(&response.content) {
                Some(judgment) => (judgment.goal_achieved, judgment.progress),
                None => {
                    warn!("goal judgment response was not parseable; assuming not achieved");
                    (false, 0.3)
                }
            },
            Err(err) => {
                warn!(?err, "goal judgment call failed; assuming not achieved");
                (false, 0.3)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_prefixes_are_detected() {
        for text in [
            "Error: not found",
            "Exception in handler",
            "HttpError 503 from backend",
            "some context then Error: deep failure",
        ] {
            assert!(ResultAnalyzer::detect_error(text, None).is_some(), "{text}");
        }
    }

    #[test]
    fn empty_read_result_is_an_error() {
        assert!(ResultAnalyzer::detect_error("", Some(ToolCategory::Read)).is_some());
        assert!(ResultAnalyzer::detect_error("   ", Some(ToolCategory::Read)).is_some());
    }

    #[test]
    fn empty_write_result_is_not_an_error() {
        assert!(ResultAnalyzer::detect_error("", Some(ToolCategory::Write)).is_none());
    }

    #[test]
    fn normal_output_passes() {
        assert!(ResultAnalyzer::detect_error("Found 5 emails from Anna", Some(ToolCategory::Read)).is_none());
    }

    #[test]
    fn error_message_is_truncated() {
        let long = format!("Error: {}", "x".repeat(1000));
        let detected = ResultAnalyzer::detect_error(&long, None).unwrap();
        assert!(detected.chars().count() <= 301);
    }
}
