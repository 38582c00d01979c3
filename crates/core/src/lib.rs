//! Orchestration core: task classification, planning, the step and ReAct
//! executors, and result analysis.
//!
//! The split mirrors the turn lifecycle.  A turn enters through the runtime's
//! agent wrapper, gets classified ([`TaskClassifier`]), and, when complex,
//! is driven by a [`StepOrchestrator`]: plan ([`Planner`]), gate on approval,
//! execute steps with streaming and tool calls, synthesize a final answer.
//! The [`ReActOrchestrator`] is the adaptive alternative for goals a linear
//! plan fits poorly; it shares the tool surface, the streaming contract, and
//! the stop protocol.

mod analyzer;
mod assist;
mod classifier;
mod gate;
mod planner;
pub mod prompts;
mod react;
mod step;

pub use analyzer::{Analysis, ResultAnalyzer};
pub use assist::{
    ASSISTANCE_MARKER, AssistanceRequest, CRITICAL_FAILURE_MARKER, parse_assistance_request,
    parse_user_selection,
};
pub use classifier::{TaskClassifier, TaskType};
pub use gate::{Gate, StopSignal};
pub use planner::{GeneratedPlan, PlanContext, Planner};
pub use react::{
    ActionRecord, Observation, ReActOrchestrator, ReActReport, ReActState, ReActStatus,
};
pub use step::{
    ExecStatus, ExecutionReport, OrchestratorMode, StepOrchestrator, StepRecord,
    TOOL_RESULT_EVENT_LIMIT,
};

use thiserror::Error;

/// Control-flow outcomes the orchestrators must keep distinct from real
/// failures.  Cancellation and timeouts are values, not panics.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("stopped by user")]
    Stopped,
    #[error("wait timed out")]
    Timeout,
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Truncate on a char boundary, appending an ellipsis when cut.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod truncate_tests {
    use super::truncate_chars;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_chars("hello", 10), "hello");
    }

    #[test]
    fn long_text_gets_ellipsis() {
        let out = truncate_chars("abcdefgh", 3);
        assert_eq!(out, "abc…");
    }

    #[test]
    fn multibyte_boundaries_are_respected() {
        let out = truncate_chars("привет мир", 6);
        assert_eq!(out, "привет…");
    }
}
