//! Sandboxed code runner for model-generated data transformations.
//!
//! The model writes a short script in a small expression language; the
//! runner evaluates it against a JSON `data` binding and reads the final
//! `result` variable back out.  Isolation happens at the interpreter
//! boundary: there is no filesystem, network, or process surface, only the
//! whitelisted built-ins plus math/date/JSON helpers.
//!
//! Two limits bound execution: a wall-clock timeout (default 30 s) applied
//! around the blocking evaluation task, and an operation budget that stops
//! runaway loops the timeout cannot interrupt from outside the thread.

mod interp;

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use interp::{BUILTIN_NAMES, Program};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("unknown function '{0}' (only whitelisted helpers are available)")]
    UnknownFunction(String),
    #[error("operation budget exceeded ({0} ops)")]
    BudgetExceeded(u64),
    #[error("execution timeout after {0} seconds")]
    Timeout(u64),
}

/// Everything a script produced: the `result` variable (if assigned) and any
/// `print(...)` output in order.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub result: Option<Value>,
    pub printed: Vec<String>,
}

impl RunOutcome {
    /// Canonical text rendering fed back to the model.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ref result) = self.result {
            let rendered = serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string());
            parts.push(format!("Result:\n{rendered}"));
        }
        if !self.printed.is_empty() {
            parts.push(format!("Output:\n{}", self.printed.join("\n")));
        }
        if parts.is_empty() {
            parts.push(
                "Code executed successfully (no result returned; assign to the 'result' variable)"
                    .to_string(),
            );
        }
        parts.join("\n\n")
    }
}

#[derive(Debug, Clone)]
pub struct CodeRunner {
    timeout: Duration,
    max_ops: u64,
}

impl Default for CodeRunner {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), max_ops: 2_000_000 }
    }
}

impl CodeRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, ..Default::default() }
    }

    /// Parse and evaluate `code` with `data` bound as input.
    pub async fn run(&self, code: &str, data: Value) -> Result<RunOutcome, ExecError> {
        let program = Program::parse(code)?;
        let max_ops = self.max_ops;
        let timeout_secs = self.timeout.as_secs();

        let task = tokio::task::spawn_blocking(move || program.eval(data, max_ops));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => {
                let outcome = joined.map_err(|e| ExecError::Runtime(e.to_string()))??;
                debug!(printed = outcome.printed.len(), "code runner finished");
                Ok(outcome)
            }
            Err(_) => Err(ExecError::Timeout(timeout_secs)),
        }
    }
}
