use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Read/write classification, derived from the tool name.  Advisory: used
/// for UI badging and the analyzer's empty-result rule, never to gate
/// execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Read,
    Write,
}

const READ_VERBS: &[&str] = &["get", "list", "search", "read", "find", "fetch", "query", "lookup"];

/// Classify by the leading verb of a snake_case tool name.
pub fn classify_category(name: &str) -> ToolCategory {
    let verb = name.split('_').next().unwrap_or(name);
    if READ_VERBS.contains(&verb) {
        ToolCategory::Read
    } else {
        ToolCategory::Write
    }
}

/// Static metadata about a tool, used by the model to decide what to call
/// and by the planner to describe current capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments object.
    pub input_schema: Value,
    pub category: ToolCategory,
    /// Backend this tool belongs to ("email", "calendar", "sheets", ...).
    pub service: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The result returned after a tool runs.  `output` is the canonical string
/// rendering; `structured` carries the parsed value when the backend
/// returned JSON, for entity extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self { success: true, output: output.into(), structured: None }
    }

    pub fn structured(value: Value) -> Self {
        let output = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
        Self { success: true, output, structured: Some(value) }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, output: message.into(), structured: None }
    }
}

/// Trait implemented by every tool.  Tools must be reentrant: multiple
/// sessions may call the same instance concurrently.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, args: &Value) -> Result<ToolOutput>;
}

/// Central registry for all available tools.  Read-mostly and immutable
/// after startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.spec().name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Specs grouped by service, for capability prompts.
    pub fn specs_by_service(&self) -> HashMap<String, Vec<ToolSpec>> {
        let mut grouped: HashMap<String, Vec<ToolSpec>> = HashMap::new();
        for spec in self.list_specs() {
            grouped.entry(spec.service.clone()).or_default().push(spec);
        }
        grouped
    }
}

/// Build the OpenAI-shaped `tools` array passed to the gateway.
pub fn specs_to_tools_json(specs: &[ToolSpec]) -> Value {
    let items: Vec<Value> = specs
        .iter()
        .map(|s| {
            json!({
                "type": "function",
                "function": {
                    "name": s.name,
                    "description": s.description,
                    "parameters": s.input_schema,
                }
            })
        })
        .collect();
    json!(items)
}

// ── Read-path retry ──────────────────────────────────────────────────────────

/// Retry a read operation with exponential backoff and a small deterministic
/// jitter.  Belongs at the adapter boundary: the orchestrators above only
/// ever see the eventual success or the final failure.
pub async fn retry_read<T, F, Fut>(attempts: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = Duration::from_millis(200);
    let mut last_err = None;
    for attempt in 0..attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if attempt + 1 < attempts {
                    let jitter = Duration::from_millis(
                        (chrono::Utc::now().timestamp_subsec_millis() % 100) as u64,
                    );
                    warn!(attempt, ?err, "read operation failed; retrying");
                    tokio::time::sleep(delay + jitter).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry_read: no attempts made")))
}

pub mod builtins;
pub use builtins::{CodeRunnerTool, ServiceBridge, default_registry};

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod registry_tests {
    use super::*;

    struct DummyTool {
        name: String,
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.name.clone(),
                description: format!("Dummy tool: {}", self.name),
                input_schema: json!({"type": "object", "properties": {"input": {"type": "string"}}}),
                category: classify_category(&self.name),
                service: "test".to_string(),
                tags: vec![],
            }
        }
        async fn run(&self, _args: &Value) -> Result<ToolOutput> {
            Ok(ToolOutput::text(format!("ran {}", self.name)))
        }
    }

    #[test]
    fn empty_registry() {
        let reg = ToolRegistry::default();
        assert!(reg.list_specs().is_empty());
        assert!(reg.get("anything").is_none());
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::default();
        reg.register(Arc::new(DummyTool { name: "search_mail".into() }));
        reg.register(Arc::new(DummyTool { name: "send_mail".into() }));

        assert!(reg.get("search_mail").is_some());
        assert!(reg.get("send_mail").is_some());
        assert!(reg.get("delete_mail").is_none());
    }

    #[tokio::test]
    async fn run_registered_tool() {
        let mut reg = ToolRegistry::default();
        reg.register(Arc::new(DummyTool { name: "get_thing".into() }));

        let tool = reg.get("get_thing").unwrap();
        let out = tool.run(&json!({})).await.unwrap();
        assert!(out.success);
        assert_eq!(out.output, "ran get_thing");
    }

    #[test]
    fn category_classifier_covers_read_verbs() {
        for name in ["get_row", "list_events", "search_emails", "read_sheet", "find_file", "fetch_page", "query_sales", "lookup_user"] {
            assert_eq!(classify_category(name), ToolCategory::Read, "{name}");
        }
        for name in ["create_document", "send_email", "update_cell", "delete_event", "execute_code"] {
            assert_eq!(classify_category(name), ToolCategory::Write, "{name}");
        }
    }

    #[test]
    fn tools_json_shape() {
        let reg = {
            let mut reg = ToolRegistry::default();
            reg.register(Arc::new(DummyTool { name: "search_emails".into() }));
            reg
        };
        let tools = specs_to_tools_json(&reg.list_specs());
        let arr = tools.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["type"], "function");
        assert_eq!(arr[0]["function"]["name"], "search_emails");
        assert!(arr[0]["function"]["parameters"].is_object());
    }

    #[test]
    fn duplicate_name_get_returns_first_registered() {
        let mut reg = ToolRegistry::default();
        reg.register(Arc::new(DummyTool { name: "dup".into() }));
        reg.register(Arc::new(DummyTool { name: "dup".into() }));

        let dup_count = reg.list_specs().iter().filter(|s| s.name == "dup").count();
        assert_eq!(dup_count, 2, "both duplicates appear in list_specs");
        assert!(reg.get("dup").is_some());
    }

    #[tokio::test]
    async fn retry_read_succeeds_after_transient_failures() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<i32> = retry_read(3, move || {
            let calls = calls2.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient")
                }
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_read_returns_final_error() {
        let result: Result<i32> = retry_read(2, || async { anyhow::bail!("always down") }).await;
        assert!(result.unwrap_err().to_string().contains("always down"));
    }

    #[test]
    fn tool_output_constructors() {
        let ok = ToolOutput::structured(json!({"id": "x"}));
        assert!(ok.success);
        assert!(ok.structured.is_some());
        let err = ToolOutput::failure("boom");
        assert!(!err.success);
        assert_eq!(err.output, "boom");
    }
}
