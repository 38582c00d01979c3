//! Built-in tool adapters.
//!
//! Every external backend (mail, calendar, spreadsheets, documents,
//! presentations, file storage, the business-data backend, the project
//! tracker) is reached through a [`ServiceBridge`]: a uniform JSON-over-HTTP
//! hop to the service's bridge endpoint.  The vendor wire protocols live on
//! the far side of that hop; the tools here only declare names, input
//! schemas, and which bridge operation to invoke.
//!
//! The one local tool is [`CodeRunnerTool`], which executes model-generated
//! scripts in the sandboxed interpreter.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use maestro_config::ToolsConfig;
use maestro_exec::CodeRunner;

use crate::{Tool, ToolOutput, ToolRegistry, ToolSpec, classify_category};

// ── Service bridge ───────────────────────────────────────────────────────────

/// Uniform client for one backend's bridge endpoint.  `invoke` POSTs the
/// arguments object to `{base_url}/{op}` with the service token (if one is
/// on disk) as a bearer header.
#[derive(Debug, Clone)]
pub struct ServiceBridge {
    client: reqwest::Client,
    base_url: String,
    service: String,
    token_path: PathBuf,
}

impl ServiceBridge {
    pub fn new(base_url: impl Into<String>, service: impl Into<String>, token_dir: impl Into<PathBuf>) -> Self {
        let service = service.into();
        let token_path = token_dir.into().join(format!("{service}.token"));
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            service,
            token_path,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Token is read per call so a refreshed file takes effect immediately.
    fn token(&self) -> Option<String> {
        std::fs::read_to_string(&self.token_path)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    pub async fn invoke(&self, op: &str, args: &Value) -> Result<ToolOutput> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), op);
        let mut request = self.client.post(&url).json(args);
        if let Some(token) = self.token() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("{} bridge unreachable at {}", self.service, url))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            debug!(service = %self.service, op, %status, "bridge call failed");
            return Ok(ToolOutput::failure(format!(
                "Error: {} {op} failed ({status}): {body}",
                self.service
            )));
        }

        match serde_json::from_str::<Value>(&body) {
            Ok(value) => Ok(ToolOutput::structured(value)),
            Err(_) => Ok(ToolOutput::text(body)),
        }
    }
}

/// A declarative tool backed by one bridge operation.
pub struct BridgeTool {
    bridge: Arc<ServiceBridge>,
    name: &'static str,
    description: &'static str,
    input_schema: Value,
    tags: Vec<String>,
}

#[async_trait]
impl Tool for BridgeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.to_string(),
            description: self.description.to_string(),
            input_schema: self.input_schema.clone(),
            category: classify_category(self.name),
            service: self.bridge.service().to_string(),
            tags: self.tags.clone(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        self.bridge.invoke(self.name, args).await
    }
}

fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}))
}

fn bridge_tool<T: JsonSchema>(
    bridge: &Arc<ServiceBridge>,
    name: &'static str,
    description: &'static str,
    tags: &[&str],
) -> Arc<dyn Tool> {
    Arc::new(BridgeTool {
        bridge: bridge.clone(),
        name,
        description,
        input_schema: schema_value::<T>(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
    })
}

// ── Input schemas ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct SearchEmailsInput {
    /// Search query, e.g. "from:anna subject:invoice".
    query: String,
    /// Maximum number of messages to return (default 10).
    max_results: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct SendEmailInput {
    to: String,
    subject: String,
    body: String,
    cc: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct GetEmailInput {
    message_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct ListEventsInput {
    /// RFC 3339 lower bound.
    time_min: Option<String>,
    /// RFC 3339 upper bound.
    time_max: Option<String>,
    max_results: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct CreateEventInput {
    summary: String,
    /// RFC 3339 start time.
    start: String,
    /// RFC 3339 end time.
    end: String,
    attendees: Option<Vec<String>>,
    description: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct ReadSheetInput {
    spreadsheet_id: String,
    /// A1-notation range, e.g. "Sheet1!A1:D20".
    range: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct UpdateSheetValuesInput {
    spreadsheet_id: String,
    range: String,
    /// Row-major values to write.
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct CreateSpreadsheetInput {
    title: String,
    folder_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct CreateDocumentInput {
    title: String,
    /// Initial body text (markdown is preserved verbatim).
    content: Option<String>,
    folder_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct ReadDocumentInput {
    document_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct AppendDocumentInput {
    document_id: String,
    content: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct CreatePresentationInput {
    title: String,
    folder_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct AddSlideInput {
    presentation_id: String,
    title: String,
    body: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct SearchFilesInput {
    /// Free-text name/content query.
    query: String,
    /// Restrict to one folder.
    folder_id: Option<String>,
    max_results: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct ListFolderInput {
    folder_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct QueryBusinessDataInput {
    /// Entity set name, e.g. "Catalog_Products" or "Document_Sales".
    entity: String,
    /// OData-style filter expression.
    filter: Option<String>,
    /// Maximum rows (default 50).
    top: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct ListProjectsInput {
    /// Substring match on the project name.
    query: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
struct CreateProjectTaskInput {
    project_id: String,
    title: String,
    description: Option<String>,
    assignee: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ExecuteCodeInput {
    /// Script in the runner's expression language; assign the answer to
    /// `result`.
    code: String,
    /// Optional input available as the `data` variable.
    input_data: Option<Value>,
}

// ── Code runner tool ─────────────────────────────────────────────────────────

pub struct CodeRunnerTool {
    runner: CodeRunner,
}

impl CodeRunnerTool {
    pub fn new(timeout: Duration) -> Self {
        Self { runner: CodeRunner::new(timeout) }
    }
}

#[async_trait]
impl Tool for CodeRunnerTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "execute_code".to_string(),
            description: "Run a short script for data transformations and calculations. \
                          Whitelisted helpers only (math, strings, dates, JSON); no file or \
                          network access. Input is available as `data`; assign the answer to \
                          `result`."
                .to_string(),
            input_schema: schema_value::<ExecuteCodeInput>(),
            category: classify_category("execute_code"),
            service: "code".to_string(),
            tags: vec!["sandbox".to_string()],
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let input: ExecuteCodeInput = serde_json::from_value(args.clone())
            .context("execute_code: invalid arguments")?;
        match self.runner.run(&input.code, input.input_data.unwrap_or(json!({}))).await {
            Ok(outcome) => Ok(ToolOutput::text(outcome.render())),
            Err(err) => Ok(ToolOutput::failure(format!("Error: {err}"))),
        }
    }
}

// ── Default registry ─────────────────────────────────────────────────────────

/// Build the production registry from config.  Immutable after this returns.
pub fn default_registry(config: &ToolsConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    let token_dir = PathBuf::from(&config.token_dir);

    let email = Arc::new(ServiceBridge::new(&config.google_bridge_base_url, "email", token_dir.clone()));
    registry.register(bridge_tool::<SearchEmailsInput>(
        &email,
        "search_emails",
        "Search mailbox messages by query; returns sender, subject, date, and snippet per hit.",
        &["mail"],
    ));
    registry.register(bridge_tool::<GetEmailInput>(
        &email,
        "get_email",
        "Fetch one message in full by its id.",
        &["mail"],
    ));
    registry.register(bridge_tool::<SendEmailInput>(
        &email,
        "send_email",
        "Send an email. Use plain text; the subject and body are sent verbatim.",
        &["mail"],
    ));

    let calendar = Arc::new(ServiceBridge::new(&config.google_bridge_base_url, "calendar", token_dir.clone()));
    registry.register(bridge_tool::<ListEventsInput>(
        &calendar,
        "list_events",
        "List calendar events in a time window.",
        &["calendar"],
    ));
    registry.register(bridge_tool::<CreateEventInput>(
        &calendar,
        "create_event",
        "Create a calendar event with optional attendees.",
        &["calendar"],
    ));

    let sheets = Arc::new(ServiceBridge::new(&config.google_bridge_base_url, "sheets", token_dir.clone()));
    registry.register(bridge_tool::<ReadSheetInput>(
        &sheets,
        "read_sheet",
        "Read a range of cells from a spreadsheet.",
        &["sheets"],
    ));
    registry.register(bridge_tool::<UpdateSheetValuesInput>(
        &sheets,
        "update_sheet_values",
        "Write row-major values into a spreadsheet range.",
        &["sheets"],
    ));
    registry.register(bridge_tool::<CreateSpreadsheetInput>(
        &sheets,
        "create_spreadsheet",
        "Create a new spreadsheet, optionally inside a folder.",
        &["sheets"],
    ));

    let docs = Arc::new(ServiceBridge::new(&config.google_bridge_base_url, "docs", token_dir.clone()));
    registry.register(bridge_tool::<CreateDocumentInput>(
        &docs,
        "create_document",
        "Create a text document with optional initial content.",
        &["docs"],
    ));
    registry.register(bridge_tool::<ReadDocumentInput>(
        &docs,
        "read_document",
        "Read a document's full text.",
        &["docs"],
    ));
    registry.register(bridge_tool::<AppendDocumentInput>(
        &docs,
        "append_document",
        "Append text to the end of a document.",
        &["docs"],
    ));

    let slides = Arc::new(ServiceBridge::new(&config.google_bridge_base_url, "slides", token_dir.clone()));
    registry.register(bridge_tool::<CreatePresentationInput>(
        &slides,
        "create_presentation",
        "Create a new presentation.",
        &["slides"],
    ));
    registry.register(bridge_tool::<AddSlideInput>(
        &slides,
        "add_slide",
        "Append a slide with a title and optional body text.",
        &["slides"],
    ));

    let drive = Arc::new(ServiceBridge::new(&config.google_bridge_base_url, "workspace", token_dir.clone()));
    registry.register(bridge_tool::<SearchFilesInput>(
        &drive,
        "search_files",
        "Search file storage by name or content.",
        &["drive"],
    ));
    registry.register(bridge_tool::<ListFolderInput>(
        &drive,
        "list_folder",
        "List the files inside a folder.",
        &["drive"],
    ));

    if !config.business_data_base_url.is_empty() {
        let business = Arc::new(ServiceBridge::new(&config.business_data_base_url, "business", token_dir.clone()));
        registry.register(bridge_tool::<QueryBusinessDataInput>(
            &business,
            "query_business_data",
            "Query the business-data backend (entity sets with OData-style filters).",
            &["erp"],
        ));
    }

    if !config.project_tracker_base_url.is_empty() {
        let tracker = Arc::new(ServiceBridge::new(&config.project_tracker_base_url, "projects", token_dir));
        registry.register(bridge_tool::<ListProjectsInput>(
            &tracker,
            "list_projects",
            "List projects in the tracker.",
            &["projects"],
        ));
        registry.register(bridge_tool::<CreateProjectTaskInput>(
            &tracker,
            "create_project_task",
            "Create a task inside a tracker project.",
            &["projects"],
        ));
    }

    registry.register(Arc::new(CodeRunnerTool::new(Duration::from_secs(
        config.code_runner_timeout_secs.max(1),
    ))));

    registry
}
