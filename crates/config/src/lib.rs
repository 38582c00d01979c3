use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One entry in the model catalog.  The gateway uses `provider` to pick an
/// HTTP client and `supports_reasoning` to decide whether a reasoning budget
/// may be attached to the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelEntry {
    pub name: String,
    pub model_id: String,
    pub provider: String,
    pub supports_reasoning: bool,
}

impl Default for ModelEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            model_id: String::new(),
            provider: "anthropic".to_string(),
            supports_reasoning: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Default model name (must match a catalog entry).
    pub default_model: String,
    /// Cheap model used for classification and short summaries.
    pub fast_model: String,
    pub anthropic_base_url: String,
    pub openai_base_url: String,
    pub models: Vec<ModelEntry>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-sonnet".to_string(),
            fast_model: "claude-haiku".to_string(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            models: vec![
                ModelEntry {
                    name: "claude-sonnet".to_string(),
                    model_id: "claude-sonnet-4-5".to_string(),
                    provider: "anthropic".to_string(),
                    supports_reasoning: true,
                },
                ModelEntry {
                    name: "claude-haiku".to_string(),
                    model_id: "claude-3-5-haiku-latest".to_string(),
                    provider: "anthropic".to_string(),
                    supports_reasoning: false,
                },
                ModelEntry {
                    name: "gpt-4o-mini".to_string(),
                    model_id: "gpt-4o-mini".to_string(),
                    provider: "openai".to_string(),
                    supports_reasoning: false,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Seconds to wait for a subscriber before a turn proceeds without one.
    pub subscriber_wait_secs: u64,
    /// Upper bound for approval and user-assistance waits.
    pub gate_timeout_secs: u64,
    /// Sessions untouched for this long are expired by the background sweep.
    pub session_idle_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            subscriber_wait_secs: 5,
            gate_timeout_secs: 300,
            session_idle_secs: 2 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Base URL of the workspace-suite bridge (mail, calendar, sheets, docs,
    /// slides, file storage).
    pub google_bridge_base_url: String,
    /// Base URL of the business-data (OData-style) backend.
    pub business_data_base_url: String,
    /// Base URL of the project-tracker HTTP API.
    pub project_tracker_base_url: String,
    /// Directory holding per-service access tokens.
    pub token_dir: String,
    /// Wall-clock limit for the sandboxed code runner, in seconds.
    pub code_runner_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            google_bridge_base_url: "http://127.0.0.1:8811".to_string(),
            business_data_base_url: String::new(),
            project_tracker_base_url: String::new(),
            token_dir: ".maestro/tokens".to_string(),
            code_runner_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub logs_dir: String,
    /// When true the runtime appends one JSON record per user interaction
    /// and orchestrator outcome to the audit log.
    pub audit_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            logs_dir: ".maestro/logs".to_string(),
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub tools: ToolsConfig,
    pub telemetry: TelemetryConfig,
    /// Path to an optional workspace-folder descriptor file
    /// (`{"folder_id": ..., "folder_name": ...}`).
    pub workspace_descriptor: Option<String>,
}

/// Workspace-folder hint loaded from the descriptor file.  Advisory context
/// for planning and step execution.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkspaceFolder {
    pub folder_id: String,
    pub folder_name: String,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        // Env overrides win over the file.
        if let Ok(value) = env::var("MAESTRO_BIND_ADDR") {
            if !value.is_empty() {
                config.server.bind_addr = value;
            }
        }
        if let Ok(value) = env::var("MAESTRO_DEFAULT_MODEL") {
            if !value.is_empty() {
                config.llm.default_model = value;
            }
        }
        if let Ok(value) = env::var("MAESTRO_LOGS_DIR") {
            if !value.is_empty() {
                config.telemetry.logs_dir = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Resolve a model name (or the default when `None`) against the catalog.
    pub fn model_entry(&self, name: Option<&str>) -> Option<&ModelEntry> {
        let wanted = name.unwrap_or(&self.llm.default_model);
        self.llm.models.iter().find(|m| m.name == wanted)
    }

    /// API key for a provider, read from the environment at call time so a
    /// reloaded `.env` takes effect without restart.
    pub fn api_key_for(provider: &str) -> Option<String> {
        let var = match provider {
            "anthropic" => "ANTHROPIC_API_KEY",
            "openai" => "OPENAI_API_KEY",
            _ => return None,
        };
        env::var(var).ok().filter(|k| !k.trim().is_empty())
    }

    /// Load the workspace-folder descriptor if one is configured and present.
    pub fn workspace_folder(&self) -> Option<WorkspaceFolder> {
        let path = self.workspace_descriptor.as_ref()?;
        let raw = fs::read_to_string(PathBuf::from(path)).ok()?;
        serde_json::from_str(&raw).ok()
    }
}
