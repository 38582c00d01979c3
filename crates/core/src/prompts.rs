//! Prompt assembly.
//!
//! System prompts are regenerated from the live tool registry on every turn
//! so plan steps only ever reference actions that are actually available.
//! The uploaded-files section is priority #1 in every user message that
//! carries files; the workspace-folder hint is priority #2.

use maestro_config::WorkspaceFolder;
use maestro_session::{AttachedFile, FilePayload};
use maestro_tools::ToolSpec;

use crate::assist::{ASSISTANCE_MARKER, CRITICAL_FAILURE_MARKER};

/// Render the capability overview: one line per tool, grouped by service.
fn capabilities_block(specs: &[ToolSpec]) -> String {
    let mut services: Vec<&str> = specs.iter().map(|s| s.service.as_str()).collect();
    services.sort();
    services.dedup();

    let mut out = String::new();
    for service in services {
        out.push_str(&format!("\n[{service}]\n"));
        for spec in specs.iter().filter(|s| s.service == service) {
            out.push_str(&format!("- {}: {}\n", spec.name, spec.description));
        }
    }
    out
}

pub fn build_planning_prompt(specs: &[ToolSpec]) -> String {
    format!(
        "You are a planning assistant for a multi-service agent. Break the user's request \
         into a short, ordered execution plan.\n\
         \n\
         Available capabilities:\n{}\n\
         Rules:\n\
         - One step per distinct action. Do not merge unrelated actions into one step.\n\
         - Never add a step that merely asks the user something; ambiguity is resolved during execution.\n\
         - A single-step plan is valid when the request is one action.\n\
         - Only plan actions the capabilities above can perform.\n\
         \n\
         Respond with JSON only:\n\
         {{\"plan\": \"one-line summary\", \"steps\": [\"step title\", ...]}}",
        capabilities_block(specs)
    )
}

pub fn build_step_executor_prompt(specs: &[ToolSpec], workspace: Option<&WorkspaceFolder>) -> String {
    let workspace_note = workspace
        .map(|w| {
            format!(
                "\nDefault workspace folder: \"{}\" (folder_id: {}). Prefer it when creating or \
                 searching files unless the user names another location.\n",
                w.folder_name, w.folder_id
            )
        })
        .unwrap_or_default();

    format!(
        "You are executing one step of an agreed plan using the tools bound to this \
         conversation.\n\
         \n\
         Available capabilities:\n{}{}\n\
         Behavior:\n\
         - Use tools for any real-world data or side effect; never invent tool output.\n\
         - When a choice cannot be made without the user (several matching files, ambiguous \
           recipient), emit the header \"{ASSISTANCE_MARKER}\" followed by a JSON object \
           {{\"question\": ..., \"options\": [{{\"id\", \"label\", \"description\", \"data\"}}], \
           \"context\": {{}}}} and stop.\n\
         - If the step cannot proceed at all, emit \"{CRITICAL_FAILURE_MARKER}\" with a short \
           explanation.\n\
         - Otherwise finish the step with a clear, specific answer.",
        capabilities_block(specs),
        workspace_note
    )
}

/// Priority #1 section: inlined uploaded-file contents.  The model is told
/// the text is already present so it never searches storage for these files.
pub fn uploaded_files_section(files: &[&AttachedFile]) -> String {
    if files.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        "📎 UPLOADED FILES (priority #1):\n\
         The file contents below are already part of this message. Use them directly; \
         do NOT search file storage for these files.\n\n",
    );
    for (i, file) in files.iter().enumerate() {
        match &file.payload {
            FilePayload::Text(text) => {
                out.push_str(&format!(
                    "{}. {} ({})\n[file content]:\n{}\n\n",
                    i + 1,
                    file.filename,
                    file.media_type,
                    text
                ));
            }
            FilePayload::Bytes(bytes) => {
                out.push_str(&format!(
                    "{}. {} ({}, {} bytes, attached out-of-band)\n\n",
                    i + 1,
                    file.filename,
                    file.media_type,
                    bytes.len()
                ));
            }
        }
    }
    out
}

/// Client-asserted open files.  Advisory: already visible in the client UI,
/// so searching for them again is wasted work.
pub fn open_files_section(hints: &[maestro_session::OpenFileHint]) -> String {
    if hints.is_empty() {
        return String::new();
    }
    let mut out = String::from("📂 OPEN FILES (client hint):\n");
    for hint in hints {
        out.push_str(&format!("- {} \"{}\" (id: {})\n", hint.kind, hint.title, hint.id));
    }
    out.push_str("These are already open in the user's workspace; use their ids directly instead of searching.\n\n");
    out
}

/// Priority #2 section: the configured workspace folder.
pub fn workspace_section(workspace: Option<&WorkspaceFolder>) -> String {
    match workspace {
        Some(w) => format!(
            "📁 WORKSPACE FOLDER (priority #2):\nName: {}\nID: {}\nUse this folder_id when \
             creating or searching files, after consulting the uploaded files above.\n\n",
            w.folder_name, w.folder_id
        ),
        None => String::new(),
    }
}

/// System prompt block describing recently observed domain objects, for
/// grounding anaphora ("this file", "that meeting").
pub fn entity_context_block(entity_listing: &str) -> String {
    if entity_listing.is_empty() {
        return String::new();
    }
    format!(
        "\n\nKNOWN OBJECTS FROM THIS CONVERSATION:\n{entity_listing}\n\
         These objects are already available. When the user refers to them (\"this\", \"that\"), \
         use their ids directly instead of searching again."
    )
}

pub const FINAL_ANSWER_SYSTEM_PROMPT: &str =
    "You write final answers for users. Produce a direct, informative reply to the original \
     request using the gathered data as context.\n\
     - Answer the request itself; do not report on the execution process, steps, or tools.\n\
     - Use Markdown formatting where it helps (bold, lists).\n\
     - Keep the key information the user asked for front and center.";

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_tools::{ToolCategory, ToolSpec};
    use serde_json::json;

    fn spec(name: &str, service: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: format!("does {name}"),
            input_schema: json!({"type": "object"}),
            category: ToolCategory::Read,
            service: service.to_string(),
            tags: vec![],
        }
    }

    #[test]
    fn planning_prompt_lists_only_registered_tools() {
        let prompt = build_planning_prompt(&[spec("search_emails", "email"), spec("read_sheet", "sheets")]);
        assert!(prompt.contains("search_emails"));
        assert!(prompt.contains("[sheets]"));
        assert!(!prompt.contains("create_document"));
    }

    #[test]
    fn step_prompt_carries_markers_and_workspace() {
        let folder = WorkspaceFolder { folder_id: "f-9".into(), folder_name: "Ops".into() };
        let prompt = build_step_executor_prompt(&[spec("list_events", "calendar")], Some(&folder));
        assert!(prompt.contains(ASSISTANCE_MARKER));
        assert!(prompt.contains(CRITICAL_FAILURE_MARKER));
        assert!(prompt.contains("f-9"));
    }

    #[test]
    fn uploaded_files_section_inlines_text() {
        let file = AttachedFile {
            filename: "report.pdf".into(),
            media_type: "application/pdf".into(),
            payload: FilePayload::Text("Revenue grew 12%".into()),
        };
        let section = uploaded_files_section(&[&file]);
        assert!(section.contains("priority #1"));
        assert!(section.contains("Revenue grew 12%"));
        assert!(section.contains("do NOT search"));
    }

    #[test]
    fn empty_inputs_render_empty_sections() {
        assert!(uploaded_files_section(&[]).is_empty());
        assert!(workspace_section(None).is_empty());
        assert!(entity_context_block("").is_empty());
    }
}
