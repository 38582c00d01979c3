use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// How many domain objects the entity memory keeps before evicting the
/// least recently seen one.
const ENTITY_MEMORY_CAP: usize = 32;

/// JSON fields whose values look like object ids worth remembering.
const ID_FIELDS: &[&str] = &[
    "id", "spreadsheet_id", "document_id", "presentation_id", "event_id", "message_id",
    "file_id", "folder_id", "task_id", "project_id",
];

/// Sibling fields that give an id a human label.
const LABEL_FIELDS: &[&str] = &["title", "name", "subject", "summary", "filename", "label"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    pub turn: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Instant,
    Approval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub plan: String,
    pub steps: Vec<String>,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FilePayload {
    /// Extracted text for text-like files (plain text, PDFs).
    Text(String),
    /// Opaque bytes for images.
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedFile {
    pub filename: String,
    pub media_type: String,
    pub payload: FilePayload,
}

/// Client-asserted hint that a file is already open in its UI.  Advisory,
/// consumed read-only to discourage redundant search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenFileHint {
    pub kind: String,
    pub title: String,
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub kind: String,
    pub id: String,
    pub label: Option<String>,
    pub turn: usize,
}

/// Per-session conversation state.  Single-owner: the session task.
pub struct ConversationContext {
    messages: Vec<ChatTurn>,
    pub execution_mode: ExecutionMode,
    pub model_name: Option<String>,
    pending_confirmations: HashMap<String, PlanSnapshot>,
    /// A resolved confirmation id never becomes pending again.
    resolved_confirmations: HashSet<String>,
    entity_memory: LruCache<String, EntityRecord>,
    attached_files: HashMap<String, AttachedFile>,
    pub open_files: Vec<OpenFileHint>,
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationContext {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            execution_mode: ExecutionMode::Approval,
            model_name: None,
            pending_confirmations: HashMap::new(),
            resolved_confirmations: HashSet::new(),
            entity_memory: LruCache::new(
                NonZeroUsize::new(ENTITY_MEMORY_CAP).expect("cap is nonzero"),
            ),
            attached_files: HashMap::new(),
            open_files: Vec::new(),
        }
    }

    // ── Messages (append-only) ──────────────────────────────────────────────

    pub fn add_message(&mut self, role: Role, content: impl Into<String>) {
        let turn = self.messages.len();
        self.messages.push(ChatTurn { role, content: content.into(), turn });
    }

    pub fn messages(&self) -> &[ChatTurn] {
        &self.messages
    }

    /// Last `n` turns, oldest first.
    pub fn recent_messages(&self, n: usize) -> &[ChatTurn] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    // ── Pending confirmations ───────────────────────────────────────────────

    /// Store a plan snapshot under a confirmation id.  Ids that were already
    /// resolved are refused: a confirmation is resolvable at most once.
    pub fn add_pending_confirmation(&mut self, id: impl Into<String>, snapshot: PlanSnapshot) -> bool {
        let id = id.into();
        if self.resolved_confirmations.contains(&id) {
            debug!(confirmation_id = %id, "refusing to re-add resolved confirmation");
            return false;
        }
        self.pending_confirmations.insert(id, snapshot);
        true
    }

    pub fn pending_confirmation(&self, id: &str) -> Option<&PlanSnapshot> {
        self.pending_confirmations.get(id)
    }

    pub fn pending_confirmation_count(&self) -> usize {
        self.pending_confirmations.len()
    }

    /// Remove and tombstone a confirmation.  Returns the snapshot when the
    /// id was actually pending.
    pub fn resolve_confirmation(&mut self, id: &str) -> Option<PlanSnapshot> {
        let snapshot = self.pending_confirmations.remove(id)?;
        self.resolved_confirmations.insert(id.to_string());
        Some(snapshot)
    }

    /// Replace the plan stored under a still-pending confirmation.
    pub fn update_pending_confirmation(&mut self, id: &str, plan: String, steps: Vec<String>) -> bool {
        match self.pending_confirmations.get_mut(id) {
            Some(snapshot) => {
                snapshot.plan = plan;
                snapshot.steps = steps;
                true
            }
            None => false,
        }
    }

    // ── Attached files ──────────────────────────────────────────────────────

    pub fn attach_file(&mut self, file_id: impl Into<String>, file: AttachedFile) {
        self.attached_files.insert(file_id.into(), file);
    }

    pub fn get_file(&self, file_id: &str) -> Option<&AttachedFile> {
        self.attached_files.get(file_id)
    }

    pub fn files_for(&self, file_ids: &[String]) -> Vec<&AttachedFile> {
        file_ids.iter().filter_map(|id| self.attached_files.get(id)).collect()
    }

    // ── Entity memory ───────────────────────────────────────────────────────

    pub fn remember_entity(&mut self, record: EntityRecord) {
        self.entity_memory.put(record.id.clone(), record);
    }

    pub fn has_entities(&self) -> bool {
        !self.entity_memory.is_empty()
    }

    /// Recently observed entities, most recent first.
    pub fn entities(&self) -> Vec<&EntityRecord> {
        self.entity_memory.iter().map(|(_, record)| record).collect()
    }

    /// Render the entity memory for a system prompt.  Empty string when
    /// nothing has been observed.
    pub fn entity_context_string(&self) -> String {
        if self.entity_memory.is_empty() {
            return String::new();
        }
        self.entity_memory
            .iter()
            .map(|(_, record)| {
                let label = record.label.as_deref().unwrap_or("(unnamed)");
                format!("- {} \"{}\" (id: {})", record.kind, label, record.id)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Best-effort extraction of id-shaped fields from a tool result.
    /// Never fails: anything unrecognizable is simply skipped.
    pub fn record_entities_from_tool(&mut self, tool_name: &str, result: &Value, turn: usize) {
        let mut found = Vec::new();
        scan_for_entities(result, tool_name, turn, 0, &mut found);
        let count = found.len();
        for record in found {
            self.remember_entity(record);
        }
        if count > 0 {
            debug!(tool_name, count, "entities recorded from tool result");
        }
    }
}

fn scan_for_entities(
    value: &Value,
    tool_name: &str,
    turn: usize,
    depth: usize,
    out: &mut Vec<EntityRecord>,
) {
    if depth > 4 {
        return;
    }
    match value {
        Value::Object(map) => {
            let label = LABEL_FIELDS
                .iter()
                .find_map(|f| map.get(*f).and_then(|v| v.as_str()))
                .map(ToString::to_string);
            for (key, field) in map {
                if let Some(id) = field.as_str() {
                    if ID_FIELDS.contains(&key.as_str()) && !id.is_empty() {
                        let kind = key
                            .strip_suffix("_id")
                            .filter(|k| !k.is_empty())
                            .unwrap_or_else(|| tool_name.split('_').next_back().unwrap_or("object"));
                        out.push(EntityRecord {
                            kind: kind.to_string(),
                            id: id.to_string(),
                            label: label.clone(),
                            turn,
                        });
                    }
                }
                scan_for_entities(field, tool_name, turn, depth + 1, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                scan_for_entities(item, tool_name, turn, depth + 1, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_are_append_only_and_turn_stamped() {
        let mut ctx = ConversationContext::new();
        ctx.add_message(Role::User, "hi");
        ctx.add_message(Role::Assistant, "hello");
        let before = ctx.messages().len();
        ctx.add_message(Role::User, "more");
        assert!(ctx.messages().len() > before);
        assert_eq!(ctx.messages()[0].turn, 0);
        assert_eq!(ctx.messages()[2].turn, 2);
    }

    #[test]
    fn recent_messages_windows_from_the_end() {
        let mut ctx = ConversationContext::new();
        for i in 0..15 {
            ctx.add_message(Role::User, format!("m{i}"));
        }
        let recent = ctx.recent_messages(10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "m5");
        assert_eq!(recent[9].content, "m14");
    }

    #[test]
    fn confirmation_resolvable_at_most_once() {
        let mut ctx = ConversationContext::new();
        let snapshot = PlanSnapshot { plan: "p".into(), steps: vec!["s".into()], mode: "plan_and_confirm".into() };
        assert!(ctx.add_pending_confirmation("c1", snapshot.clone()));
        assert!(ctx.resolve_confirmation("c1").is_some());
        assert!(ctx.resolve_confirmation("c1").is_none());
        // A resolved id never becomes pending again.
        assert!(!ctx.add_pending_confirmation("c1", snapshot));
        assert_eq!(ctx.pending_confirmation_count(), 0);
    }

    #[test]
    fn update_pending_confirmation_replaces_steps() {
        let mut ctx = ConversationContext::new();
        ctx.add_pending_confirmation(
            "c1",
            PlanSnapshot { plan: "old".into(), steps: vec!["a".into()], mode: "plan_and_confirm".into() },
        );
        assert!(ctx.update_pending_confirmation("c1", "new".into(), vec!["x".into(), "y".into()]));
        let snapshot = ctx.pending_confirmation("c1").unwrap();
        assert_eq!(snapshot.plan, "new");
        assert_eq!(snapshot.steps.len(), 2);
        assert!(!ctx.update_pending_confirmation("missing", "p".into(), vec![]));
    }

    #[test]
    fn attached_file_keys_are_unique() {
        let mut ctx = ConversationContext::new();
        ctx.attach_file("f1", AttachedFile {
            filename: "a.txt".into(),
            media_type: "text/plain".into(),
            payload: FilePayload::Text("first".into()),
        });
        ctx.attach_file("f1", AttachedFile {
            filename: "a.txt".into(),
            media_type: "text/plain".into(),
            payload: FilePayload::Text("second".into()),
        });
        match &ctx.get_file("f1").unwrap().payload {
            FilePayload::Text(t) => assert_eq!(t, "second"),
            _ => panic!("expected text payload"),
        }
    }

    #[test]
    fn entity_extraction_finds_ids_with_labels() {
        let mut ctx = ConversationContext::new();
        let result = json!({
            "spreadsheet_id": "ss-42",
            "title": "Q2 Sales",
            "sheets": [{"id": "tab-1", "name": "June"}]
        });
        ctx.record_entities_from_tool("create_spreadsheet", &result, 3);
        assert!(ctx.has_entities());
        let rendered = ctx.entity_context_string();
        assert!(rendered.contains("ss-42"));
        assert!(rendered.contains("Q2 Sales"));
        assert!(rendered.contains("tab-1"));
    }

    #[test]
    fn entity_extraction_never_fails_on_odd_shapes() {
        let mut ctx = ConversationContext::new();
        ctx.record_entities_from_tool("get_email", &json!("plain text result"), 1);
        ctx.record_entities_from_tool("get_email", &json!([1, 2, [3, {"deep": null}]]), 1);
        assert!(!ctx.has_entities());
    }

    #[test]
    fn entity_memory_is_bounded() {
        let mut ctx = ConversationContext::new();
        for i in 0..(ENTITY_MEMORY_CAP + 10) {
            ctx.remember_entity(EntityRecord {
                kind: "file".into(),
                id: format!("id-{i}"),
                label: None,
                turn: i,
            });
        }
        assert_eq!(ctx.entities().len(), ENTITY_MEMORY_CAP);
        // Oldest entries were evicted.
        assert!(!ctx.entities().iter().any(|e| e.id == "id-0"));
    }

    #[test]
    fn files_for_skips_unknown_ids() {
        let mut ctx = ConversationContext::new();
        ctx.attach_file("known", AttachedFile {
            filename: "k.pdf".into(),
            media_type: "application/pdf".into(),
            payload: FilePayload::Text("content".into()),
        });
        let files = ctx.files_for(&["known".to_string(), "unknown".to_string()]);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "k.pdf");
    }
}
