use serde::{Deserialize, Serialize};

use maestro_session::Envelope;

/// Client-to-server control messages, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Allocate a session; the reply carries its id.
    CreateSession,
    /// Attach this connection as the session's event subscriber.  A newer
    /// subscriber displaces this one.
    Subscribe { session_id: String },
    /// Start a turn.  `mode` is "agent" (plan + approval) or "instant".
    Message {
        session_id: String,
        content: String,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        file_ids: Vec<String>,
    },
    /// Resolve a pending plan.
    Approve { session_id: String, confirmation_id: String },
    Reject { session_id: String, confirmation_id: String },
    /// Edit a pending plan before approval.
    UpdatePlan {
        session_id: String,
        confirmation_id: String,
        plan: PlanPayload,
    },
    /// Resolve a mid-step user-assistance request.
    AssistanceResponse {
        session_id: String,
        assistance_id: String,
        response: String,
    },
    /// Cancel in-flight work for the session.
    Stop { session_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPayload {
    pub plan: String,
    pub steps: Vec<String>,
}

/// Server-to-client replies.  `Event` lines flow on subscriber connections;
/// the others answer control commands.  The envelope is nested (not
/// flattened) because it carries its own `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    SessionCreated { session_id: String },
    Ack { message: String },
    Error { message: String },
    Event { event: Envelope },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_roundtrip_with_snake_case_tags() {
        let raw = r#"{"type":"message","session_id":"s1","content":"привет","mode":"agent"}"#;
        let command: ClientCommand = serde_json::from_str(raw).unwrap();
        match command {
            ClientCommand::Message { session_id, content, mode, file_ids } => {
                assert_eq!(session_id, "s1");
                assert_eq!(content, "привет");
                assert_eq!(mode.as_deref(), Some("agent"));
                assert!(file_ids.is_empty());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn update_plan_carries_payload() {
        let raw = r#"{"type":"update_plan","session_id":"s","confirmation_id":"c",
                      "plan":{"plan":"summary","steps":["a","b"]}}"#;
        let command: ClientCommand = serde_json::from_str(raw).unwrap();
        match command {
            ClientCommand::UpdatePlan { plan, .. } => {
                assert_eq!(plan.steps, vec!["a", "b"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn stop_is_minimal() {
        let command: ClientCommand =
            serde_json::from_str(r#"{"type":"stop","session_id":"s"}"#).unwrap();
        assert!(matches!(command, ClientCommand::Stop { .. }));
    }

    #[test]
    fn event_reply_nests_the_envelope() {
        use maestro_session::{Envelope, StreamEvent};
        let reply = ServerReply::Event { event: Envelope::now(StreamEvent::WorkflowComplete {}) };
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire["type"], "event");
        assert_eq!(wire["event"]["type"], "workflow_complete");

        let back: ServerReply = serde_json::from_value(wire).unwrap();
        assert!(matches!(back, ServerReply::Event { .. }));
    }
}
