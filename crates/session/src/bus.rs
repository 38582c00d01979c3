use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{Envelope, StreamEvent};

/// Per-session fan-out of typed events.
///
/// Each session has at most one live subscriber; a reconnect replaces the
/// previous one (newest wins), which keeps delivery single-copy under client
/// reconnection storms.  Sends to a session with no subscriber succeed and
/// drop the event.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
}

/// The receiving half handed to a connected client.
pub struct Subscription {
    pub receiver: mpsc::UnboundedReceiver<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a subscriber for `session_id`, displacing any previous one.
    /// The displaced subscriber's channel closes, which the transport layer
    /// reports to its client as "new connection established".
    pub fn connect(&self, session_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().expect("bus lock poisoned");
        if subscribers.insert(session_id.to_string(), tx).is_some() {
            info!(session_id, "replacing subscriber: new connection established");
        }
        Subscription { receiver: rx }
    }

    pub fn disconnect(&self, session_id: &str) {
        let mut subscribers = self.subscribers.lock().expect("bus lock poisoned");
        if subscribers.remove(session_id).is_some() {
            debug!(session_id, "subscriber disconnected");
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let subscribers = self.subscribers.lock().expect("bus lock poisoned");
        usize::from(subscribers.contains_key(session_id))
    }

    /// Wrap `event` in an envelope and deliver it.  A dead subscriber is
    /// swept; a missing subscriber is not an error.
    pub fn send(&self, session_id: &str, event: StreamEvent) {
        let mut subscribers = self.subscribers.lock().expect("bus lock poisoned");
        let Some(tx) = subscribers.get(session_id) else {
            debug!(session_id, kind = event.kind(), "no subscriber; event dropped");
            return;
        };
        if tx.send(Envelope::now(event)).is_err() {
            warn!(session_id, "subscriber channel closed; sweeping");
            subscribers.remove(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sub: &mut Subscription) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(envelope) = sub.receiver.try_recv() {
            kinds.push(envelope.event.kind().to_string());
        }
        kinds
    }

    #[tokio::test]
    async fn delivers_in_issue_order() {
        let bus = EventBus::new();
        let mut sub = bus.connect("s1");
        bus.send("s1", StreamEvent::FinalResultStart {});
        bus.send("s1", StreamEvent::FinalResultChunk { content: "a".into() });
        bus.send("s1", StreamEvent::FinalResultComplete { content: "a".into() });
        assert_eq!(drain(&mut sub), vec!["final_result_start", "final_result_chunk", "final_result_complete"]);
    }

    #[tokio::test]
    async fn zero_subscribers_is_not_an_error() {
        let bus = EventBus::new();
        bus.send("nobody", StreamEvent::WorkflowComplete {});
        assert_eq!(bus.subscriber_count("nobody"), 0);
    }

    #[tokio::test]
    async fn newest_subscriber_wins() {
        let bus = EventBus::new();
        let mut first = bus.connect("s1");
        let mut second = bus.connect("s1");

        bus.send("s1", StreamEvent::WorkflowComplete {});
        assert!(drain(&mut first).is_empty(), "displaced subscriber gets nothing");
        assert_eq!(drain(&mut second), vec!["workflow_complete"]);
        // The displaced channel is closed.
        assert!(first.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_subscriber_is_swept() {
        let bus = EventBus::new();
        let sub = bus.connect("s1");
        drop(sub);
        bus.send("s1", StreamEvent::WorkflowComplete {});
        assert_eq!(bus.subscriber_count("s1"), 0);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let bus = EventBus::new();
        let mut a = bus.connect("a");
        let mut b = bus.connect("b");
        bus.send("a", StreamEvent::StepStart { step: 1, title: "t".into() });
        assert_eq!(drain(&mut a).len(), 1);
        assert!(drain(&mut b).is_empty());
    }

    #[tokio::test]
    async fn disconnect_removes_subscriber() {
        let bus = EventBus::new();
        let _sub = bus.connect("s1");
        assert_eq!(bus.subscriber_count("s1"), 1);
        bus.disconnect("s1");
        assert_eq!(bus.subscriber_count("s1"), 0);
    }
}
