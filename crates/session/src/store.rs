use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tracing::info;
use uuid::Uuid;

use crate::context::ConversationContext;

struct SessionEntry {
    context: Arc<AsyncMutex<ConversationContext>>,
    touched_at: Instant,
}

/// Holds one [`ConversationContext`] per live session.  Ids are opaque and
/// URL-safe.  Contexts are handed out behind an async mutex because a
/// session's turn task holds one across awaits.
///
/// Sessions die on explicit [`remove`](Self::remove) or when
/// [`sweep_idle`](Self::sweep_idle) finds them untouched past the limit.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and return its id.
    pub fn create(&self) -> String {
        let session_id = Uuid::new_v4().simple().to_string();
        let mut sessions = self.sessions.lock().expect("store lock poisoned");
        sessions.insert(
            session_id.clone(),
            SessionEntry {
                context: Arc::new(AsyncMutex::new(ConversationContext::new())),
                touched_at: Instant::now(),
            },
        );
        info!(session_id, "session created");
        session_id
    }

    /// Fetch a session's context, refreshing its idle clock.
    pub fn get(&self, session_id: &str) -> Option<Arc<AsyncMutex<ConversationContext>>> {
        let mut sessions = self.sessions.lock().expect("store lock poisoned");
        sessions.get_mut(session_id).map(|entry| {
            entry.touched_at = Instant::now();
            entry.context.clone()
        })
    }

    pub fn remove(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("store lock poisoned");
        let removed = sessions.remove(session_id).is_some();
        if removed {
            info!(session_id, "session removed");
        }
        removed
    }

    /// Drop sessions idle for longer than `max_idle`; returns their ids.
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<String> {
        let mut sessions = self.sessions.lock().expect("store lock poisoned");
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| entry.touched_at.elapsed() > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
            info!(session_id = %id, "idle session expired");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Role;

    #[tokio::test]
    async fn create_get_remove_lifecycle() {
        let store = SessionStore::new();
        let id = store.create();
        assert_eq!(store.len(), 1);

        let ctx = store.get(&id).unwrap();
        ctx.lock().await.add_message(Role::User, "hello");
        assert_eq!(store.get(&id).unwrap().lock().await.messages().len(), 1);

        assert!(store.remove(&id));
        assert!(store.get(&id).is_none());
        assert!(!store.remove(&id));
    }

    #[test]
    fn ids_are_unique_and_url_safe() {
        let store = SessionStore::new();
        let a = store.create();
        let b = store.create();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn idle_sweep_spares_touched_sessions() {
        let store = SessionStore::new();
        let stale = store.create();
        let fresh = store.create();

        // Zero tolerance expires both; touching one first keeps it alive.
        std::thread::sleep(Duration::from_millis(10));
        let _ = store.get(&fresh);
        let expired = store.sweep_idle(Duration::from_millis(5));
        assert!(expired.contains(&stale));
        assert!(!expired.contains(&fresh));
        assert!(store.get(&fresh).is_some());
        assert!(store.get(&stale).is_none());
    }
}
