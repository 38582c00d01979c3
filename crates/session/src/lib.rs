//! Session state and the per-session event stream.
//!
//! Three pieces live here because they share lifecycle: the typed
//! [`StreamEvent`] vocabulary all orchestrators emit, the [`EventBus`] that
//! fans events out to the session's subscriber, and the
//! [`ConversationContext`] that owns everything a session remembers.

mod bus;
mod context;
mod events;
mod store;

pub use bus::{EventBus, Subscription};
pub use context::{
    AttachedFile, ChatTurn, ConversationContext, EntityRecord, ExecutionMode, FilePayload,
    OpenFileHint, PlanSnapshot, Role,
};
pub use events::{AssistanceOption, Envelope, StreamEvent};
pub use store::SessionStore;
