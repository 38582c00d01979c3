//! Runtime: the agent wrapper (per-message front door), the session server,
//! the audit log, and a line-protocol client.

mod audit;
mod client;
mod commands;
mod server;
mod wrapper;

pub use audit::AuditLogger;
pub use client::ServerClient;
pub use commands::{ClientCommand, PlanPayload, ServerReply};
pub use server::{ServerDeps, run_server};
pub use wrapper::{AgentWrapper, TurnResult};
