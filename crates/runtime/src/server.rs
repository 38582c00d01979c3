//! Line-delimited JSON session server over TCP.
//!
//! Each connection sends one [`ClientCommand`] per line.  `subscribe` turns
//! the connection into the session's event stream (newest subscriber wins);
//! every other command is answered with a single reply line.  Turn events
//! never flow on command connections, only on the subscriber.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

use maestro_session::{EventBus, ExecutionMode, SessionStore};

use crate::commands::{ClientCommand, ServerReply};
use crate::wrapper::AgentWrapper;

pub struct ServerDeps {
    pub bus: Arc<EventBus>,
    pub store: Arc<SessionStore>,
    pub wrapper: Arc<AgentWrapper>,
}

/// Accept loop.  `shutdown` flips to true to stop accepting and return.
pub async fn run_server(
    bind_addr: &str,
    deps: ServerDeps,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "session server listening");
    let deps = Arc::new(deps);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let deps = deps.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, deps).await {
                        error!(?err, %peer, "connection handler failed");
                    }
                });
            }
        }
    }

    info!("session server shutting down");
    Ok(())
}

async fn handle_connection(stream: TcpStream, deps: Arc<ServerDeps>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let command: ClientCommand = match serde_json::from_str(trimmed) {
            Ok(command) => command,
            Err(err) => {
                // Malformed client message: surface and keep the session
                // (and this connection) alive.
                send_reply(
                    &mut write_half,
                    &ServerReply::Error { message: format!("malformed command: {err}") },
                )
                .await?;
                continue;
            }
        };

        match command {
            ClientCommand::CreateSession => {
                let session_id = deps.store.create();
                send_reply(&mut write_half, &ServerReply::SessionCreated { session_id }).await?;
            }

            ClientCommand::Subscribe { session_id } => {
                if deps.store.get(&session_id).is_none() {
                    send_reply(
                        &mut write_half,
                        &ServerReply::Error { message: format!("unknown session: {session_id}") },
                    )
                    .await?;
                    continue;
                }
                let mut subscription = deps.bus.connect(&session_id);
                info!(%session_id, "subscriber attached");
                // The connection is now the event stream; it ends when the
                // bus closes the channel (replacement) or the client drops.
                while let Some(envelope) = subscription.receiver.recv().await {
                    if send_reply(&mut write_half, &ServerReply::Event { event: envelope }).await.is_err() {
                        deps.bus.disconnect(&session_id);
                        break;
                    }
                }
                return Ok(());
            }

            ClientCommand::Message { session_id, content, mode, file_ids } => {
                let Some(context) = deps.store.get(&session_id) else {
                    send_reply(
                        &mut write_half,
                        &ServerReply::Error { message: format!("unknown session: {session_id}") },
                    )
                    .await?;
                    continue;
                };
                if let Some(mode) = mode {
                    context.lock().await.execution_mode = match mode.as_str() {
                        "instant" => ExecutionMode::Instant,
                        _ => ExecutionMode::Approval,
                    };
                }

                // The turn runs in its own task; events reach the client on
                // the subscriber connection.
                let wrapper = deps.wrapper.clone();
                tokio::spawn(async move {
                    if let Err(err) = wrapper.process_message(&content, &session_id, &file_ids).await {
                        warn!(?err, %session_id, "turn ended with error");
                    }
                });
                send_reply(&mut write_half, &ServerReply::Ack { message: "accepted".into() }).await?;
            }

            ClientCommand::Approve { session_id, confirmation_id } => {
                let reply = match deps.wrapper.approve_plan(&confirmation_id, &session_id) {
                    Ok(()) => ServerReply::Ack { message: "approved".into() },
                    Err(err) => ServerReply::Error { message: err.to_string() },
                };
                send_reply(&mut write_half, &reply).await?;
            }

            ClientCommand::Reject { session_id, confirmation_id } => {
                let reply = match deps.wrapper.reject_plan(&confirmation_id, &session_id) {
                    Ok(()) => ServerReply::Ack { message: "rejected".into() },
                    Err(err) => ServerReply::Error { message: err.to_string() },
                };
                send_reply(&mut write_half, &reply).await?;
            }

            ClientCommand::UpdatePlan { session_id, confirmation_id, plan } => {
                let reply = match deps.wrapper.update_plan(&confirmation_id, plan.plan, plan.steps, &session_id) {
                    Ok(()) => ServerReply::Ack { message: "updated".into() },
                    Err(err) => ServerReply::Error { message: err.to_string() },
                };
                send_reply(&mut write_half, &reply).await?;
            }

            ClientCommand::AssistanceResponse { session_id, assistance_id, response } => {
                let reply = match deps.wrapper.resolve_assistance(&assistance_id, &response, &session_id) {
                    Ok(()) => ServerReply::Ack { message: "resolved".into() },
                    Err(err) => ServerReply::Error { message: err.to_string() },
                };
                send_reply(&mut write_half, &reply).await?;
            }

            ClientCommand::Stop { session_id } => {
                deps.wrapper.stop_generation(&session_id);
                send_reply(&mut write_half, &ServerReply::Ack { message: "stopping".into() }).await?;
            }
        }
    }
}

async fn send_reply(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    reply: &ServerReply,
) -> Result<()> {
    let encoded = serde_json::to_string(reply)?;
    writer.write_all(encoded.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
