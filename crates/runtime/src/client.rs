//! Small line-protocol client for the session server, used by the CLI and
//! by integration tests.

use std::time::Duration;

use anyhow::{Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::warn;

use maestro_session::Envelope;

use crate::commands::{ClientCommand, PlanPayload, ServerReply};

#[derive(Debug, Clone)]
pub struct ServerClient {
    addr: String,
}

impl ServerClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub async fn connect_with_backoff(&self, max_attempts: usize) -> Result<()> {
        let mut delay = Duration::from_millis(100);
        for attempt in 0..max_attempts.max(1) {
            match TcpStream::connect(&self.addr).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    if attempt + 1 == max_attempts.max(1) {
                        return Err(err.into());
                    }
                    warn!(attempt, ?err, "server connect failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        }
        Ok(())
    }

    pub async fn create_session(&self) -> Result<String> {
        match self.request(ClientCommand::CreateSession).await? {
            ServerReply::SessionCreated { session_id } => Ok(session_id),
            other => bail!("unexpected reply to create_session: {other:?}"),
        }
    }

    /// Attach as the session's subscriber.  Envelopes arrive on the returned
    /// channel until the server ends the stream (e.g. a newer subscriber).
    pub async fn subscribe(&self, session_id: &str) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (read_half, mut write_half) = stream.into_split();

        let request = serde_json::to_string(&ClientCommand::Subscribe {
            session_id: session_id.to_string(),
        })?;
        write_half.write_all(request.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Keep the write half alive for the lifetime of the stream.
            let _write_half = write_half;
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ServerReply>(trimmed) {
                    Ok(ServerReply::Event { event }) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!(?err, "subscriber received undecodable line"),
                }
            }
        });

        Ok(rx)
    }

    pub async fn send_message(&self, session_id: &str, content: &str, mode: Option<&str>) -> Result<()> {
        self.expect_ack(ClientCommand::Message {
            session_id: session_id.to_string(),
            content: content.to_string(),
            mode: mode.map(ToString::to_string),
            file_ids: vec![],
        })
        .await
    }

    pub async fn approve(&self, session_id: &str, confirmation_id: &str) -> Result<()> {
        self.expect_ack(ClientCommand::Approve {
            session_id: session_id.to_string(),
            confirmation_id: confirmation_id.to_string(),
        })
        .await
    }

    pub async fn reject(&self, session_id: &str, confirmation_id: &str) -> Result<()> {
        self.expect_ack(ClientCommand::Reject {
            session_id: session_id.to_string(),
            confirmation_id: confirmation_id.to_string(),
        })
        .await
    }

    pub async fn update_plan(
        &self,
        session_id: &str,
        confirmation_id: &str,
        plan: String,
        steps: Vec<String>,
    ) -> Result<()> {
        self.expect_ack(ClientCommand::UpdatePlan {
            session_id: session_id.to_string(),
            confirmation_id: confirmation_id.to_string(),
            plan: PlanPayload { plan, steps },
        })
        .await
    }

    pub async fn assistance_response(
        &self,
        session_id: &str,
        assistance_id: &str,
        response: &str,
    ) -> Result<()> {
        self.expect_ack(ClientCommand::AssistanceResponse {
            session_id: session_id.to_string(),
            assistance_id: assistance_id.to_string(),
            response: response.to_string(),
        })
        .await
    }

    pub async fn stop(&self, session_id: &str) -> Result<()> {
        self.expect_ack(ClientCommand::Stop { session_id: session_id.to_string() }).await
    }

    async fn expect_ack(&self, command: ClientCommand) -> Result<()> {
        match self.request(command).await? {
            ServerReply::Ack { .. } => Ok(()),
            ServerReply::Error { message } => bail!("server error: {message}"),
            other => bail!("unexpected reply: {other:?}"),
        }
    }

    async fn request(&self, command: ClientCommand) -> Result<ServerReply> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (read_half, mut write_half) = stream.into_split();

        let encoded = serde_json::to_string(&command)?;
        write_half.write_all(encoded.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            bail!("server closed the connection before replying");
        }
        Ok(serde_json::from_str(line.trim())?)
    }
}
