pub mod backoff;
pub mod pending;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::events::{ClientCommand, ServerEvent};
use parley_types::models::MessagePayload;

use crate::backoff::ReconnectPolicy;
use crate::pending::PendingSends;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Client connection lifecycle. Transport loss from any state falls back
/// to `Disconnected`, from where the backoff policy drives reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    Ready,
}

/// Notifications surfaced to the embedding application.
#[derive(Debug)]
pub enum ClientEvent {
    State(ConnState),
    /// A server event other than the ones consumed by the client itself.
    Server(ServerEvent),
    /// An optimistic send was confirmed; swap the local copy for the
    /// canonical message instead of rendering a second one.
    SendResolved {
        temp_id: String,
        message: MessagePayload,
    },
    /// An optimistic send can no longer be confirmed.
    SendFailed { temp_id: String },
    /// The backoff policy is exhausted; no further automatic retries.
    ConnectionLost,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection lost after exhausting reconnect attempts")]
    ConnectionLost,
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
}

pub struct ClientConfig {
    pub url: String,
    pub token: String,
    pub policy: ReconnectPolicy,
    /// `Ready` must be held this long before the attempt counter resets,
    /// so a connection that drops immediately still burns an attempt.
    pub ready_holddown: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            policy: ReconnectPolicy::default(),
            ready_holddown: Duration::from_secs(5),
        }
    }
}

/// Handle for the embedding application to push commands through.
/// Dropping it closes the connection deliberately (no reconnect).
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl ClientHandle {
    /// Queue a command; false if the client task is gone.
    pub fn send(&self, cmd: ClientCommand) -> bool {
        self.commands.send(cmd).is_ok()
    }
}

enum SessionEnd {
    /// Deliberate close; no reconnect.
    Closed,
    /// The server refused the credential; retrying won't help.
    AuthRejected(String),
    /// Involuntary transport loss; the backoff policy decides what's next.
    Lost { held_ready: bool },
}

pub struct Client {
    config: ClientConfig,
    /// Chats to re-join after a reconnect; the server forgets group
    /// membership when a connection dies.
    chats: HashSet<Uuid>,
    pending: PendingSends,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
    ) -> (Self, ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                chats: HashSet::new(),
                pending: PendingSends::default(),
                commands: commands_rx,
                events: events_tx,
            },
            ClientHandle {
                commands: commands_tx,
            },
            events_rx,
        )
    }

    /// Drive the connection until a deliberate close or a terminal error.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let mut attempt: u32 = 0;
        loop {
            match self.run_session().await {
                SessionEnd::Closed => {
                    self.set_state(ConnState::Disconnected);
                    return Ok(());
                }
                SessionEnd::AuthRejected(reason) => {
                    self.set_state(ConnState::Disconnected);
                    return Err(ClientError::AuthRejected(reason));
                }
                SessionEnd::Lost { held_ready } => {
                    for (temp_id, _) in self.pending.fail_all() {
                        let _ = self.events.send(ClientEvent::SendFailed { temp_id });
                    }
                    self.set_state(ConnState::Disconnected);

                    if held_ready {
                        attempt = 0;
                    }
                    attempt += 1;
                    if self.config.policy.exhausted(attempt) {
                        let _ = self.events.send(ClientEvent::ConnectionLost);
                        return Err(ClientError::ConnectionLost);
                    }

                    let delay = self.config.policy.jittered(attempt);
                    info!("reconnect attempt {} in {:?}", attempt, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn run_session(&mut self) -> SessionEnd {
        self.set_state(ConnState::Connecting);
        let ws = match connect_async(self.config.url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                warn!("connect failed: {}", e);
                return SessionEnd::Lost { held_ready: false };
            }
        };
        let (mut sink, mut stream) = ws.split();

        // Each session re-presents the credential; the server keeps no
        // session state across a lost connection.
        self.set_state(ConnState::Authenticating);
        let auth = ClientCommand::Authenticate {
            token: self.config.token.clone(),
        };
        if send_command(&mut sink, &auth).await.is_err() {
            return SessionEnd::Lost { held_ready: false };
        }

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(ServerEvent::Authenticated { user_id, .. }) => {
                            debug!("authenticated as {}", user_id);
                            break;
                        }
                        Ok(ServerEvent::AuthError { reason }) => {
                            return SessionEnd::AuthRejected(reason);
                        }
                        Ok(_) | Err(_) => continue,
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return SessionEnd::Lost { held_ready: false },
            }
        }

        // Re-join every chat we were subscribed to before the disconnect.
        self.set_state(ConnState::Subscribing);
        for chat_id in self.chats.clone() {
            if send_command(&mut sink, &ClientCommand::JoinChat { chat_id })
                .await
                .is_err()
            {
                return SessionEnd::Lost { held_ready: false };
            }
        }

        self.set_state(ConnState::Ready);
        let ready_at = Instant::now();

        loop {
            let held_ready = ready_at.elapsed() >= self.config.ready_holddown;
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_server_text(text.as_str()),
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return SessionEnd::Lost { held_ready };
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost { held_ready };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("transport error: {}", e);
                        return SessionEnd::Lost { held_ready };
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        self.note_outgoing(&cmd);
                        if send_command(&mut sink, &cmd).await.is_err() {
                            return SessionEnd::Lost { held_ready };
                        }
                    }
                    None => {
                        // Handle dropped: deliberate close.
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Closed;
                    }
                }
            }
        }
    }

    /// Track client-side state that must survive a reconnect.
    fn note_outgoing(&mut self, cmd: &ClientCommand) {
        match cmd {
            ClientCommand::JoinChat { chat_id } => {
                self.chats.insert(*chat_id);
            }
            ClientCommand::LeaveChat { chat_id } => {
                self.chats.remove(chat_id);
            }
            ClientCommand::SendMessage {
                chat_id,
                content,
                temp_id: Some(temp_id),
                ..
            } => {
                self.pending
                    .track(temp_id.clone(), *chat_id, content.clone());
            }
            _ => {}
        }
    }

    fn handle_server_text(&mut self, text: &str) {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("malformed server event: {} -- raw: {}", e, &text[..text.len().min(200)]);
                return;
            }
        };

        match event {
            ServerEvent::MessageSent { temp_id, message } => {
                if self.pending.resolve(&temp_id).is_some() {
                    let _ = self.events.send(ClientEvent::SendResolved { temp_id, message });
                } else {
                    // Ack for a send from a previous session; nothing to
                    // reconcile, surface as a plain event.
                    let _ = self
                        .events
                        .send(ClientEvent::Server(ServerEvent::NewMessage { message }));
                }
            }
            other => {
                let _ = self.events.send(ClientEvent::Server(other));
            }
        }
    }

    fn set_state(&self, state: ConnState) {
        debug!("connection state: {:?}", state);
        let _ = self.events.send(ClientEvent::State(state));
    }
}

async fn send_command(sink: &mut WsSink, cmd: &ClientCommand) -> anyhow::Result<()> {
    let text = serde_json::to_string(cmd)?;
    sink.send(Message::text(text)).await?;
    Ok(())
}
