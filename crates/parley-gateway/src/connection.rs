use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{info, warn};
use uuid::Uuid;

use parley_types::api::Claims;
use parley_types::events::{ClientCommand, ErrorCode, ServerEvent};

use crate::error::GatewayError;
use crate::hub::Hub;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// The authenticate handshake must arrive within this window of the
/// upgrade, or the socket is closed.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection: authenticate handshake, then the
/// shared reader/writer loop until either side goes away.
pub async fn handle_connection(socket: WebSocket, hub: Hub, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let (user_id, username) = match wait_for_authenticate(&mut receiver, &jwt_secret).await {
        Ok(identity) => identity,
        Err(reason) => {
            warn!("WebSocket client failed to authenticate: {}", reason);
            let event = ServerEvent::AuthError { reason };
            let _ = sender
                .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
                .await;
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    let authed = ServerEvent::Authenticated {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&authed).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Register with the hub; the first connection for this identity flips
    // presence to online.
    let (conn_id, mut conn_rx) = hub.register_connection(user_id).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Writer task: drain the connection's event channel, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = conn_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader task: parse and dispatch client commands.
    let hub_recv = hub.clone();
    let username_recv = username.clone();
    let secret_recv = jwt_secret.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        let chat_context = command_chat(&cmd);
                        if let Err(err) = handle_command(
                            &hub_recv,
                            user_id,
                            &username_recv,
                            conn_id,
                            &secret_recv,
                            cmd,
                        )
                        .await
                        {
                            hub_recv
                                .send_to_conn(user_id, conn_id, err.to_event(chat_context))
                                .await;
                            if err.closes_connection() {
                                warn!(
                                    "{} ({}) closed for auth failure: {}",
                                    username_recv, user_id, err
                                );
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                        hub_recv
                            .send_to_conn(
                                user_id,
                                conn_id,
                                ServerEvent::Error {
                                    code: ErrorCode::BadRequest,
                                    message: "malformed command".into(),
                                    chat_id: None,
                                },
                            )
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.disconnect(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn wait_for_authenticate(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Result<(Uuid, String), String> {
    let handshake = tokio::time::timeout(AUTH_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                return match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(ClientCommand::Authenticate { token }) => {
                        verify_token(&token, jwt_secret).ok_or("invalid credential".to_string())
                    }
                    _ => Err("expected authenticate".to_string()),
                };
            }
        }
        Err("connection closed during handshake".to_string())
    });

    match handshake.await {
        Ok(result) => result,
        Err(_) => Err("handshake timed out".to_string()),
    }
}

fn verify_token(token: &str, jwt_secret: &str) -> Option<(Uuid, String)> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    Some((token_data.claims.sub, token_data.claims.username))
}

async fn handle_command(
    hub: &Hub,
    user_id: Uuid,
    username: &str,
    conn_id: Uuid,
    jwt_secret: &str,
    cmd: ClientCommand,
) -> Result<(), GatewayError> {
    match cmd {
        // A repeated authenticate is idempotent for the same identity; a
        // different identity on an already-registered session is refused
        // and closes the connection.
        ClientCommand::Authenticate { token } => {
            let (claimed, _) = verify_token(&token, jwt_secret)
                .ok_or_else(|| GatewayError::Auth("invalid credential".into()))?;
            if claimed != user_id {
                return Err(GatewayError::Auth("identity mismatch for session".into()));
            }
            Ok(())
        }

        ClientCommand::JoinChat { chat_id } => hub.join_chat(user_id, conn_id, chat_id).await,

        ClientCommand::LeaveChat { chat_id } => {
            hub.leave_chat(user_id, conn_id, chat_id).await;
            Ok(())
        }

        ClientCommand::SendMessage {
            chat_id,
            content,
            kind,
            reply_to,
            temp_id,
        } => {
            hub.send_message(
                user_id, username, conn_id, chat_id, content, kind, reply_to, temp_id,
            )
            .await
        }

        ClientCommand::EditMessage {
            message_id,
            content,
        } => hub.edit_message(user_id, message_id, content).await,

        ClientCommand::DeleteMessage { message_id } => {
            hub.delete_message(user_id, message_id).await
        }

        ClientCommand::TypingStart { chat_id } => {
            hub.typing_start(chat_id, user_id, conn_id, username).await
        }

        ClientCommand::TypingStop { chat_id } => hub.typing_stop(chat_id, user_id, conn_id).await,

        ClientCommand::AddReaction { message_id, emoji } => {
            hub.add_reaction(user_id, message_id, emoji).await
        }

        ClientCommand::RemoveReaction { message_id, emoji } => {
            hub.remove_reaction(user_id, message_id, emoji).await
        }

        ClientCommand::MarkRead { chat_id } => hub.mark_read(user_id, chat_id).await,

        ClientCommand::SetStatus {
            status,
            status_text,
        } => {
            hub.set_status(user_id, status, status_text).await;
            Ok(())
        }
    }
}

/// Chat context for error events, so clients can attribute failures.
fn command_chat(cmd: &ClientCommand) -> Option<Uuid> {
    match cmd {
        ClientCommand::JoinChat { chat_id }
        | ClientCommand::LeaveChat { chat_id }
        | ClientCommand::SendMessage { chat_id, .. }
        | ClientCommand::TypingStart { chat_id }
        | ClientCommand::TypingStop { chat_id }
        | ClientCommand::MarkRead { chat_id } => Some(*chat_id),
        _ => None,
    }
}
