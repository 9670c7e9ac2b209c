//! One WebSocket connection: join handshake, then a writer task draining the
//! participant's outbound queue and a reader loop routing inbound envelopes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tally_core::{Envelope, Frame, Outbound, Session, SessionId, UserId};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::server::AppState;

/// First frame a client must send.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinRequest {
    pub session_id: String,
    pub user_name: String,
    pub is_creator: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("invalid join message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("join message has no sessionId")]
    MissingSessionId,
    #[error("join message has no userName")]
    MissingUserName,
}

impl JoinRequest {
    /// Parse and normalize a join frame. `userName` is form-decoded, so `+`
    /// and `%20` both become a space. Emptiness is checked before decoding.
    pub fn parse(raw: &str) -> Result<Self, JoinError> {
        let mut join: JoinRequest = serde_json::from_str(raw)?;
        join.session_id = join.session_id.trim().to_string();
        if join.session_id.is_empty() {
            return Err(JoinError::MissingSessionId);
        }
        if join.user_name.is_empty() {
            return Err(JoinError::MissingUserName);
        }
        join.user_name = decode_name(&join.user_name);
        Ok(join)
    }
}

/// Form-decode a name. A malformed `%` escape leaves the name untouched,
/// `+` included.
fn decode_name(raw: &str) -> String {
    if !has_valid_escapes(raw) {
        return raw.to_string();
    }
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

fn has_valid_escapes(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3);
            if !hex.is_some_and(|h| h.iter().all(u8::is_ascii_hexdigit)) {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}

pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_tx, mut ws_rx) = socket.split();

    let Some(join) = await_join(&mut ws_rx).await else {
        debug!("connection closed before join");
        return;
    };

    let session_id = SessionId::from_raw(join.session_id);
    let queue_size = state.config.send_queue_size;
    let mut queue = None;
    let (session, user) = state
        .registry
        .join(&session_id, &join.user_name, join.is_creator, || {
            let (tx, rx) = mpsc::channel::<Frame>(queue_size);
            queue = Some(rx);
            Some(Box::new(tx) as Box<dyn Outbound>)
        });
    let Some(rx) = queue else {
        let _ = session.remove_user(&user.id);
        return;
    };
    let user_id = user.id;

    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        rx,
        state.config.heartbeat_interval,
        user_id.clone(),
    ));

    tokio::select! {
        () = read_loop(&mut ws_rx, &session, &user_id) => {},
        _ = &mut writer => {},
    }

    let _ = session.remove_user(&user_id);
    writer.abort();
    info!(session_id = %session.id(), user_id = %user_id, "connection closed");
}

/// Read frames until a valid join arrives. Anything else is logged and
/// skipped. Returns `None` if the socket closes first.
async fn await_join(ws_rx: &mut SplitStream<WebSocket>) -> Option<JoinRequest> {
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match JoinRequest::parse(text.as_str()) {
                Ok(join) => return Some(join),
                Err(e) => warn!(error = %e, "ignoring frame before join"),
            },
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "websocket error before join");
                return None;
            }
        }
    }
    None
}

async fn read_loop(ws_rx: &mut SplitStream<WebSocket>, session: &Arc<Session>, user_id: &UserId) {
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => route(session, user_id, text.as_str()),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {} // ping/pong handled by axum
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "websocket read failed");
                break;
            }
        }
    }
}

fn route(session: &Session, user_id: &UserId, raw: &str) {
    let envelope = match Envelope::parse(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(session_id = %session.id(), user_id = %user_id, error = %e, "unparseable message");
            return;
        }
    };
    if let Err(e) = session.handle_message(user_id, &envelope) {
        warn!(
            session_id = %session.id(),
            user_id = %user_id,
            kind = %envelope.kind,
            error_kind = e.error_kind(),
            error = %e,
            "message dropped"
        );
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Frame>,
    heartbeat: Duration,
    user_id: UserId,
) {
    let mut ping_interval = tokio::time::interval(heartbeat);
    ping_interval.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(WsMessage::Text(frame.as_ref().into())).await.is_err() {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    break;
                }
                trace!(user_id = %user_id, "sent ping");
            }
        }
    }
    let _ = ws_tx.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_join() {
        let join = JoinRequest::parse(r#"{"sessionId":"S1","userName":"Alice","isCreator":true}"#).unwrap();
        assert_eq!(join.session_id, "S1");
        assert_eq!(join.user_name, "Alice");
        assert!(join.is_creator);
    }

    #[test]
    fn is_creator_defaults_false() {
        let join = JoinRequest::parse(r#"{"sessionId":"S1","userName":"Bob"}"#).unwrap();
        assert!(!join.is_creator);
    }

    #[test]
    fn user_name_is_form_decoded() {
        let join = JoinRequest::parse(r#"{"sessionId":"S1","userName":"Bob+Smith%21"}"#).unwrap();
        assert_eq!(join.user_name, "Bob Smith!");
        let join = JoinRequest::parse(r#"{"sessionId":"S1","userName":"Jos%C3%A9%20R"}"#).unwrap();
        assert_eq!(join.user_name, "José R");
    }

    #[test]
    fn bad_percent_sequences_are_kept() {
        let join = JoinRequest::parse(r#"{"sessionId":"S1","userName":"100%"}"#).unwrap();
        assert_eq!(join.user_name, "100%");
        let join = JoinRequest::parse(r#"{"sessionId":"S1","userName":"a+b%zz"}"#).unwrap();
        assert_eq!(join.user_name, "a+b%zz");
        let join = JoinRequest::parse(r#"{"sessionId":"S1","userName":"Ann+%4"}"#).unwrap();
        assert_eq!(join.user_name, "Ann+%4");
    }

    #[test]
    fn whitespace_names_are_kept_verbatim() {
        let join = JoinRequest::parse(r#"{"sessionId":"S1","userName":"  "}"#).unwrap();
        assert_eq!(join.user_name, "  ");
        let join = JoinRequest::parse(r#"{"sessionId":"S1","userName":"+Bob+"}"#).unwrap();
        assert_eq!(join.user_name, " Bob ");
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(matches!(
            JoinRequest::parse(r#"{"userName":"Alice"}"#),
            Err(JoinError::MissingSessionId)
        ));
        assert!(matches!(
            JoinRequest::parse(r#"{"sessionId":"S1","userName":""}"#),
            Err(JoinError::MissingUserName)
        ));
        assert!(matches!(
            JoinRequest::parse(r#"{"sessionId":"S1"}"#),
            Err(JoinError::MissingUserName)
        ));
        assert!(matches!(JoinRequest::parse("hello"), Err(JoinError::Json(_))));
    }
}
