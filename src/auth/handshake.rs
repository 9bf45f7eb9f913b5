//! First-message authentication for streaming connections

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, Stream, StreamExt};
use tokio::time::timeout;

use super::tokens::SessionStore;
use crate::websocket::codec::CLOSE_AUTH_FAILED;
use crate::websocket::writer::close;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Holds a session key for the lifetime of one connection.
pub struct SessionLease {
    store: Arc<SessionStore>,
    key: String,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Err(e) = self.store.release(&self.key) {
            tracing::warn!("Failed to release session key: {}", e);
        }
    }
}

async fn first_credential<R, E>(stream: &mut R) -> Option<String>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => return Some(text.trim().to_string()),
            Ok(Message::Binary(bytes)) => {
                return Some(String::from_utf8_lossy(&bytes).trim().to_string());
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
}

/// Reads the bearer key and validates it. On failure the socket is closed
/// with the authentication code and `None` is returned.
pub async fn authenticate<S, R, E>(sink: &mut S, stream: &mut R, sessions: &Arc<SessionStore>) -> Option<SessionLease>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let key = match timeout(HANDSHAKE_TIMEOUT, first_credential(stream)).await {
        Ok(Some(key)) => key,
        Ok(None) => {
            tracing::debug!("Client left before authenticating");
            return None;
        }
        Err(_) => {
            tracing::warn!("Authentication timed out");
            close(sink, CLOSE_AUTH_FAILED, "authentication timeout").await;
            return None;
        }
    };

    match sessions.acquire(&key) {
        Ok(true) => Some(SessionLease {
            store: sessions.clone(),
            key,
        }),
        Ok(false) => {
            close(sink, CLOSE_AUTH_FAILED, "invalid key").await;
            None
        }
        Err(e) => {
            tracing::error!("Session store failure: {}", e);
            close(sink, CLOSE_AUTH_FAILED, "invalid key").await;
            None
        }
    }
}
