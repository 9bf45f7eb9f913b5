//! Image pull with live progress
//!
//! Text frames: `'0'` + progress JSON while pulling, then `'s'` + the image
//! id. A failed pull closes with 4000; text too long for a close reason is
//! sent first as `'e'` + text.

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::StreamState;
use super::codec::{CLOSE_NORMAL, CLOSE_PULL_FAILED, MAX_CLOSE_REASON, TAG_ERROR, TAG_PROGRESS, TAG_SUCCESS};
use super::writer::{FrameWriter, client_closed};
use crate::auth::handshake::authenticate;
use crate::engine::{Engine, EngineError};

#[derive(Debug, Default, Deserialize)]
pub struct PullQuery {
    pub name: Option<String>,
}

#[derive(Debug)]
pub enum PullOutcome {
    Pulled(String),
    ClientClosed,
    Failed(String),
}

fn tagged_text(tag: u8, body: &str) -> Message {
    let mut text = String::with_capacity(body.len() + 1);
    text.push(tag as char);
    text.push_str(body);
    Message::Text(text)
}

/// Frames to send after the pull ended, close frame last.
pub fn closing_frames(outcome: &PullOutcome) -> (Vec<Message>, u16, String) {
    match outcome {
        PullOutcome::Pulled(id) => (vec![tagged_text(TAG_SUCCESS, id)], CLOSE_NORMAL, String::new()),
        PullOutcome::ClientClosed => (Vec::new(), CLOSE_NORMAL, String::new()),
        PullOutcome::Failed(text) if text.len() > MAX_CLOSE_REASON => {
            (vec![tagged_text(TAG_ERROR, text)], CLOSE_PULL_FAILED, String::new())
        }
        PullOutcome::Failed(text) => (Vec::new(), CLOSE_PULL_FAILED, text.clone()),
    }
}

pub async fn run_pull<R, E>(
    engine: Arc<dyn Engine>,
    name: &str,
    client: &mut R,
    out: mpsc::Sender<Message>,
    cancel: &CancellationToken,
) -> PullOutcome
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut progress = engine.pull_image(name);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return PullOutcome::Failed("session stopped".to_string()),
            _ = client_closed(client) => return PullOutcome::ClientClosed,
            item = progress.next() => match item {
                Some(Ok(value)) => {
                    if out.send(tagged_text(TAG_PROGRESS, &value.to_string())).await.is_err() {
                        return PullOutcome::Failed("output queue closed".to_string());
                    }
                }
                Some(Err(e)) => return PullOutcome::Failed(e.to_string()),
                None => break,
            },
        }
    }

    match engine.inspect_image(name).await {
        Ok(id) => PullOutcome::Pulled(id),
        Err(EngineError::NotFound(_)) => PullOutcome::Failed(format!("image {} was not pulled", name)),
        Err(e) => PullOutcome::Failed(e.to_string()),
    }
}

pub async fn pull_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<PullQuery>,
    State(state): State<StreamState>,
) -> Response {
    match query.name.filter(|name| !name.is_empty()) {
        Some(name) => ws.on_upgrade(move |socket| handle_pull(socket, state, name)),
        None => (StatusCode::BAD_REQUEST, "image name is not specified").into_response(),
    }
}

async fn handle_pull(socket: WebSocket, state: StreamState, name: String) {
    let (mut sink, mut stream) = socket.split();
    let Some(_lease) = authenticate(&mut sink, &mut stream, &state.sessions).await else {
        return;
    };

    let writer = FrameWriter::spawn(
        sink,
        state.settings.outbound_queue,
        state.settings.keepalive,
        state.shutdown.child_token(),
    );
    info!(image = %name, "Pulling image");
    let outcome = run_pull(state.engine.clone(), &name, &mut stream, writer.sender(), writer.stopped()).await;

    match &outcome {
        PullOutcome::Pulled(id) => info!(image = %name, "Pulled image {}", id),
        PullOutcome::Failed(e) => warn!(image = %name, "Image pull failed: {}", e),
        PullOutcome::ClientClosed => {}
    }

    let (frames, code, reason) = closing_frames(&outcome);
    for frame in frames {
        writer.send(frame).await;
    }
    writer.finish(code, &reason).await;
}
