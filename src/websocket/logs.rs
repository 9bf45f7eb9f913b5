//! Container log streaming
//!
//! Output only. Every text frame is `'1'` or `'2'` followed by a chunk of
//! stdout or stderr. Client messages are read and dropped so a close is noticed.

use std::fmt::Display;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::StreamState;
use super::codec::{CLOSE_NORMAL, TAG_STDERR, TAG_STDOUT};
use super::exec::BridgeError;
use super::writer::{FrameWriter, StreamOutcome, client_closed};
use crate::auth::handshake::authenticate;
use crate::engine::{EngineError, FrameFeed, LogOptions, StreamKind};

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub follow: Option<String>,
    pub tail: Option<String>,
}

impl From<LogsQuery> for LogOptions {
    fn from(query: LogsQuery) -> Self {
        LogOptions {
            follow: query.follow.as_deref() == Some("1"),
            tail: query.tail.filter(|tail| !tail.is_empty()),
        }
    }
}

fn text_frame(tag: u8, payload: &[u8]) -> Message {
    let mut text = String::with_capacity(payload.len() + 1);
    text.push(tag as char);
    text.push_str(&String::from_utf8_lossy(payload));
    Message::Text(text)
}

pub async fn stream_logs<R, E>(
    mut feed: FrameFeed,
    client: &mut R,
    out: mpsc::Sender<Message>,
    cancel: &CancellationToken,
) -> StreamOutcome
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                return StreamOutcome::Failed(BridgeError::Transport("session stopped".to_string()));
            }
            _ = client_closed(client) => return StreamOutcome::ClientClosed,
            frame = feed.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return StreamOutcome::Failed(e.into()),
                    None => return StreamOutcome::Finished,
                };
                let tag = match frame.kind {
                    StreamKind::Stdout => TAG_STDOUT,
                    StreamKind::Stderr => TAG_STDERR,
                    StreamKind::StdinEcho => continue,
                    StreamKind::Error => {
                        let text = String::from_utf8_lossy(&frame.payload).into_owned();
                        return StreamOutcome::Failed(EngineError::Other(text).into());
                    }
                };
                if out.send(text_frame(tag, &frame.payload)).await.is_err() {
                    return StreamOutcome::Failed(BridgeError::Transport("output queue closed".to_string()));
                }
            }
        }
    }
}

pub async fn logs_handler(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
    State(state): State<StreamState>,
) -> Response {
    let options = LogOptions::from(query);
    ws.on_upgrade(move |socket| handle_logs(socket, state, name, options))
}

async fn handle_logs(socket: WebSocket, state: StreamState, container: String, options: LogOptions) {
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
    let feed = state.engine.logs(&container, options);
    let outcome = stream_logs(feed, &mut stream, writer.sender(), writer.stopped()).await;

    debug!(container = %container, "Log stream ended: {:?}", outcome);
    let (code, reason) = outcome.close_frame();
    if code != CLOSE_NORMAL {
        info!(container = %container, "Log stream failed: {}", reason);
    }
    writer.finish(code, &reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecFrame;
    use crate::websocket::codec::CLOSE_INTERNAL;
    use futures::channel::mpsc as fmpsc;

    fn feed(items: Vec<Result<ExecFrame, EngineError>>) -> FrameFeed {
        futures::stream::iter(items).boxed()
    }

    #[test]
    fn test_query_to_options() {
        let options = LogOptions::from(LogsQuery {
            follow: Some("1".to_string()),
            tail: Some("100".to_string()),
        });
        assert!(options.follow);
        assert_eq!(options.tail.as_deref(), Some("100"));

        let options = LogOptions::from(LogsQuery {
            follow: Some("true".to_string()),
            tail: Some(String::new()),
        });
        assert_eq!(options, LogOptions::default());
    }

    #[tokio::test]
    async fn test_frames_are_tagged_text() {
        let (_client_tx, mut client) = fmpsc::unbounded::<Result<Message, String>>();
        let (out, mut frames) = mpsc::channel(8);
        let outcome = stream_logs(
            feed(vec![
                Ok(ExecFrame::new(StreamKind::Stdout, "booting\n")),
                Ok(ExecFrame::new(StreamKind::Stderr, "warn\n")),
            ]),
            &mut client,
            out,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(outcome, StreamOutcome::Finished));
        assert_eq!(outcome.close_frame(), (CLOSE_NORMAL, String::new()));
        assert_eq!(frames.recv().await, Some(Message::Text("1booting\n".to_string())));
        assert_eq!(frames.recv().await, Some(Message::Text("2warn\n".to_string())));
        assert_eq!(frames.recv().await, None);
    }

    #[tokio::test]
    async fn test_engine_error_closes_internal() {
        let (_client_tx, mut client) = fmpsc::unbounded::<Result<Message, String>>();
        let (out, _frames) = mpsc::channel(8);
        let outcome = stream_logs(
            feed(vec![Err(EngineError::NotFound("web".to_string()))]),
            &mut client,
            out,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.close_frame(), (CLOSE_INTERNAL, "web not found".to_string()));
    }

    #[tokio::test]
    async fn test_client_close_stops_following() {
        let (client_tx, mut client) = fmpsc::unbounded::<Result<Message, String>>();
        client_tx.unbounded_send(Ok(Message::Text("ignored".to_string()))).unwrap();
        client_tx.unbounded_send(Ok(Message::Close(None))).unwrap();

        let (out, _frames) = mpsc::channel(8);
        let outcome = stream_logs(futures::stream::pending().boxed(), &mut client, out, &CancellationToken::new()).await;
        assert!(matches!(outcome, StreamOutcome::ClientClosed));
    }

    #[tokio::test]
    async fn test_engine_logs_request() {
        use crate::engine::Engine;
        use crate::engine::fake::FakeEngine;

        let engine = FakeEngine::new();
        engine.set_log_frames(vec![ExecFrame::new(StreamKind::Stdout, "a")]);
        let (_client_tx, mut client) = fmpsc::unbounded::<Result<Message, String>>();
        let (out, mut frames) = mpsc::channel(8);

        let options = LogOptions {
            follow: true,
            tail: Some("5".to_string()),
        };
        let outcome = stream_logs(engine.logs("web", options.clone()), &mut client, out, &CancellationToken::new()).await;

        assert!(matches!(outcome, StreamOutcome::Finished));
        assert_eq!(engine.log_requests(), vec![("web".to_string(), options)]);
        assert_eq!(frames.recv().await, Some(Message::Text("1a".to_string())));
    }
}
