//! Raw engine event stream for one resource type

use std::fmt::Display;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::StreamState;
use super::codec::CLOSE_NORMAL;
use super::exec::BridgeError;
use super::writer::{FrameWriter, StreamOutcome, client_closed};
use crate::auth::handshake::authenticate;
use crate::engine::{EngineError, EngineEvent, EventFeed, EventFilter, ResourceKind};

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub id: Option<String>,
    #[serde(rename = "needOkResp")]
    pub need_ok_resp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsRequest {
    pub kind: ResourceKind,
    pub id: Option<String>,
    pub acknowledge: bool,
}

impl EventsQuery {
    pub fn into_request(self) -> Result<EventsRequest, String> {
        let kind = match self.kind.as_deref() {
            Some("container") => ResourceKind::Container,
            Some("image") => ResourceKind::Image,
            _ => return Err("invalid event type".to_string()),
        };
        Ok(EventsRequest {
            kind,
            id: self.id.filter(|id| !id.is_empty()),
            acknowledge: self.need_ok_resp.as_deref() == Some("1"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub id: String,
    pub name: String,
}

impl From<&EngineEvent> for EventMessage {
    fn from(event: &EngineEvent) -> Self {
        Self {
            kind: event.kind.as_str().to_string(),
            action: event.action.to_string(),
            id: event.actor_id.clone(),
            name: event.name().unwrap_or_default().to_string(),
        }
    }
}

pub async fn stream_events<R, E>(
    mut feed: EventFeed,
    id: Option<&str>,
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
            event = feed.next() => {
                let event = match event {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => return StreamOutcome::Failed(e.into()),
                    None => return StreamOutcome::Finished,
                };
                if id.is_some_and(|id| !event.matches_id(id)) {
                    continue;
                }
                let text = match serde_json::to_string(&EventMessage::from(&event)) {
                    Ok(text) => text,
                    Err(e) => return StreamOutcome::Failed(EngineError::from(e).into()),
                };
                if out.send(Message::Text(text)).await.is_err() {
                    return StreamOutcome::Failed(BridgeError::Transport("output queue closed".to_string()));
                }
            }
        }
    }
}

pub async fn events_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<EventsQuery>,
    State(state): State<StreamState>,
) -> Response {
    match query.into_request() {
        Ok(request) => ws.on_upgrade(move |socket| handle_events(socket, state, request)),
        Err(e) => (StatusCode::BAD_REQUEST, e).into_response(),
    }
}

async fn handle_events(socket: WebSocket, state: StreamState, request: EventsRequest) {
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
    let feed = state.engine.events(EventFilter::only(request.kind));
    if request.acknowledge {
        writer.send(Message::Text("true".to_string())).await;
    }

    let outcome = stream_events(
        feed,
        request.id.as_deref(),
        &mut stream,
        writer.sender(),
        writer.stopped(),
    )
    .await;

    debug!(kind = request.kind.as_str(), "Event stream ended: {:?}", outcome);
    let (code, reason) = outcome.close_frame();
    if code != CLOSE_NORMAL {
        info!("Event stream failed: {}", reason);
    }
    writer.finish(code, &reason).await;
}
