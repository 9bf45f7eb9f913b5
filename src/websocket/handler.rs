//! WebSocket handler for the subscription connection
//!
//! One reader, one writer and a task per in-flight request. Shutdown runs in
//! a fixed order: stop reading, cancel and join every handler, close the
//! outbound queue, let the writer drain, then send the close frame.

use std::fmt::{self, Display};
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{Sink, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::{CLOSE_INTERNAL, CLOSE_NORMAL, RequestEnvelope, ResponseEnvelope};
use super::host::HostProbe;
use super::registry::SubscriptionRegistry;
use super::writer::{close, run_writer};
use super::{StreamSettings, StreamState, subscriptions};
use crate::auth::handshake::authenticate;
use crate::engine::{Engine, EngineFeatures, EngineVersion};

/// Everything a request handler may touch, scoped to one connection
#[derive(Clone)]
pub struct SessionContext {
    pub engine: Arc<dyn Engine>,
    pub host: Arc<dyn HostProbe>,
    pub features: EngineFeatures,
    pub registry: Arc<SubscriptionRegistry>,
    pub settings: StreamSettings,
}

/// Producer side of the connection's outbound queue
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<ResponseEnvelope>,
}

impl Outbound {
    /// Queues `envelope` unless `cancel` fires first. Returns whether it was queued.
    pub async fn send(&self, cancel: &CancellationToken, envelope: ResponseEnvelope) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.tx.send(envelope) => sent.is_ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Stopped => "stopped",
        })
    }
}

/// Handle WebSocket upgrade request
pub async fn subscribe_handler(ws: WebSocketUpgrade, State(state): State<StreamState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: StreamState) {
    let (mut sink, mut stream) = socket.split();

    let Some(lease) = authenticate(&mut sink, &mut stream, &state.sessions).await else {
        return;
    };

    let version = match state.engine.version().await {
        Ok(version) => version,
        Err(e) => {
            warn!("Engine version unavailable, sampling without engine-side intervals: {}", e);
            EngineVersion::default()
        }
    };
    let features = EngineFeatures::detect(version);
    debug!("Engine {} features: {:?}", version, features);

    let ctx = SessionContext {
        engine: state.engine.clone(),
        host: state.host.clone(),
        features,
        registry: Arc::new(SubscriptionRegistry::new()),
        settings: state.settings.clone(),
    };

    run_session(sink, stream, ctx, state.shutdown.child_token()).await;
    drop(lease);
}

fn encode_envelope(envelope: ResponseEnvelope) -> Option<Message> {
    match envelope.encode() {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            error!(index = envelope.index, "Dropping unencodable envelope: {}", e);
            None
        }
    }
}

/// Runs one connection to completion. Cancelling `master` ends it.
pub async fn run_session<S, R, E>(sink: S, mut stream: R, ctx: SessionContext, master: CancellationToken)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut phase = Phase::Running;
    info!("Session {}", phase);

    let (tx, rx) = mpsc::channel(ctx.settings.outbound_queue.max(1));
    let writer = tokio::spawn(run_writer(
        sink,
        rx,
        ctx.settings.keepalive,
        encode_envelope,
        master.clone(),
    ));
    let outbound = Outbound { tx };

    let mut handlers = JoinSet::new();
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            _ = master.cancelled() => break,

            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    error!("Request handler crashed: {}", e);
                }
            }

            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            failure = Some(format!("invalid request: {}", e));
                            break;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        failure = Some(e.to_string());
                        break;
                    }
                };

                match RequestEnvelope::decode(&text) {
                    Ok(request) => {
                        debug!(index = request.index, action = %request.action, "Request");
                        handlers.spawn(subscriptions::dispatch(
                            ctx.clone(),
                            request,
                            outbound.clone(),
                            master.child_token(),
                        ));
                    }
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }
        }
    }

    phase = Phase::Draining;
    info!("Session {}, waiting on {} handlers", phase, handlers.len());
    master.cancel();
    while let Some(joined) = handlers.join_next().await {
        if let Err(e) = joined {
            error!("Request handler crashed: {}", e);
        }
    }

    // no producer is left once every handler has been joined
    drop(outbound);
    let (mut sink, write_failure) = match writer.await {
        Ok(done) => done,
        Err(e) => {
            error!("Writer task crashed: {}", e);
            return;
        }
    };

    match failure.or(write_failure) {
        None => close(&mut sink, CLOSE_NORMAL, "").await,
        Some(reason) => {
            warn!("Session ended with error: {}", reason);
            close(&mut sink, CLOSE_INTERNAL, &reason).await;
        }
    }

    phase = Phase::Stopped;
    info!("Session {}", phase);
}
