//! Single serialized writer for one websocket
//!
//! Every producer on a connection goes through one bounded queue so frames
//! never interleave. The writer also sends keepalive pings when idle.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::codec::{CLOSE_INTERNAL, CLOSE_NORMAL, close_message};
use super::exec::BridgeError;

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(20);

/// Drains `queue` onto `sink` until every sender is gone.
///
/// A failed write (keepalive included) cancels `on_failure` and the rest of
/// the queue is discarded, so producers never block on a dead transport.
/// Returns the sink for the final close frame and the first failure, if any.
pub async fn run_writer<S, T, F>(
    mut sink: S,
    mut queue: mpsc::Receiver<T>,
    keepalive: Duration,
    encode: F,
    on_failure: CancellationToken,
) -> (S, Option<String>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    F: Fn(T) -> Option<Message>,
{
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            item = queue.recv() => {
                let Some(item) = item else {
                    break;
                };
                if failure.is_some() {
                    continue;
                }
                let Some(message) = encode(item) else {
                    continue;
                };
                if let Err(e) = sink.send(message).await {
                    debug!("Websocket write failed: {}", e);
                    failure = Some(e.to_string());
                    on_failure.cancel();
                }
            }
            _ = sleep(keepalive), if failure.is_none() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    debug!("Keepalive ping failed: {}", e);
                    failure = Some(e.to_string());
                    on_failure.cancel();
                }
            }
        }
    }

    (sink, failure)
}

/// Writer for the byte-stream endpoints, which queue ready-made frames.
pub struct FrameWriter<S> {
    tx: mpsc::Sender<Message>,
    task: JoinHandle<(S, Option<String>)>,
    stop: CancellationToken,
}

impl<S> FrameWriter<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    /// `stop` is cancelled when a write fails, so it can be shared with the
    /// producer that should give up at the same moment.
    pub fn spawn(sink: S, queue: usize, keepalive: Duration, stop: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let task = tokio::spawn(run_writer(sink, rx, keepalive, Some, stop.clone()));
        Self {
            tx,
            task,
            stop,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.tx.clone()
    }

    /// Cancelled once a write to the client has failed, or by the owner of the token.
    pub fn stopped(&self) -> &CancellationToken {
        &self.stop
    }

    pub async fn send(&self, message: Message) -> bool {
        !self.stop.is_cancelled() && self.tx.send(message).await.is_ok()
    }

    /// Drains what is queued, then closes with `code` unless the transport already failed.
    pub async fn finish(self, code: u16, reason: &str) {
        drop(self.tx);
        match self.task.await {
            Ok((mut sink, None)) => close(&mut sink, code, reason).await,
            Ok((_, Some(failure))) => debug!("Skipping close frame after write failure: {}", failure),
            Err(e) => tracing::error!("Writer task crashed: {}", e),
        }
    }
}

/// How an output-only stream (logs, events) came to an end
#[derive(Debug)]
pub enum StreamOutcome {
    Finished,
    ClientClosed,
    Failed(BridgeError),
}

impl StreamOutcome {
    pub fn close_frame(&self) -> (u16, String) {
        match self {
            StreamOutcome::Finished | StreamOutcome::ClientClosed => (CLOSE_NORMAL, String::new()),
            StreamOutcome::Failed(e) => (CLOSE_INTERNAL, e.to_string()),
        }
    }
}

/// Resolves once the client closes or its connection breaks. Anything it
/// sends on an output-only stream is dropped. Cancel safe.
pub async fn client_closed<R, E>(client: &mut R)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        match client.next().await {
            Some(Ok(Message::Close(_))) | None => return,
            Some(Err(e)) => {
                debug!("Client read failed: {}", e);
                return;
            }
            Some(Ok(_)) => {}
        }
    }
}

/// Sends the final close frame. Failures here have nowhere left to go.
pub async fn close<S>(sink: &mut S, code: u16, reason: &str)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    if let Err(e) = sink.send(close_message(code, reason)).await {
        debug!("Close frame not delivered: {}", e);
    }
    let _ = sink.close().await;
}
