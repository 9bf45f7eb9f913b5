//! Interactive process bridge
//!
//! One websocket per exec session. Output chunks travel as binary frames
//! tagged `'1'` (stdout) or `'2'` (stderr); the client sends `'1'` + input
//! bytes or `'r'` + big-endian width and height.

use std::fmt::{self, Display};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::future::OptionFuture;
use futures::{Stream, StreamExt};
use regex::Regex;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StreamState;
use super::codec::{
    CLOSE_CREATE_FAILED, CLOSE_INTERNAL, CLOSE_NORMAL, ClientFrame, CodecError, TAG_STDERR, TAG_STDOUT, tagged,
};
use super::writer::{FrameWriter, close};
use crate::auth::handshake::authenticate;
use crate::engine::{Engine, EngineError, ExecAttachment, ExecInput, ExecOptions, StreamKind};

/// Largest payload forwarded in one output frame.
pub const OUTPUT_CHUNK: usize = 1024;

/// Input chunks queued for the process before the client stops being read.
const INPUT_QUEUE: usize = 16;
/// How long a finished session waits for the process to take the rest of its input.
const INPUT_DRAIN: Duration = Duration::from_secs(1);

static ENV_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("static regex"));

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Protocol(#[from] CodecError),

    #[error("stderr is merged into stdout on a tty")]
    MergedStderr,

    #[error("invalid command: {0}")]
    Command(String),

    #[error("invalid detach keys: {0}")]
    DetachKeys(String),

    #[error("exec session is {actual}, expected {expected}")]
    State { actual: ExecState, expected: ExecState },

    #[error("transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Created,
    Attached,
    Streaming,
    Closed,
}

impl Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecState::Created => "created",
            ExecState::Attached => "attached",
            ExecState::Streaming => "streaming",
            ExecState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum ExecOutcome {
    /// The process ended. `None` when the engine could not tell the code.
    Exited(Option<i64>),
    Detached,
    /// The client went away first; the process keeps running.
    ClientClosed,
    Failed(BridgeError),
}

impl ExecOutcome {
    pub fn close_frame(&self) -> (u16, String) {
        match self {
            ExecOutcome::Exited(code) => (CLOSE_NORMAL, format!("ExitCode {}", code.unwrap_or(-1))),
            ExecOutcome::ClientClosed => (CLOSE_NORMAL, "ExitCode -1".to_string()),
            ExecOutcome::Detached => (CLOSE_NORMAL, "detached".to_string()),
            ExecOutcome::Failed(e) => (CLOSE_INTERNAL, e.to_string()),
        }
    }
}

/// Splits a command line shell-style. Leading `NAME=value` words become the
/// environment, the rest is the argument vector.
pub fn split_command(line: &str) -> Result<(Vec<String>, Vec<String>), BridgeError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(BridgeError::Command("unterminated single quote".to_string())),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(BridgeError::Command("unterminated double quote".to_string())),
                        },
                        Some(c) => current.push(c),
                        None => return Err(BridgeError::Command("unterminated double quote".to_string())),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err(BridgeError::Command("trailing backslash".to_string())),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }

    let env_count = words.iter().take_while(|word| ENV_WORD.is_match(word)).count();
    let cmd = words.split_off(env_count);
    Ok((words, cmd))
}

/// Parses docker's detach key notation, e.g. `ctrl-p,ctrl-q`.
pub fn parse_detach_keys(spec: &str) -> Result<Vec<u8>, BridgeError> {
    if spec.is_empty() {
        return Ok(Vec::new());
    }

    spec.split(',')
        .map(|key| {
            let key = key.trim();
            if let Some(name) = key.strip_prefix("ctrl-") {
                let mut chars = name.chars();
                match (chars.next(), chars.next()) {
                    (Some(c @ 'a'..='z'), None) => Ok(c as u8 - b'a' + 1),
                    (Some(c @ ('@' | '[' | '\\' | ']' | '^' | '_')), None) => Ok(c as u8 - b'@'),
                    _ => Err(BridgeError::DetachKeys(key.to_string())),
                }
            } else {
                match key.as_bytes() {
                    [byte] => Ok(*byte),
                    _ => Err(BridgeError::DetachKeys(key.to_string())),
                }
            }
        })
        .collect()
}

/// Watches client input for the detach sequence. Bytes that could start the
/// sequence are held back until they either complete it or stop matching.
#[derive(Debug, Clone, Default)]
pub struct DetachMatcher {
    keys: Vec<u8>,
    /// For each prefix of `keys`, the longest proper prefix that is also its suffix.
    fallback: Vec<usize>,
    matched: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Scanned {
    pub forward: Vec<u8>,
    pub detached: bool,
}

impl DetachMatcher {
    pub fn new(keys: Vec<u8>) -> Self {
        let mut fallback = vec![0; keys.len()];
        let mut len = 0;
        for i in 1..keys.len() {
            while len > 0 && keys[i] != keys[len] {
                len = fallback[len - 1];
            }
            if keys[i] == keys[len] {
                len += 1;
            }
            fallback[i] = len;
        }

        Self {
            keys,
            fallback,
            matched: 0,
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Scanned {
        if self.keys.is_empty() {
            return Scanned {
                forward: data.to_vec(),
                detached: false,
            };
        }

        let mut forward = Vec::with_capacity(data.len());
        for &byte in data {
            // release only the held bytes that can no longer start the sequence
            while self.matched > 0 && byte != self.keys[self.matched] {
                let keep = self.fallback[self.matched - 1];
                forward.extend_from_slice(&self.keys[..self.matched - keep]);
                self.matched = keep;
            }
            if byte == self.keys[self.matched] {
                self.matched += 1;
                if self.matched == self.keys.len() {
                    self.matched = 0;
                    return Scanned { forward, detached: true };
                }
            } else {
                forward.push(byte);
            }
        }
        Scanned {
            forward,
            detached: false,
        }
    }
}

/// Writes client input to the process from its own task, so a process that
/// stops reading stdin cannot stall output or cancellation.
struct StdinPump {
    tx: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<std::io::Result<()>>,
    stop: CancellationToken,
}

impl StdinPump {
    fn spawn(mut input: ExecInput, stop: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            let pump = async {
                while let Some(bytes) = rx.recv().await {
                    input.write_all(&bytes).await?;
                    input.flush().await?;
                }
                input.shutdown().await
            };
            tokio::select! {
                _ = task_stop.cancelled() => Ok(()),
                result = pump => result,
            }
        });

        Self { tx, task, stop }
    }

    /// Hands over what is still pending, closes the input and waits a bounded
    /// time for the process to take it.
    async fn finish(self, pending: Option<Vec<u8>>, exec_id: &str) {
        let StdinPump { tx, mut task, stop } = self;
        let drain = async {
            if let Some(bytes) = pending {
                let _ = tx.send(bytes).await;
            }
            drop(tx);
            (&mut task).await
        };

        match tokio::time::timeout(INPUT_DRAIN, drain).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => debug!(exec = %exec_id, "Closing process input failed: {}", e),
            Ok(Err(e)) => warn!(exec = %exec_id, "Process input task failed: {}", e),
            Err(_) => {
                debug!(exec = %exec_id, "Process input not drained, dropping it");
                stop.cancel();
            }
        }
    }
}

pub struct ExecBridge {
    engine: Arc<dyn Engine>,
    exec_id: String,
    options: ExecOptions,
    state: ExecState,
}

impl ExecBridge {
    pub async fn create(engine: Arc<dyn Engine>, container: &str, options: ExecOptions) -> Result<Self, BridgeError> {
        let exec_id = engine.create_exec(container, &options).await?;
        debug!(container, exec = %exec_id, "Exec session created");
        Ok(Self {
            engine,
            exec_id,
            options,
            state: ExecState::Created,
        })
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    fn advance(&mut self, from: ExecState, to: ExecState) -> Result<(), BridgeError> {
        if self.state != from {
            return Err(BridgeError::State {
                actual: self.state,
                expected: from,
            });
        }
        debug!(exec = %self.exec_id, "Exec {} -> {}", from, to);
        self.state = to;
        Ok(())
    }

    pub async fn start_detached(&mut self) -> Result<(), BridgeError> {
        self.advance(ExecState::Created, ExecState::Closed)?;
        self.engine.start_exec_detached(&self.exec_id).await?;
        Ok(())
    }

    pub async fn attach(&mut self) -> Result<ExecAttachment, BridgeError> {
        self.advance(ExecState::Created, ExecState::Attached)?;
        let mut attachment = self.engine.start_exec(&self.exec_id, self.options.tty).await?;
        if !self.options.interactive {
            attachment.input = None;
        }
        Ok(attachment)
    }

    /// Pumps frames both ways until the process exits, the client leaves,
    /// the client detaches, or `cancel` fires.
    pub async fn stream<R, E>(
        &mut self,
        attachment: ExecAttachment,
        client: &mut R,
        out: mpsc::Sender<Message>,
        mut detach: DetachMatcher,
        cancel: &CancellationToken,
    ) -> ExecOutcome
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        if let Err(e) = self.advance(ExecState::Attached, ExecState::Streaming) {
            return ExecOutcome::Failed(e);
        }
        let ExecAttachment { mut output, input } = attachment;
        let stdin = input.map(|input| StdinPump::spawn(input, cancel.child_token()));
        // one input chunk waiting for queue space; the client is not read meanwhile
        let mut pending: Option<Vec<u8>> = None;

        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break ExecOutcome::Failed(BridgeError::Transport("session stopped".to_string()));
                }
                Some(reserved) = OptionFuture::from(stdin.as_ref().map(|pump| pump.tx.reserve())),
                    if pending.is_some() =>
                {
                    match reserved {
                        Ok(permit) => {
                            if let Some(bytes) = pending.take() {
                                permit.send(bytes);
                            }
                        }
                        Err(_) => {
                            break ExecOutcome::Failed(BridgeError::Transport("process input closed".to_string()));
                        }
                    }
                }
                message = client.next(), if pending.is_none() => {
                    let data = match message {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                        Some(Ok(Message::Close(_))) | None => break ExecOutcome::ClientClosed,
                        Some(Err(e)) => {
                            debug!(exec = %self.exec_id, "Client read failed: {}", e);
                            break ExecOutcome::ClientClosed;
                        }
                    };
                    if stdin.is_none() {
                        continue;
                    }
                    match self.handle_client_frame(&data, &mut detach).await {
                        Ok(scanned) => {
                            if !scanned.forward.is_empty() {
                                pending = Some(scanned.forward);
                            }
                            if scanned.detached {
                                break ExecOutcome::Detached;
                            }
                        }
                        Err(e) => break ExecOutcome::Failed(e),
                    }
                }
                frame = output.next() => match frame {
                    Some(Ok(frame)) => {
                        let tag = match frame.kind {
                            StreamKind::Stdout => TAG_STDOUT,
                            StreamKind::Stderr if self.options.tty => {
                                break ExecOutcome::Failed(BridgeError::MergedStderr);
                            }
                            StreamKind::Stderr => TAG_STDERR,
                            StreamKind::StdinEcho => continue,
                            StreamKind::Error => {
                                let text = String::from_utf8_lossy(&frame.payload).into_owned();
                                break ExecOutcome::Failed(EngineError::Other(text).into());
                            }
                        };
                        if let Err(e) = forward_output(&out, tag, &frame.payload).await {
                            break ExecOutcome::Failed(e);
                        }
                    }
                    Some(Err(e)) => break ExecOutcome::Failed(e.into()),
                    None => break self.exit_status().await,
                },
            }
        };

        if let Some(stdin) = stdin {
            stdin.finish(pending.take(), &self.exec_id).await;
        }
        drop(output);
        self.state = ExecState::Closed;
        outcome
    }

    /// Applies a resize right away; input comes back as the bytes to forward.
    async fn handle_client_frame(&self, data: &[u8], detach: &mut DetachMatcher) -> Result<Scanned, BridgeError> {
        match ClientFrame::decode(data)? {
            None => Ok(Scanned {
                forward: Vec::new(),
                detached: false,
            }),
            Some(ClientFrame::Resize { width, height }) => {
                self.engine.resize_exec(&self.exec_id, width, height).await?;
                Ok(Scanned {
                    forward: Vec::new(),
                    detached: false,
                })
            }
            Some(ClientFrame::Input(bytes)) => Ok(detach.feed(&bytes)),
        }
    }

    async fn exit_status(&self) -> ExecOutcome {
        match self.engine.inspect_exec(&self.exec_id).await {
            Ok(status) => ExecOutcome::Exited(status.exit_code),
            Err(e) => {
                warn!(exec = %self.exec_id, "Failed to inspect finished exec: {}", e);
                ExecOutcome::Exited(None)
            }
        }
    }
}

async fn forward_output(out: &mpsc::Sender<Message>, tag: u8, payload: &[u8]) -> Result<(), BridgeError> {
    for chunk in payload.chunks(OUTPUT_CHUNK) {
        out.send(Message::Binary(tagged(tag, chunk)))
            .await
            .map_err(|_| BridgeError::Transport("output queue closed".to_string()))?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecQuery {
    #[serde(default)]
    pub cmd: String,
    pub interactive: Option<String>,
    pub tty: Option<String>,
    pub user: Option<String>,
    pub detach: Option<String>,
    #[serde(rename = "detachKeys")]
    pub detach_keys: Option<String>,
}

fn flag(value: &Option<String>) -> bool {
    value.as_deref() == Some("1")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub options: ExecOptions,
    pub detach: bool,
    pub detach_keys: Vec<u8>,
}

impl ExecQuery {
    /// Validates the query before the upgrade so bad requests get a plain HTTP error.
    pub fn into_request(self, default_detach_keys: &str) -> Result<ExecRequest, BridgeError> {
        let (env, cmd) = split_command(&self.cmd)?;
        if cmd.first().is_none_or(|program| program.is_empty()) {
            return Err(BridgeError::Command("command is not specified".to_string()));
        }

        let interactive = flag(&self.interactive);
        let detach = flag(&self.detach);
        if interactive && detach {
            return Err(BridgeError::Command(
                "interactive and detach cannot be combined".to_string(),
            ));
        }

        let detach_keys = parse_detach_keys(self.detach_keys.as_deref().unwrap_or(default_detach_keys))?;

        Ok(ExecRequest {
            options: ExecOptions {
                cmd,
                env,
                user: self.user.filter(|user| !user.is_empty()),
                interactive,
                tty: flag(&self.tty),
            },
            detach,
            detach_keys,
        })
    }
}

pub async fn exec_handler(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    Query(query): Query<ExecQuery>,
    State(state): State<StreamState>,
) -> Response {
    let request = match query.into_request(&state.settings.detach_keys) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    ws.on_upgrade(move |socket| handle_exec(socket, state, name, request))
}

async fn handle_exec(socket: WebSocket, state: StreamState, container: String, request: ExecRequest) {
    let (mut sink, mut stream) = socket.split();
    let Some(_lease) = authenticate(&mut sink, &mut stream, &state.sessions).await else {
        return;
    };

    let mut bridge = match ExecBridge::create(state.engine.clone(), &container, request.options).await {
        Ok(bridge) => bridge,
        Err(e) => {
            warn!(container = %container, "Exec creation failed: {}", e);
            close(&mut sink, CLOSE_CREATE_FAILED, &e.to_string()).await;
            return;
        }
    };

    if request.detach {
        match bridge.start_detached().await {
            Ok(()) => close(&mut sink, CLOSE_NORMAL, "").await,
            Err(e) => close(&mut sink, CLOSE_CREATE_FAILED, &e.to_string()).await,
        }
        return;
    }

    let attachment = match bridge.attach().await {
        Ok(attachment) => attachment,
        Err(e) => {
            close(&mut sink, CLOSE_INTERNAL, &e.to_string()).await;
            return;
        }
    };

    let stop = state.shutdown.child_token();
    let writer = FrameWriter::spawn(sink, state.settings.outbound_queue, state.settings.keepalive, stop.clone());
    let outcome = bridge
        .stream(
            attachment,
            &mut stream,
            writer.sender(),
            DetachMatcher::new(request.detach_keys),
            &stop,
        )
        .await;

    let (code, reason) = outcome.close_frame();
    info!(container = %container, "Exec session ended: {}", reason);
    writer.finish(code, &reason).await;
}
