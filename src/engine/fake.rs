//! Scriptable in-memory engine for tests

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::{ContainerInspectResponse, ContainerSummary, ImageSummary};
use futures::StreamExt;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    Engine, EngineError, EngineEvent, EngineVersion, EventAction, EventFeed, EventFilter, ExecAttachment,
    ExecFrame, ExecOptions, ExecStatus, FrameFeed, LogOptions, ProgressFeed, RawReport, ResourceKind,
    SampleFeed,
};

type EventSender = mpsc::UnboundedSender<Result<EngineEvent, EngineError>>;
type ReportSender = mpsc::UnboundedSender<Result<RawReport, EngineError>>;
type FrameSender = mpsc::UnboundedSender<Result<ExecFrame, EngineError>>;

/// Test side of a scripted exec session
pub struct ExecScript {
    pub output: FrameSender,
    /// Reads whatever the bridge forwarded to the process.
    pub input: DuplexStream,
}

#[derive(Default)]
struct FakeState {
    version: EngineVersion,
    containers: Vec<ContainerSummary>,
    images: Vec<ImageSummary>,
    fail_listing: bool,
    fail_create_exec: bool,
    event_feeds: Vec<(EventFilter, EventSender)>,
    report_feeds: Vec<ReportSender>,
    stats_requests: Vec<(Option<String>, Duration)>,
    exec_options: Vec<ExecOptions>,
    exec_parts: Option<(mpsc::UnboundedReceiver<Result<ExecFrame, EngineError>>, DuplexStream)>,
    detached_starts: usize,
    resizes: Vec<(u16, u16)>,
    exit_code: Option<i64>,
    log_frames: Vec<ExecFrame>,
    log_requests: Vec<(String, LogOptions)>,
    progress: Vec<Result<serde_json::Value, String>>,
    image_id: Option<String>,
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

pub fn container(id: &str, state: &str) -> ContainerSummary {
    ContainerSummary {
        id: Some(id.to_string()),
        names: Some(vec![format!("/{}", id)]),
        state: Some(state.to_string()),
        ..Default::default()
    }
}

pub fn image(id: &str, created: i64) -> ImageSummary {
    ImageSummary {
        id: id.to_string(),
        created,
        ..Default::default()
    }
}

pub fn event(kind: ResourceKind, action: &str, id: &str) -> EngineEvent {
    EngineEvent::new(kind, EventAction::parse(action), id)
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_containers(&self, containers: Vec<ContainerSummary>) {
        self.state().containers = containers;
    }

    pub fn set_images(&self, images: Vec<ImageSummary>) {
        self.state().images = images;
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state().fail_listing = fail;
    }

    pub fn fail_create_exec(&self) {
        self.state().fail_create_exec = true;
    }

    /// Delivers an event to every open feed whose filter admits it.
    pub fn emit(&self, event: EngineEvent) {
        let state = self.state();
        for (filter, sender) in &state.event_feeds {
            if filter.kinds.is_empty() || filter.kinds.contains(&event.kind) {
                let _ = sender.send(Ok(event.clone()));
            }
        }
    }

    /// Breaks every open event feed with an upstream error.
    pub fn fail_feeds(&self, message: &str) {
        let state = self.state();
        for (_, sender) in &state.event_feeds {
            let _ = sender.send(Err(EngineError::Other(message.to_string())));
        }
    }

    pub fn feeds_open(&self) -> usize {
        self.state()
            .event_feeds
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .count()
    }

    pub async fn wait_for_feeds(&self, count: usize) {
        while self.feeds_open() < count {
            tokio::task::yield_now().await;
        }
    }

    pub fn push_report(&self, report: RawReport) {
        for sender in &self.state().report_feeds {
            let _ = sender.send(Ok(report.clone()));
        }
    }

    pub fn report_feeds_open(&self) -> usize {
        self.state()
            .report_feeds
            .iter()
            .filter(|sender| !sender.is_closed())
            .count()
    }

    pub async fn wait_for_report_feed(&self) {
        while self.report_feeds_open() == 0 {
            tokio::task::yield_now().await;
        }
    }

    pub fn stats_requests(&self) -> Vec<(Option<String>, Duration)> {
        self.state().stats_requests.clone()
    }

    /// Prepares the next attached exec start and hands back the test side.
    pub fn script_exec(&self) -> ExecScript {
        let (output, output_rx) = mpsc::unbounded_channel();
        let (engine_side, test_side) = tokio::io::duplex(1024);
        self.state().exec_parts = Some((output_rx, engine_side));
        ExecScript {
            output,
            input: test_side,
        }
    }

    pub fn set_exit_code(&self, code: Option<i64>) {
        self.state().exit_code = code;
    }

    pub fn exec_options(&self) -> Vec<ExecOptions> {
        self.state().exec_options.clone()
    }

    pub fn detached_starts(&self) -> usize {
        self.state().detached_starts
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.state().resizes.clone()
    }

    pub fn set_log_frames(&self, frames: Vec<ExecFrame>) {
        self.state().log_frames = frames;
    }

    pub fn log_requests(&self) -> Vec<(String, LogOptions)> {
        self.state().log_requests.clone()
    }

    pub fn set_pull(&self, progress: Vec<Result<serde_json::Value, String>>, image_id: Option<&str>) {
        let mut state = self.state();
        state.progress = progress;
        state.image_id = image_id.map(str::to_string);
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn version(&self) -> Result<EngineVersion, EngineError> {
        Ok(self.state().version)
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        let state = self.state();
        if state.fail_listing {
            return Err(EngineError::Other("engine unavailable".to_string()));
        }
        Ok(state.containers.clone())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, EngineError> {
        let state = self.state();
        state
            .containers
            .iter()
            .find(|c| c.id.as_deref().is_some_and(|cid| cid.starts_with(id)))
            .map(|c| ContainerInspectResponse {
                id: c.id.clone(),
                name: c.names.as_ref().and_then(|names| names.first().cloned()),
                ..Default::default()
            })
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        let state = self.state();
        if state.fail_listing {
            return Err(EngineError::Other("engine unavailable".to_string()));
        }
        Ok(state.images.clone())
    }

    fn events(&self, filter: EventFilter) -> EventFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().event_feeds.push((filter, tx));
        UnboundedReceiverStream::new(rx).boxed()
    }

    fn stats(&self, target: Option<String>, interval: Duration) -> SampleFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.stats_requests.push((target, interval));
        state.report_feeds.push(tx);
        UnboundedReceiverStream::new(rx).boxed()
    }

    async fn create_exec(&self, container: &str, options: &ExecOptions) -> Result<String, EngineError> {
        let mut state = self.state();
        if state.fail_create_exec {
            return Err(EngineError::NotFound(container.to_string()));
        }
        state.exec_options.push(options.clone());
        Ok(format!("exec-{}", state.exec_options.len()))
    }

    async fn start_exec(&self, _exec_id: &str, _tty: bool) -> Result<ExecAttachment, EngineError> {
        match self.state().exec_parts.take() {
            Some((output, input)) => Ok(ExecAttachment {
                output: UnboundedReceiverStream::new(output).boxed(),
                input: Some(Box::pin(input)),
            }),
            None => Ok(ExecAttachment {
                output: futures::stream::empty().boxed(),
                input: Some(Box::pin(tokio::io::sink())),
            }),
        }
    }

    async fn start_exec_detached(&self, _exec_id: &str) -> Result<(), EngineError> {
        self.state().detached_starts += 1;
        Ok(())
    }

    async fn resize_exec(&self, _exec_id: &str, width: u16, height: u16) -> Result<(), EngineError> {
        self.state().resizes.push((width, height));
        Ok(())
    }

    async fn inspect_exec(&self, _exec_id: &str) -> Result<ExecStatus, EngineError> {
        Ok(ExecStatus {
            exit_code: self.state().exit_code,
            running: false,
        })
    }

    fn logs(&self, container: &str, options: LogOptions) -> FrameFeed {
        let mut state = self.state();
        state.log_requests.push((container.to_string(), options));
        let frames = state.log_frames.clone();
        futures::stream::iter(frames.into_iter().map(Ok)).boxed()
    }

    fn pull_image(&self, _name: &str) -> ProgressFeed {
        let progress = self.state().progress.clone();
        futures::stream::iter(
            progress
                .into_iter()
                .map(|item| item.map_err(EngineError::Other)),
        )
        .boxed()
    }

    async fn inspect_image(&self, name: &str) -> Result<String, EngineError> {
        self.state()
            .image_id
            .clone()
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }
}
