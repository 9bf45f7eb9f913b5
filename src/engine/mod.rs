//! Container engine capability seam
//!
//! The streaming layer never talks to the engine client directly. It asks an
//! [`Engine`] for full-state snapshots, a lazy event feed, a lazy feed of
//! periodic samples, exec sessions and log streams. [`DockerEngine`] is the
//! production implementation on top of bollard.

pub mod docker;
pub mod features;
#[cfg(test)]
pub mod fake;

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::{ContainerInspectResponse, ContainerSummary, ImageSummary};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::io::AsyncWrite;

pub use docker::DockerEngine;
pub use features::{EngineFeatures, EngineVersion};

/// Errors surfaced by the engine while serving a request or a feed
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("host sampling failed: {0}")]
    Host(#[from] std::io::Error),

    #[error("failed to encode engine data: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Lazy, infinite feed of change events. Not restartable.
pub type EventFeed = BoxStream<'static, Result<EngineEvent, EngineError>>;
/// Lazy feed of periodic raw counter reports.
pub type SampleFeed = BoxStream<'static, Result<RawReport, EngineError>>;
/// Demultiplexed output of an exec session or a log stream.
pub type FrameFeed = BoxStream<'static, Result<ExecFrame, EngineError>>;
/// Progress messages of an image pull.
pub type ProgressFeed = BoxStream<'static, Result<serde_json::Value, EngineError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Container,
    Image,
    Other,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Container => "container",
            ResourceKind::Image => "image",
            ResourceKind::Other => "other",
        }
    }
}

/// Upstream change actions the streaming layer cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Start,
    Died,
    Pause,
    Unpause,
    Remove,
    Rename,
    Tag,
    Untag,
    Pull,
    Commit,
    Other(String),
}

impl EventAction {
    pub fn parse(raw: &str) -> Self {
        // docker reports things like "exec_start: sh -c ..."
        let name = raw.split(':').next().unwrap_or(raw).trim();
        match name {
            "create" => EventAction::Create,
            "start" => EventAction::Start,
            "die" | "died" => EventAction::Died,
            "pause" => EventAction::Pause,
            "unpause" => EventAction::Unpause,
            "remove" | "destroy" | "delete" => EventAction::Remove,
            "rename" => EventAction::Rename,
            "tag" => EventAction::Tag,
            "untag" => EventAction::Untag,
            "pull" => EventAction::Pull,
            "commit" => EventAction::Commit,
            other => EventAction::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventAction::Create => "create",
            EventAction::Start => "start",
            EventAction::Died => "died",
            EventAction::Pause => "pause",
            EventAction::Unpause => "unpause",
            EventAction::Remove => "remove",
            EventAction::Rename => "rename",
            EventAction::Tag => "tag",
            EventAction::Untag => "untag",
            EventAction::Pull => "pull",
            EventAction::Commit => "commit",
            EventAction::Other(name) => name,
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub kind: ResourceKind,
    pub action: EventAction,
    pub actor_id: String,
    pub attributes: HashMap<String, String>,
}

impl EngineEvent {
    pub fn new(kind: ResourceKind, action: EventAction, actor_id: impl Into<String>) -> Self {
        Self {
            kind,
            action,
            actor_id: actor_id.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.attributes.get("name").map(String::as_str)
    }

    /// Matches a full id, or a 12 character short id prefix.
    pub fn matches_id(&self, id: &str) -> bool {
        if id.len() == 12 {
            self.actor_id.starts_with(id)
        } else {
            self.actor_id == id
        }
    }
}

/// Which resource types an event feed carries. Empty means everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub kinds: Vec<ResourceKind>,
}

impl EventFilter {
    pub fn only(kind: ResourceKind) -> Self {
        Self { kinds: vec![kind] }
    }
}

/// Cumulative counters of one resource at one point in time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSample {
    pub id: String,
    pub name: String,
    pub cpu_nanos: u64,
    pub memory: u64,
    pub memory_limit: u64,
    pub net_input: u64,
    pub net_output: u64,
    pub block_input: u64,
    pub block_output: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawReport {
    pub read: DateTime<Utc>,
    pub samples: Vec<RawSample>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub user: Option<String>,
    pub interactive: bool,
    pub tty: bool,
}

/// Stream discriminator carried by every chunk of an engine duplex channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    StdinEcho,
    Stdout,
    Stderr,
    Error,
}

impl StreamKind {
    pub fn from_discriminator(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(StreamKind::StdinEcho),
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            3 => Some(StreamKind::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecFrame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

impl ExecFrame {
    pub fn new(kind: StreamKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

pub type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Live halves of a started-and-attached exec session
pub struct ExecAttachment {
    pub output: FrameFeed,
    pub input: Option<ExecInput>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStatus {
    pub exit_code: Option<i64>,
    pub running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    pub tail: Option<String>,
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn version(&self) -> Result<EngineVersion, EngineError>;

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, EngineError>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError>;

    /// Opens a fresh event feed. Every subscription needs its own.
    fn events(&self, filter: EventFilter) -> EventFeed;

    /// Samples `target` (or every running container) once per `interval`.
    fn stats(&self, target: Option<String>, interval: Duration) -> SampleFeed;

    async fn create_exec(&self, container: &str, options: &ExecOptions) -> Result<String, EngineError>;

    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<ExecAttachment, EngineError>;

    async fn start_exec_detached(&self, exec_id: &str) -> Result<(), EngineError>;

    async fn resize_exec(&self, exec_id: &str, width: u16, height: u16) -> Result<(), EngineError>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus, EngineError>;

    fn logs(&self, container: &str, options: LogOptions) -> FrameFeed;

    fn pull_image(&self, name: &str) -> ProgressFeed;

    /// Resolves an image reference to its id.
    async fn inspect_image(&self, name: &str) -> Result<String, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_aliases() {
        assert_eq!(EventAction::parse("destroy"), EventAction::Remove);
        assert_eq!(EventAction::parse("delete"), EventAction::Remove);
        assert_eq!(EventAction::parse("die"), EventAction::Died);
        assert_eq!(
            EventAction::parse("exec_start: sh -c ls"),
            EventAction::Other("exec_start".to_string())
        );
    }

    #[test]
    fn test_short_id_matching() {
        let event = EngineEvent::new(ResourceKind::Container, EventAction::Start, "0123456789abcdef0123");
        assert!(event.matches_id("0123456789ab"));
        assert!(event.matches_id("0123456789abcdef0123"));
        assert!(!event.matches_id("0123456789"));
        assert!(!event.matches_id("ffffffffffff"));
    }

    #[test]
    fn test_stream_discriminators() {
        assert_eq!(StreamKind::from_discriminator(1), Some(StreamKind::Stdout));
        assert_eq!(StreamKind::from_discriminator(2), Some(StreamKind::Stderr));
        assert_eq!(StreamKind::from_discriminator(3), Some(StreamKind::Error));
        assert_eq!(StreamKind::from_discriminator(9), None);
    }
}
