//! Docker engine backed by bollard

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions, Stats, StatsOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage, EventMessageTypeEnum, ImageSummary};
use bollard::system::EventsOptions;
use bollard::{API_DEFAULT_VERSION, Docker};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use tokio_stream::wrappers::IntervalStream;
use tracing::debug;

use super::{
    Engine, EngineError, EngineEvent, EngineVersion, EventAction, EventFeed, EventFilter, ExecAttachment,
    ExecFrame, ExecOptions, ExecStatus, FrameFeed, LogOptions, ProgressFeed, RawReport, RawSample,
    ResourceKind, SampleFeed, StreamKind,
};

const CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects to the engine socket, or to the local defaults when no path is configured.
    pub fn connect(socket_path: Option<&str>) -> Result<Self, EngineError> {
        let docker = match socket_path {
            Some(path) if !path.is_empty() => {
                Docker::connect_with_unix(path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            _ => Docker::connect_with_local_defaults()?,
        };

        Ok(Self { docker })
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn version(&self) -> Result<EngineVersion, EngineError> {
        let version = self.docker.version().await?;
        Ok(version
            .version
            .as_deref()
            .map(EngineVersion::parse)
            .unwrap_or_default())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        Ok(self.docker.list_containers(Some(options)).await?)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, EngineError> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| not_found(e, id))
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        let options = ListImagesOptions::<String> {
            all: false,
            ..Default::default()
        };
        Ok(self.docker.list_images(Some(options)).await?)
    }

    fn events(&self, filter: EventFilter) -> EventFeed {
        let mut filters = HashMap::new();
        if !filter.kinds.is_empty() {
            let kinds = filter
                .kinds
                .iter()
                .map(|kind| kind.as_str().to_string())
                .collect::<Vec<_>>();
            filters.insert("type".to_string(), kinds);
        }

        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        self.docker
            .events(Some(options))
            .map_ok(to_engine_event)
            .map_err(EngineError::from)
            .boxed()
    }

    fn stats(&self, target: Option<String>, interval: Duration) -> SampleFeed {
        let docker = self.docker.clone();
        let ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));

        IntervalStream::new(ticker)
            .then(move |_| {
                let docker = docker.clone();
                let target = target.clone();
                async move { sample_once(&docker, target.as_deref()).await }
            })
            .boxed()
    }

    async fn create_exec(&self, container: &str, options: &ExecOptions) -> Result<String, EngineError> {
        let config = CreateExecOptions::<String> {
            attach_stdin: Some(options.interactive),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(options.tty),
            cmd: Some(options.cmd.clone()),
            env: (!options.env.is_empty()).then(|| options.env.clone()),
            user: options.user.clone(),
            ..Default::default()
        };

        let created = self.docker.create_exec(container, config).await?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<ExecAttachment, EngineError> {
        let options = StartExecOptions {
            detach: false,
            tty,
            ..Default::default()
        };

        match self.docker.start_exec(exec_id, Some(options)).await? {
            StartExecResults::Attached { output, input } => Ok(ExecAttachment {
                output: output.map_ok(to_frame).map_err(EngineError::from).boxed(),
                input: Some(input),
            }),
            StartExecResults::Detached => Err(EngineError::Unsupported(format!(
                "exec {} started detached while attach was requested",
                exec_id
            ))),
        }
    }

    async fn start_exec_detached(&self, exec_id: &str) -> Result<(), EngineError> {
        let options = StartExecOptions {
            detach: true,
            ..Default::default()
        };
        self.docker.start_exec(exec_id, Some(options)).await?;
        Ok(())
    }

    async fn resize_exec(&self, exec_id: &str, width: u16, height: u16) -> Result<(), EngineError> {
        self.docker
            .resize_exec(exec_id, ResizeExecOptions { height, width })
            .await?;
        Ok(())
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus, EngineError> {
        let inspected = self.docker.inspect_exec(exec_id).await?;
        Ok(ExecStatus {
            exit_code: inspected.exit_code,
            running: inspected.running.unwrap_or(false),
        })
    }

    fn logs(&self, container: &str, options: LogOptions) -> FrameFeed {
        let options = LogsOptions::<String> {
            follow: options.follow,
            stdout: true,
            stderr: true,
            tail: options.tail.unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        self.docker
            .logs(container, Some(options))
            .map_ok(to_frame)
            .map_err(EngineError::from)
            .boxed()
    }

    fn pull_image(&self, name: &str) -> ProgressFeed {
        let options = CreateImageOptions::<String> {
            from_image: name.to_string(),
            ..Default::default()
        };

        self.docker
            .create_image(Some(options), None, None)
            .map_err(EngineError::from)
            .and_then(|info| futures::future::ready(serde_json::to_value(info).map_err(EngineError::from)))
            .boxed()
    }

    async fn inspect_image(&self, name: &str) -> Result<String, EngineError> {
        let image = self.docker.inspect_image(name).await.map_err(|e| not_found(e, name))?;
        image.id.ok_or_else(|| EngineError::NotFound(name.to_string()))
    }
}

/// Engine 404s name a missing resource; everything else passes through.
fn not_found(e: bollard::errors::Error, what: &str) -> EngineError {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
            EngineError::NotFound(what.to_string())
        }
        other => EngineError::Docker(other),
    }
}

fn to_engine_event(message: EventMessage) -> EngineEvent {
    let kind = match message.typ {
        Some(EventMessageTypeEnum::CONTAINER) => ResourceKind::Container,
        Some(EventMessageTypeEnum::IMAGE) => ResourceKind::Image,
        _ => ResourceKind::Other,
    };
    let action = EventAction::parse(message.action.as_deref().unwrap_or_default());
    let (actor_id, attributes) = message
        .actor
        .map(|actor| (actor.id.unwrap_or_default(), actor.attributes.unwrap_or_default()))
        .unwrap_or_default();

    EngineEvent {
        kind,
        action,
        actor_id,
        attributes,
    }
}

fn to_frame(output: LogOutput) -> ExecFrame {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            ExecFrame::new(StreamKind::Stdout, message)
        }
        LogOutput::StdErr { message } => ExecFrame::new(StreamKind::Stderr, message),
        LogOutput::StdIn { message } => ExecFrame::new(StreamKind::StdinEcho, message),
    }
}

/// Takes one reading of every target. Without a target, containers that
/// disappear between listing and sampling are skipped.
async fn sample_once(docker: &Docker, target: Option<&str>) -> Result<RawReport, EngineError> {
    let ids = match target {
        Some(id) => vec![id.to_string()],
        None => {
            let options = ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            };
            docker
                .list_containers(Some(options))
                .await?
                .into_iter()
                .filter_map(|summary| summary.id)
                .collect()
        }
    };

    let readings = futures::future::join_all(ids.iter().map(|id| async move {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        Box::pin(docker.stats(id, Some(options))).next().await
    }))
    .await;

    let mut samples = Vec::with_capacity(readings.len());
    for (id, reading) in ids.iter().zip(readings) {
        match reading {
            Some(Ok(stats)) => samples.push(to_sample(stats)),
            Some(Err(e)) if target.is_some() => return Err(e.into()),
            Some(Err(e)) => debug!("Skipping stats for {}: {}", id, e),
            None if target.is_some() => return Err(EngineError::NotFound(id.clone())),
            None => {}
        }
    }

    Ok(RawReport {
        read: Utc::now(),
        samples,
    })
}

fn to_sample(stats: Stats) -> RawSample {
    let (net_input, net_output) = stats
        .networks
        .as_ref()
        .map(|networks| {
            networks.values().fold((0u64, 0u64), |(rx, tx), net| {
                (rx.saturating_add(net.rx_bytes), tx.saturating_add(net.tx_bytes))
            })
        })
        .unwrap_or_default();

    let (block_input, block_output) = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries.iter().fold((0u64, 0u64), |(read, write), entry| {
                match entry.op.to_ascii_lowercase().as_str() {
                    "read" => (read.saturating_add(entry.value), write),
                    "write" => (read, write.saturating_add(entry.value)),
                    _ => (read, write),
                }
            })
        })
        .unwrap_or_default();

    RawSample {
        name: stats.name.trim_start_matches('/').to_string(),
        id: stats.id,
        cpu_nanos: stats.cpu_stats.cpu_usage.total_usage,
        memory: stats.memory_stats.usage.unwrap_or(0),
        memory_limit: stats.memory_stats.limit.unwrap_or(0),
        net_input,
        net_output,
        block_input,
        block_output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_404_is_not_found() {
        let missing = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such image: alpine:3".to_string(),
        };
        assert!(matches!(not_found(missing, "alpine:3"), EngineError::NotFound(name) if name == "alpine:3"));

        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "conflict".to_string(),
        };
        assert!(matches!(not_found(conflict, "alpine:3"), EngineError::Docker(_)));
    }
}
