//! Subscription handlers for the control protocol
//!
//! Each request runs in its own task. Subscribing actions register their
//! cancellation handle synchronously at dispatch time, so an unsubscribe that
//! follows on the wire always finds it.

use std::collections::HashSet;
use std::future::Future;

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::{CodecError, RequestEnvelope, ResponseEnvelope, Token};
use super::handler::{Outbound, SessionContext};
use super::host::SystemStats;
use super::registry::{SubscriptionGuard, Topic};
use super::resync::{ResyncExit, ResyncPolicy, run_resync};
use super::stats::{StatsSampler, StatsSummary};
use crate::engine::{EngineError, SampleFeed};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Subscribe(Topic),
    Unsubscribe(Topic),
}

impl Action {
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(topic) = name.strip_prefix("subscribeTo") {
            Topic::parse(topic).map(Action::Subscribe)
        } else if let Some(topic) = name.strip_prefix("unsubscribeTo") {
            Topic::parse(topic).map(Action::Unsubscribe)
        } else {
            None
        }
    }
}

/// Starts handling `request`. The returned future owns everything it needs.
pub fn dispatch(
    ctx: SessionContext,
    request: RequestEnvelope,
    out: Outbound,
    cancel: CancellationToken,
) -> impl Future<Output = ()> + Send + 'static {
    let action = Action::parse(&request.action);
    let guard = match action {
        Some(Action::Subscribe(topic)) => Some(SubscriptionGuard::register(
            ctx.registry.clone(),
            request.index,
            topic,
            cancel.clone(),
        )),
        _ => None,
    };

    async move {
        let index = request.index;
        let result = match action {
            None => {
                warn!(index, action = %request.action, "Unknown action");
                out.send(&cancel, ResponseEnvelope::error(index, "invalid action")).await;
                return;
            }
            Some(Action::Unsubscribe(topic)) => unsubscribe(&ctx, topic, &request, &out, &cancel).await,
            Some(Action::Subscribe(topic)) => {
                debug!(index, ?topic, "Subscription started");
                match topic {
                    Topic::ContainersList => container_list(&ctx, index, &out, &cancel).await,
                    Topic::Container => container_detail(&ctx, &request, &out, &cancel).await,
                    Topic::ImagesList => image_list(&ctx, index, &out, &cancel).await,
                    Topic::ContainerStats => container_stats(&ctx, &request, &out, &cancel).await,
                    Topic::SystemStats => system_stats(&ctx, index, &out, &cancel).await,
                }
            }
        };

        finish(index, result, &out, &cancel).await;
        drop(guard);
    }
}

/// Sends the terminal envelope unless the subscription was cancelled.
pub(super) async fn finish(
    index: Token,
    result: Result<bool, HandlerError>,
    out: &Outbound,
    cancel: &CancellationToken,
) {
    if cancel.is_cancelled() {
        debug!(index, "Subscription cancelled");
        return;
    }

    let envelope = match result {
        Ok(true) => ResponseEnvelope::done(index),
        // reply already sent
        Ok(false) => return,
        Err(e) => {
            warn!(index, "Subscription failed: {}", e);
            ResponseEnvelope::error(index, e)
        }
    };
    out.send(cancel, envelope).await;
}

async fn unsubscribe(
    ctx: &SessionContext,
    topic: Topic,
    request: &RequestEnvelope,
    out: &Outbound,
    cancel: &CancellationToken,
) -> Result<bool, HandlerError> {
    let target: Token = request.payload()?;
    let found = ctx.registry.cancel(target, topic);
    debug!(index = request.index, target, found, "Unsubscribe");
    out.send(cancel, ResponseEnvelope::data(request.index, Value::Bool(found)))
        .await;
    Ok(false)
}

fn finished(exit: ResyncExit) -> bool {
    exit == ResyncExit::FeedEnded
}

async fn container_list(
    ctx: &SessionContext,
    index: Token,
    out: &Outbound,
    cancel: &CancellationToken,
) -> Result<bool, HandlerError> {
    let policy = ResyncPolicy::ContainerList;
    let feed = ctx.engine.events(policy.filter());

    let exit = run_resync(feed, &policy, ctx.settings.grace_window, cancel, || {
        let engine = ctx.engine.clone();
        let out = out.clone();
        let cancel = cancel.clone();
        async move {
            let containers = engine.list_containers().await?;
            out.send(&cancel, ResponseEnvelope::data(index, serde_json::to_value(containers)?))
                .await;
            Ok::<(), EngineError>(())
        }
    })
    .await?;

    Ok(finished(exit))
}

async fn container_detail(
    ctx: &SessionContext,
    request: &RequestEnvelope,
    out: &Outbound,
    cancel: &CancellationToken,
) -> Result<bool, HandlerError> {
    let id: String = request.payload()?;
    let index = request.index;
    let policy = ResyncPolicy::ContainerDetail { id: id.clone() };
    let feed = ctx.engine.events(policy.filter());

    let exit = run_resync(feed, &policy, ctx.settings.grace_window, cancel, || {
        let engine = ctx.engine.clone();
        let out = out.clone();
        let cancel = cancel.clone();
        let id = id.clone();
        async move {
            let container = engine.inspect_container(&id).await?;
            out.send(&cancel, ResponseEnvelope::data(index, serde_json::to_value(container)?))
                .await;
            Ok::<(), EngineError>(())
        }
    })
    .await?;

    Ok(finished(exit))
}

async fn image_list(
    ctx: &SessionContext,
    index: Token,
    out: &Outbound,
    cancel: &CancellationToken,
) -> Result<bool, HandlerError> {
    let policy = ResyncPolicy::ImageList;
    let feed = ctx.engine.events(policy.filter());

    let exit = run_resync(feed, &policy, ctx.settings.grace_window, cancel, || {
        let engine = ctx.engine.clone();
        let out = out.clone();
        let cancel = cancel.clone();
        async move {
            let mut images = engine.list_images().await?;
            images.sort_by(|a, b| b.created.cmp(&a.created));
            out.send(&cancel, ResponseEnvelope::data(index, serde_json::to_value(images)?))
                .await;
            Ok::<(), EngineError>(())
        }
    })
    .await?;

    Ok(finished(exit))
}

enum Sampled {
    Summary(StatsSummary),
    Cancelled,
    Ended,
}

/// Engine sample feed paired with the sampler that digests it
struct SampleSource {
    sampler: StatsSampler,
    feed: SampleFeed,
}

impl SampleSource {
    fn open(ctx: &SessionContext, target: Option<String>) -> Self {
        let sampler = StatsSampler::new(ctx.features, ctx.settings.stats_interval);
        let feed = ctx.engine.stats(target, sampler.poll_interval());
        Self { sampler, feed }
    }

    async fn next(&mut self, cancel: &CancellationToken) -> Result<Sampled, EngineError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Sampled::Cancelled),
                next = self.feed.next() => next,
            };

            match next {
                Some(Ok(report)) => {
                    if let Some(summary) = self.sampler.push(report) {
                        return Ok(Sampled::Summary(summary));
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(Sampled::Ended),
            }
        }
    }
}

async fn container_stats(
    ctx: &SessionContext,
    request: &RequestEnvelope,
    out: &Outbound,
    cancel: &CancellationToken,
) -> Result<bool, HandlerError> {
    let target: Option<String> = request.optional_payload()?;
    let mut source = SampleSource::open(ctx, target);

    loop {
        let summary = match source.next(cancel).await? {
            Sampled::Summary(summary) => summary,
            Sampled::Cancelled => return Ok(false),
            Sampled::Ended => return Ok(true),
        };

        let data = serde_json::to_value(&summary).map_err(EngineError::from)?;
        if !out.send(cancel, ResponseEnvelope::data(request.index, data)).await {
            return Ok(false);
        }
    }
}

async fn system_stats(
    ctx: &SessionContext,
    index: Token,
    out: &Outbound,
    cancel: &CancellationToken,
) -> Result<bool, HandlerError> {
    let mut source = SampleSource::open(ctx, None);
    let mut last_idle: Option<u64> = None;

    loop {
        let summary = match source.next(cancel).await? {
            Sampled::Summary(summary) => summary,
            Sampled::Cancelled => return Ok(false),
            Sampled::Ended => return Ok(true),
        };

        let idle = ctx.host.cpu_idle_nanos().await?;
        let stats = system_snapshot(ctx, &summary, last_idle.map(|previous| idle.saturating_sub(previous))).await?;
        last_idle = Some(idle);

        let data = serde_json::to_value(&stats).map_err(EngineError::from)?;
        if !out.send(cancel, ResponseEnvelope::data(index, data)).await {
            return Ok(false);
        }
    }
}

/// Combines one sampler interval with host and inventory readings.
/// `idle_delta` is the host idle time spent during the interval, in nanoseconds.
async fn system_snapshot(
    ctx: &SessionContext,
    summary: &StatsSummary,
    idle_delta: Option<u64>,
) -> Result<SystemStats, EngineError> {
    let cpu_total = ctx.host.cpu_count() as f64;
    let memory = ctx.host.memory().await?;
    let containers = ctx.engine.list_containers().await?;
    let images = ctx.engine.list_images().await?;

    let idle_cores = match idle_delta {
        Some(delta) if !summary.is_first() => delta as f64 / 1e9 / summary.interval_secs,
        // nothing measured yet, report no load
        _ => cpu_total - summary.total.cpu,
    };

    let mut stats = SystemStats::compose(cpu_total, summary.total.cpu, idle_cores, memory, summary.total.memory);

    let in_use: HashSet<&str> = containers
        .iter()
        .filter_map(|c| c.image_id.as_deref())
        .collect();
    stats.containers_total = containers.len();
    stats.containers_running = containers
        .iter()
        .filter(|c| c.state.as_deref() == Some("running"))
        .count();
    stats.images_total = images.len();
    stats.images_in_use = images
        .iter()
        .filter(|image| in_use.contains(image.id.as_str()))
        .count();

    Ok(stats)
}
