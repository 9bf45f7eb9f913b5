//! Debounced resync of full-state snapshots
//!
//! Turns a noisy event feed into a small number of "recompute and send"
//! calls. Transitional events schedule a recompute after a grace window,
//! definitive events force one immediately and supersede anything pending.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::future::OptionFuture;
use futures::{FutureExt, StreamExt};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{EngineError, EngineEvent, EventAction, EventFeed, EventFilter, ResourceKind};

pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventClass {
    Ignored,
    Transitional,
    Definitive,
}

/// Which events matter to a snapshot subscription, and how much
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncPolicy {
    ContainerList,
    ContainerDetail { id: String },
    ImageList,
}

impl ResyncPolicy {
    pub fn filter(&self) -> EventFilter {
        match self {
            ResyncPolicy::ContainerList | ResyncPolicy::ContainerDetail { .. } => {
                EventFilter::only(ResourceKind::Container)
            }
            // image usage counts move with container changes
            ResyncPolicy::ImageList => EventFilter {
                kinds: vec![ResourceKind::Image, ResourceKind::Container],
            },
        }
    }

    pub fn classify(&self, event: &EngineEvent) -> EventClass {
        use EventAction::*;

        match (self, event.kind, &event.action) {
            (ResyncPolicy::ContainerList, ResourceKind::Container, Create) => EventClass::Transitional,
            (
                ResyncPolicy::ContainerList,
                ResourceKind::Container,
                Start | Died | Pause | Unpause | Remove | Rename,
            ) => EventClass::Definitive,

            (
                ResyncPolicy::ContainerDetail { id },
                ResourceKind::Container,
                Create | Start | Died | Pause | Unpause | Remove | Rename,
            ) if event.matches_id(id) => EventClass::Definitive,

            (ResyncPolicy::ImageList, ResourceKind::Image, Untag) => EventClass::Transitional,
            (ResyncPolicy::ImageList, ResourceKind::Image, Tag | Pull | Remove) => EventClass::Definitive,
            (ResyncPolicy::ImageList, ResourceKind::Container, Commit | Create | Remove) => {
                EventClass::Definitive
            }

            _ => EventClass::Ignored,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncExit {
    Cancelled,
    FeedEnded,
}

/// Drives `resync` from `feed` until cancelled, the feed ends, or either fails.
///
/// One recompute always runs first. At most one recompute is in flight and at
/// most one is scheduled; a definitive event drops both and starts afresh.
pub async fn run_resync<F, Fut>(
    mut feed: EventFeed,
    policy: &ResyncPolicy,
    grace: Duration,
    cancel: &CancellationToken,
    mut resync: F,
) -> Result<ResyncExit, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), EngineError>>,
{
    let mut in_flight: Option<Pin<Box<Fut>>> = Some(Box::pin(resync()));
    let mut deadline: Option<Instant> = None;
    let mut feed_open = true;

    loop {
        if !feed_open && in_flight.is_none() && deadline.is_none() {
            return Ok(ResyncExit::FeedEnded);
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Ok(ResyncExit::Cancelled),

            Some(result) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                in_flight = None;
                result?;
            }

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                in_flight = Some(Box::pin(resync()));
            }

            next = feed.next(), if feed_open => {
                let mut class = match next {
                    Some(Ok(event)) => policy.classify(&event),
                    Some(Err(e)) => return Err(e),
                    None => {
                        feed_open = false;
                        EventClass::Ignored
                    }
                };

                // fold whatever else is already queued into the same decision
                while feed_open {
                    match feed.next().now_or_never() {
                        Some(Some(Ok(event))) => class = class.max(policy.classify(&event)),
                        Some(Some(Err(e))) => return Err(e),
                        Some(None) => feed_open = false,
                        None => break,
                    }
                }

                match class {
                    EventClass::Definitive => {
                        if in_flight.is_some() || deadline.is_some() {
                            debug!("Superseding pending resync");
                        }
                        deadline = None;
                        in_flight = Some(Box::pin(resync()));
                    }
                    EventClass::Transitional if deadline.is_none() => {
                        deadline = Some(Instant::now() + grace);
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeEngine, event};
    use crate::engine::Engine;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counting(count: &Arc<AtomicUsize>) -> impl FnMut() -> futures::future::Ready<Result<(), EngineError>> + use<> {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    fn spawn_list(
        engine: &FakeEngine,
        count: &Arc<AtomicUsize>,
    ) -> (CancellationToken, tokio::task::JoinHandle<Result<ResyncExit, EngineError>>) {
        let policy = ResyncPolicy::ContainerList;
        let feed = engine.events(policy.filter());
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let resync = counting(count);
        let handle = tokio::spawn(async move {
            run_resync(feed, &policy, DEFAULT_GRACE_WINDOW, &task_cancel, resync).await
        });
        (cancel, handle)
    }

    #[test]
    fn test_container_list_classes() {
        let policy = ResyncPolicy::ContainerList;
        assert_eq!(
            policy.classify(&event(ResourceKind::Container, "create", "a")),
            EventClass::Transitional
        );
        assert_eq!(
            policy.classify(&event(ResourceKind::Container, "destroy", "a")),
            EventClass::Definitive
        );
        assert_eq!(
            policy.classify(&event(ResourceKind::Container, "exec_start: sh", "a")),
            EventClass::Ignored
        );
        assert_eq!(policy.classify(&event(ResourceKind::Image, "tag", "a")), EventClass::Ignored);
    }

    #[test]
    fn test_detail_filters_by_id() {
        let policy = ResyncPolicy::ContainerDetail {
            id: "0123456789ab".to_string(),
        };
        assert_eq!(
            policy.classify(&event(ResourceKind::Container, "create", "0123456789abcdef")),
            EventClass::Definitive
        );
        assert_eq!(
            policy.classify(&event(ResourceKind::Container, "start", "ffffffffffffffff")),
            EventClass::Ignored
        );
    }

    #[test]
    fn test_image_list_classes() {
        let policy = ResyncPolicy::ImageList;
        assert_eq!(policy.classify(&event(ResourceKind::Image, "untag", "i")), EventClass::Transitional);
        assert_eq!(policy.classify(&event(ResourceKind::Image, "delete", "i")), EventClass::Definitive);
        assert_eq!(
            policy.classify(&event(ResourceKind::Container, "commit", "c")),
            EventClass::Definitive
        );
        assert_eq!(policy.classify(&event(ResourceKind::Container, "start", "c")), EventClass::Ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitional_fires_after_grace_window() {
        let engine = FakeEngine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let (cancel, handle) = spawn_list(&engine, &count);

        sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        engine.emit(event(ResourceKind::Container, "create", "a"));
        sleep(Duration::from_millis(299)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        cancel.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), ResyncExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_definitive_replaces_scheduled_resync() {
        let engine = FakeEngine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let (cancel, _handle) = spawn_list(&engine, &count);

        sleep(Duration::from_millis(1)).await;
        engine.emit(event(ResourceKind::Container, "create", "a"));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        engine.emit(event(ResourceKind::Container, "start", "a"));
        sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // the create's window would have elapsed here
        sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_burst_resyncs_once() {
        let engine = FakeEngine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let policy = ResyncPolicy::ContainerList;
        let feed = engine.events(policy.filter());
        for action in ["start", "died", "start", "rename", "create"] {
            engine.emit(event(ResourceKind::Container, action, "a"));
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let resync = counting(&count);
        tokio::spawn(async move {
            run_resync(feed, &policy, DEFAULT_GRACE_WINDOW, &task_cancel, resync).await
        });

        sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_definitive_supersedes_in_flight_resync() {
        let engine = FakeEngine::new();
        let policy = ResyncPolicy::ContainerList;
        let feed = engine.events(policy.filter());
        let completed = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        let task_completed = completed.clone();
        tokio::spawn(async move {
            run_resync(feed, &policy, DEFAULT_GRACE_WINDOW, &task_cancel, || {
                let completed = task_completed.clone();
                async move {
                    sleep(Duration::from_millis(100)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
        });

        sleep(Duration::from_millis(150)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        engine.emit(event(ResourceKind::Container, "start", "a"));
        sleep(Duration::from_millis(10)).await;
        engine.emit(event(ResourceKind::Container, "died", "a"));
        sleep(Duration::from_millis(300)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_error_is_returned() {
        let engine = FakeEngine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let (_cancel, handle) = spawn_list(&engine, &count);

        engine.fail_feeds("stream reset");
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(EngineError::Other(msg)) if msg == "stream reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_waiting_on_feed() {
        let engine = FakeEngine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let (cancel, handle) = spawn_list(&engine, &count);

        sleep(Duration::from_millis(1)).await;
        assert_eq!(engine.feeds_open(), 1);
        cancel.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), ResyncExit::Cancelled);
        assert_eq!(engine.feeds_open(), 0);
    }
}
