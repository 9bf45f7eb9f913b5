//! WebSocket streaming endpoints
//!
//! ## Control connection (`/api/subscribe`)
//!
//! JSON envelopes `{index, action, data}` in, `{index, error?, data}` out.
//!
//! ### Actions
//! - `subscribeToContainersList` / `unsubscribeToContainersList`
//! - `subscribeToContainer` / `unsubscribeToContainer`
//! - `subscribeToImagesList` / `unsubscribeToImagesList`
//! - `subscribeToContainerStats` / `unsubscribeToContainerStats`
//! - `subscribeToSystemStats` / `unsubscribeToSystemStats`
//!
//! ## Byte streams
//! - `/api/container/:name/exec` - interactive process bridge
//! - `/api/container/:name/logs` - container output
//! - `/api/events` - filtered engine events
//! - `/api/image/pull` - image pull progress
//!
//! Every connection authenticates with a session key as its first message.

pub mod codec;
pub mod events;
pub mod exec;
pub mod handler;
pub mod host;
pub mod logs;
pub mod pull;
pub mod registry;
pub mod resync;
pub mod stats;
pub mod subscriptions;
pub mod writer;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tokio_util::sync::CancellationToken;

use crate::auth::tokens::SessionStore;
use crate::config::config::StreamingConfig;
use crate::engine::Engine;
use host::HostProbe;

pub use handler::subscribe_handler;

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub grace_window: Duration,
    pub keepalive: Duration,
    pub stats_interval: Duration,
    pub outbound_queue: usize,
    /// Default detach sequence for exec sessions, docker notation.
    pub detach_keys: String,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&StreamingConfig::default())
    }
}

impl From<&StreamingConfig> for StreamSettings {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            grace_window: Duration::from_millis(config.grace_window_ms),
            keepalive: Duration::from_secs(config.keepalive_secs.max(1)),
            stats_interval: Duration::from_secs(config.stats_interval_secs.max(1)),
            outbound_queue: config.outbound_queue.max(1),
            detach_keys: config.detach_keys.clone(),
        }
    }
}

/// Shared by every streaming connection of the daemon
#[derive(Clone)]
pub struct StreamState {
    pub engine: Arc<dyn Engine>,
    pub host: Arc<dyn HostProbe>,
    pub sessions: Arc<SessionStore>,
    pub settings: StreamSettings,
    /// Cancelled when the daemon shuts down; every connection derives from it.
    pub shutdown: CancellationToken,
}

pub fn websocket_router(state: StreamState) -> Router {
    Router::new()
        .route("/api/subscribe", get(subscribe_handler))
        .route("/api/container/:name/exec", get(exec::exec_handler))
        .route("/api/container/:name/logs", get(logs::logs_handler))
        .route("/api/events", get(events::events_handler))
        .route("/api/image/pull", get(pull::pull_handler))
        .with_state(state)
}
