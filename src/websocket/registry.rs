//! Per-connection subscription registry
//!
//! Maps client tokens to cancellation handles. Entries carry a generation so
//! that a finishing subscription never removes a newer one that reused its token,
//! and their topic so an unsubscribe only reaches subscriptions of its own kind.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::codec::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    ContainersList,
    Container,
    ImagesList,
    ContainerStats,
    SystemStats,
}

impl Topic {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ContainersList" => Some(Topic::ContainersList),
            "Container" => Some(Topic::Container),
            "ImagesList" => Some(Topic::ImagesList),
            "ContainerStats" => Some(Topic::ContainerStats),
            "SystemStats" => Some(Topic::SystemStats),
            _ => None,
        }
    }
}

struct Entry {
    generation: u64,
    topic: Topic,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub token: Token,
    pub generation: u64,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<Token, Entry>,
    generation: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `cancel` under `token`. A previous entry for the same token
    /// is replaced but keeps running.
    pub fn register(&self, token: Token, topic: Topic, cancel: CancellationToken) -> Registration {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if self
            .entries
            .insert(
                token,
                Entry {
                    generation,
                    topic,
                    cancel,
                },
            )
            .is_some()
        {
            tracing::debug!("Subscription token {} reused, previous handler no longer addressable", token);
        }
        Registration { token, generation }
    }

    /// Cancels and forgets the `topic` subscription under `token`. Returns
    /// whether one was found.
    pub fn cancel(&self, token: Token, topic: Topic) -> bool {
        // cancel outside the map lock
        match self.entries.remove_if(&token, |_, entry| entry.topic == topic) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes the entry only if it still belongs to `registration`.
    pub fn remove(&self, registration: Registration) -> bool {
        self.entries
            .remove_if(&registration.token, |_, entry| entry.generation == registration.generation)
            .is_some()
    }

    #[cfg(test)]
    pub fn contains(&self, token: Token) -> bool {
        self.entries.contains_key(&token)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Removes its registration when the handler ends, whatever the reason.
pub struct SubscriptionGuard {
    registry: Arc<SubscriptionRegistry>,
    registration: Registration,
}

impl SubscriptionGuard {
    pub fn register(registry: Arc<SubscriptionRegistry>, token: Token, topic: Topic, cancel: CancellationToken) -> Self {
        let registration = registry.register(token, topic, cancel);
        Self {
            registry,
            registration,
        }
    }

    #[cfg(test)]
    pub fn token(&self) -> Token {
        self.registration.token
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.registration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let cancel = CancellationToken::new();
        registry.register(5, Topic::ImagesList, cancel.clone());

        assert!(registry.cancel(5, Topic::ImagesList));
        assert!(cancel.is_cancelled());
        assert!(!registry.cancel(5, Topic::ImagesList));
        assert!(!registry.cancel(99, Topic::ImagesList));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reused_token_overwrites_without_cancelling() {
        let registry = SubscriptionRegistry::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        let old = registry.register(1, Topic::ContainersList, first.clone());
        registry.register(1, Topic::ContainersList, second.clone());

        assert!(!first.is_cancelled());
        // the stale handler finishing must not drop the new entry
        assert!(!registry.remove(old));
        assert!(registry.contains(1));

        assert!(registry.cancel(1, Topic::ContainersList));
        assert!(second.is_cancelled());
        assert!(!first.is_cancelled());
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let registry = Arc::new(SubscriptionRegistry::new());
        {
            let guard = SubscriptionGuard::register(registry.clone(), 3, Topic::SystemStats, CancellationToken::new());
            assert_eq!(guard.token(), 3);
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_only_matches_its_topic() {
        let registry = SubscriptionRegistry::new();
        let stats = CancellationToken::new();
        registry.register(1, Topic::ContainerStats, stats.clone());

        assert!(!registry.cancel(1, Topic::ContainersList));
        assert!(!stats.is_cancelled());
        assert!(registry.contains(1));

        assert!(registry.cancel(1, Topic::ContainerStats));
        assert!(stats.is_cancelled());
    }
}
