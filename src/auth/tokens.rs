//! Session key storage for streaming connections
//!
//! Keys are issued on login and presented as the first message of every
//! websocket. A key stays valid while a connection holds it; once released
//! its expiry is pushed out by the configured TTL.

use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

type StoreResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub key: String,
    pub created_at: u64,
    pub expires_at: u64,
    /// Connections currently authenticated with this key.
    pub uses: u32,
}

pub struct SessionStore {
    db: Arc<Db>,
    ttl_seconds: u64,
}

fn now_secs() -> StoreResult<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

impl SessionStore {
    pub fn open(db_path: impl AsRef<Path>, ttl_seconds: u64) -> StoreResult<Self> {
        let db = sled::open(db_path)?;
        let store = Self {
            db: Arc::new(db),
            ttl_seconds,
        };
        store.reset_uses()?;
        Ok(store)
    }

    /// Connections do not survive a restart, so neither do their use counts.
    fn reset_uses(&self) -> StoreResult<()> {
        for item in self.db.iter() {
            let (key, value) = item?;
            if let Ok(mut data) = serde_json::from_slice::<SessionData>(&value) {
                if data.uses > 0 {
                    data.uses = 0;
                    self.db.insert(key, serde_json::to_vec(&data)?)?;
                }
            }
        }
        Ok(())
    }

    /// Issue a new session key
    pub fn issue(&self) -> StoreResult<String> {
        let now = now_secs()?;
        let key = format!("deckhand_{}", uuid::Uuid::new_v4().simple());

        let data = SessionData {
            key: key.clone(),
            created_at: now,
            expires_at: now + self.ttl_seconds,
            uses: 0,
        };
        self.db.insert(key.as_bytes(), serde_json::to_vec(&data)?)?;

        tracing::info!("Issued session key with TTL {}s", self.ttl_seconds);
        Ok(key)
    }

    pub fn session(&self, key: &str) -> StoreResult<Option<SessionData>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Validates `key` and counts one more connection on it.
    pub fn acquire(&self, key: &str) -> StoreResult<bool> {
        let now = now_secs()?;
        let mut granted = false;

        self.db.update_and_fetch(key.as_bytes(), |old| {
            granted = false;
            let mut data: SessionData = serde_json::from_slice(old?).ok()?;
            if now > data.expires_at {
                // expired and idle keys are dropped on sight
                return if data.uses == 0 { None } else { serde_json::to_vec(&data).ok() };
            }
            data.uses += 1;
            granted = true;
            serde_json::to_vec(&data).ok()
        })?;

        if !granted {
            tracing::warn!("Rejected session key");
        }
        Ok(granted)
    }

    /// Gives back one connection's hold on `key` and refreshes its expiry.
    pub fn release(&self, key: &str) -> StoreResult<()> {
        let expires_at = now_secs()? + self.ttl_seconds;

        self.db.update_and_fetch(key.as_bytes(), |old| {
            let mut data: SessionData = serde_json::from_slice(old?).ok()?;
            data.uses = data.uses.saturating_sub(1);
            data.expires_at = expires_at;
            serde_json::to_vec(&data).ok()
        })?;
        Ok(())
    }

    /// Forgets `key`. Connections already holding it keep running.
    pub fn revoke(&self, key: &str) -> StoreResult<bool> {
        let removed = self.db.remove(key.as_bytes())?.is_some();
        if removed {
            tracing::info!("Revoked session key");
        }
        Ok(removed)
    }

    /// Clean up expired keys that no connection holds
    pub fn cleanup_expired(&self) -> StoreResult<usize> {
        let now = now_secs()?;
        let mut removed = 0;

        for item in self.db.iter() {
            let (key, value) = item?;
            match serde_json::from_slice::<SessionData>(&value) {
                Ok(data) if data.uses > 0 || now <= data.expires_at => {}
                _ => {
                    self.db.remove(&key)?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!("Cleaned up {} expired session keys", removed);
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("sessions.db"), 3600).unwrap();
        (dir, store)
    }

    fn expire(store: &SessionStore, key: &str, uses: u32) {
        let data = SessionData {
            key: key.to_string(),
            created_at: 0,
            expires_at: 1,
            uses,
        };
        store
            .db
            .insert(key.as_bytes(), serde_json::to_vec(&data).unwrap())
            .unwrap();
    }

    #[test]
    fn test_issue_and_acquire() {
        let (_dir, store) = store();
        let key = store.issue().unwrap();
        assert!(key.starts_with("deckhand_"));

        assert!(store.acquire(&key).unwrap());
        assert!(store.acquire(&key).unwrap());
        assert_eq!(store.session(&key).unwrap().unwrap().uses, 2);

        store.release(&key).unwrap();
        assert_eq!(store.session(&key).unwrap().unwrap().uses, 1);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let (_dir, store) = store();
        assert!(!store.acquire("deckhand_nope").unwrap());
    }

    #[test]
    fn test_expired_key_rejected_and_removed() {
        let (_dir, store) = store();
        expire(&store, "old", 0);
        assert!(!store.acquire("old").unwrap());
        assert!(store.session("old").unwrap().is_none());
    }

    #[test]
    fn test_release_refreshes_expiry() {
        let (_dir, store) = store();
        expire(&store, "held", 1);
        store.release("held").unwrap();

        let data = store.session("held").unwrap().unwrap();
        assert_eq!(data.uses, 0);
        assert!(data.expires_at > now_secs().unwrap());
        assert!(store.acquire("held").unwrap());
    }

    #[test]
    fn test_cleanup_keeps_held_keys() {
        let (_dir, store) = store();
        let fresh = store.issue().unwrap();
        expire(&store, "idle", 0);
        expire(&store, "busy", 2);

        assert_eq!(store.cleanup_expired().unwrap(), 1);
        assert!(store.session(&fresh).unwrap().is_some());
        assert!(store.session("busy").unwrap().is_some());
        assert!(store.session("idle").unwrap().is_none());
    }

    #[test]
    fn test_reopen_resets_uses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let key = {
            let store = SessionStore::open(&path, 60).unwrap();
            let key = store.issue().unwrap();
            store.acquire(&key).unwrap();
            key
        };

        let store = SessionStore::open(&path, 60).unwrap();
        assert_eq!(store.session(&key).unwrap().unwrap().uses, 0);
    }

    #[test]
    fn test_revoke() {
        let (_dir, store) = store();
        let key = store.issue().unwrap();

        assert!(store.revoke(&key).unwrap());
        assert!(!store.acquire(&key).unwrap());
        assert!(!store.revoke(&key).unwrap());
        // a connection that still held it releases without error
        store.release(&key).unwrap();
    }
}
