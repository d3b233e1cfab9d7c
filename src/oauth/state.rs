//! CSRF state tokens for the OAuth authorization flow.
//!
//! Each issued state binds one authorization attempt to a user and
//! credential. States are single-use, expire after a TTL, and live only in
//! process memory — a restart drops pending authorizations and the user
//! restarts the flow.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A pending authorization attempt, keyed by its state token.
#[derive(Clone, Debug)]
pub struct PendingAuth {
    pub user_id: String,
    pub credential_id: Uuid,
    /// Frontend URL the controller redirects to after the callback.
    pub redirect_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// State store with single-use consumption and automatic expiry.
#[derive(Clone)]
pub struct StateStore {
    entries: Arc<Mutex<HashMap<String, PendingAuth>>>,
    ttl: Duration,
}

/// 256 bits of randomness, hex-encoded.
fn random_state_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut token = String::with_capacity(64);
    for b in bytes {
        let _ = write!(token, "{:02x}", b);
    }
    token
}

impl StateStore {
    /// Creates a store whose entries expire after `ttl_seconds`.
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Issues a new state token, pruning expired entries first.
    pub fn issue(
        &self,
        user_id: &str,
        credential_id: Uuid,
        redirect_url: Option<String>,
    ) -> String {
        let token = random_state_token();
        let entry = PendingAuth {
            user_id: user_id.to_string(),
            credential_id,
            redirect_url,
            created_at: Utc::now(),
        };

        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, e| now - e.created_at <= self.ttl);
        entries.insert(token.clone(), entry);

        token
    }

    /// Validates and consumes a state token.
    ///
    /// The entry is removed before expiry is checked, so a concurrent second
    /// callback can never replay it even when the first one fails later.
    pub fn consume(&self, state: &str) -> Option<PendingAuth> {
        let entry = self.entries.lock().unwrap().remove(state)?;

        if Utc::now() - entry.created_at > self.ttl {
            return None;
        }

        Some(entry)
    }

    /// Removes all expired entries.
    pub fn prune_expired(&self) {
        let now = Utc::now();
        self.entries
            .lock()
            .unwrap()
            .retain(|_, e| now - e.created_at <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background task that prunes expired states periodically.
pub async fn run_state_pruner(store: StateStore, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        store.prune_expired();
        tracing::debug!(pending = store.len(), "OAuth state pruning complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_consume() {
        let store = StateStore::new(600);
        let credential_id = Uuid::new_v4();

        let state = store.issue("user123", credential_id, Some("https://app/done".into()));
        assert_eq!(state.len(), 64);
        assert!(state.chars().all(|c| c.is_ascii_hexdigit()));

        let entry = store.consume(&state).expect("state should be valid");
        assert_eq!(entry.user_id, "user123");
        assert_eq!(entry.credential_id, credential_id);
        assert_eq!(entry.redirect_url, Some("https://app/done".to_string()));
    }

    #[test]
    fn test_state_is_single_use() {
        let store = StateStore::new(600);
        let state = store.issue("alice", Uuid::new_v4(), None);

        assert!(store.consume(&state).is_some());
        assert!(store.consume(&state).is_none());
    }

    #[test]
    fn test_unknown_state_rejected() {
        let store = StateStore::new(600);
        assert!(store.consume("deadbeef").is_none());
    }

    #[test]
    fn test_expired_state_rejected() {
        let store = StateStore::new(0);
        let state = store.issue("bob", Uuid::new_v4(), None);

        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(store.consume(&state).is_none());
    }

    #[test]
    fn test_issue_prunes_expired_entries() {
        let store = StateStore::new(0);
        store.issue("user1", Uuid::new_v4(), None);
        store.issue("user2", Uuid::new_v4(), None);

        std::thread::sleep(std::time::Duration::from_millis(1100));

        // Issuing a fresh state drops the stale ones
        store.issue("user3", Uuid::new_v4(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_tokens_are_unique() {
        let store = StateStore::new(600);
        let a = store.issue("u", Uuid::new_v4(), None);
        let b = store.issue("u", Uuid::new_v4(), None);
        assert_ne!(a, b);
    }
}
