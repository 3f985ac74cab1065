//! Component G — Session Registry (spec §4.G).
//!
//! Indices are maintained as auxiliary `HashMap<_, Vec<SessionId>>`
//! alongside the primary table, all behind one `parking_lot::RwLock`, per
//! the teacher's preference for `parking_lot` over `std::sync` locks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSession {
    pub session_id: String,
    pub requester: String,
    pub profile: String,
    pub role_arn: String,
    pub source_identity: String,
    pub device_id: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
}

impl ServerSession {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }
}

#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn create(&self, session: ServerSession) -> Result<ServerSession, SessionError>;
    async fn get(&self, session_id: &str) -> Result<ServerSession, SessionError>;
    async fn list_by_requester(&self, requester: &str) -> Result<Vec<ServerSession>, SessionError>;
    async fn list_by_profile(&self, profile: &str) -> Result<Vec<ServerSession>, SessionError>;
    async fn list_by_device_id(&self, device_id: &str) -> Result<Vec<ServerSession>, SessionError>;
    async fn list_active(&self) -> Result<Vec<ServerSession>, SessionError>;
    /// Idempotent: revoking an already-revoked session is a no-op success.
    async fn revoke(&self, session_id: &str, by: &str) -> Result<ServerSession, SessionError>;
}

struct Indices {
    by_id: HashMap<String, ServerSession>,
    by_requester: HashMap<String, Vec<String>>,
    by_profile: HashMap<String, Vec<String>>,
    by_device_id: HashMap<String, Vec<String>>,
}

impl Indices {
    fn new() -> Self {
        Indices {
            by_id: HashMap::new(),
            by_requester: HashMap::new(),
            by_profile: HashMap::new(),
            by_device_id: HashMap::new(),
        }
    }
}

pub struct InMemorySessionRegistry {
    state: Arc<RwLock<Indices>>,
}

impl InMemorySessionRegistry {
    pub fn new() -> Self {
        InMemorySessionRegistry {
            state: Arc::new(RwLock::new(Indices::new())),
        }
    }
}

impl Default for InMemorySessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn create(&self, session: ServerSession) -> Result<ServerSession, SessionError> {
        let mut state = self.state.write();
        state
            .by_requester
            .entry(session.requester.clone())
            .or_default()
            .push(session.session_id.clone());
        state
            .by_profile
            .entry(session.profile.clone())
            .or_default()
            .push(session.session_id.clone());
        if let Some(device_id) = &session.device_id {
            state
                .by_device_id
                .entry(device_id.clone())
                .or_default()
                .push(session.session_id.clone());
        }
        state.by_id.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, session_id: &str) -> Result<ServerSession, SessionError> {
        self.state
            .read()
            .by_id
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    async fn list_by_requester(&self, requester: &str) -> Result<Vec<ServerSession>, SessionError> {
        let state = self.state.read();
        Ok(state
            .by_requester
            .get(requester)
            .map(|ids| ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn list_by_profile(&self, profile: &str) -> Result<Vec<ServerSession>, SessionError> {
        let state = self.state.read();
        Ok(state
            .by_profile
            .get(profile)
            .map(|ids| ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn list_by_device_id(&self, device_id: &str) -> Result<Vec<ServerSession>, SessionError> {
        let state = self.state.read();
        Ok(state
            .by_device_id
            .get(device_id)
            .map(|ids| ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn list_active(&self) -> Result<Vec<ServerSession>, SessionError> {
        let now = Utc::now();
        Ok(self
            .state
            .read()
            .by_id
            .values()
            .filter(|s| s.is_active(now))
            .cloned()
            .collect())
    }

    async fn revoke(&self, session_id: &str, by: &str) -> Result<ServerSession, SessionError> {
        let mut state = self.state.write();
        let session = state
            .by_id
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        // Idempotent means `revoked` never flips back to `false`, not that
        // the first revoker wins — spec §5 calls for last-writer-wins on
        // `revoked_by`, so every call updates the attribution.
        session.revoked = true;
        session.revoked_at = Some(Utc::now());
        session.revoked_by = Some(by.to_string());
        Ok(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_session(id: &str) -> ServerSession {
        let now = Utc::now();
        ServerSession {
            session_id: id.to_string(),
            requester: "alice".into(),
            profile: "dev-read".into(),
            role_arn: "arn:aws:iam::1:role/dev-read".into(),
            source_identity: format!("sentinel:alice:{id}"),
            device_id: Some("d".repeat(64)),
            issued_at: now,
            expires_at: now + Duration::hours(1),
            revoked: false,
            revoked_at: None,
            revoked_by: None,
        }
    }

    #[tokio::test]
    async fn create_populates_all_indices() {
        let registry = InMemorySessionRegistry::new();
        registry.create(sample_session("s1")).await.unwrap();
        assert_eq!(registry.list_by_requester("alice").await.unwrap().len(), 1);
        assert_eq!(registry.list_by_profile("dev-read").await.unwrap().len(), 1);
        assert_eq!(registry.list_by_device_id(&"d".repeat(64)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn revoke_is_idempotent_but_last_writer_wins_on_attribution() {
        let registry = InMemorySessionRegistry::new();
        registry.create(sample_session("s1")).await.unwrap();
        let first = registry.revoke("s1", "bob").await.unwrap();
        assert!(first.revoked);
        let second = registry.revoke("s1", "carol").await.unwrap();
        assert!(second.revoked);
        assert_eq!(second.revoked_by.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn expired_session_is_inactive_even_if_not_revoked() {
        let registry = InMemorySessionRegistry::new();
        let mut session = sample_session("s1");
        session.expires_at = Utc::now() - Duration::seconds(1);
        registry.create(session).await.unwrap();
        assert!(registry.list_active().await.unwrap().is_empty());
    }
}
