//! Component D — Approval Request store & state machine (spec §4.D).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::RequestStoreError;

pub const MAX_REQUESTED_DURATION_SECS: i64 = 8 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub requester: String,
    pub profile: String,
    pub justification: String,
    pub requested_duration_secs: i64,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<String>,
    /// Optimistic-concurrency token; bumped on every accepted transition.
    pub version: u64,
}

impl ApprovalRequest {
    pub fn new(
        requester: impl Into<String>,
        profile: impl Into<String>,
        justification: impl Into<String>,
        requested_duration_secs: i64,
        ttl: Duration,
    ) -> Result<Self, RequestStoreError> {
        if requested_duration_secs <= 0 || requested_duration_secs > MAX_REQUESTED_DURATION_SECS {
            return Err(RequestStoreError::Validation(format!(
                "requested_duration_secs {requested_duration_secs} exceeds the {MAX_REQUESTED_DURATION_SECS}s cap"
            )));
        }
        let created_at = Utc::now();
        let expires_at = created_at + ttl;
        if expires_at <= created_at {
            return Err(RequestStoreError::Validation("expires_at must be after created_at".into()));
        }
        Ok(ApprovalRequest {
            id: crate::identity::RequestId::new().to_string(),
            requester: requester.into(),
            profile: profile.into(),
            justification: justification.into(),
            requested_duration_secs,
            status: RequestStatus::Pending,
            created_at,
            expires_at,
            decided_at: None,
            decided_by: None,
            version: 0,
        })
    }

    /// Lazy-expiration view: a `pending` record outliving `expires_at`
    /// reads as terminal `expired` without a store mutation.
    pub fn effective_status(&self, now: DateTime<Utc>) -> RequestStatus {
        if self.status == RequestStatus::Pending && now >= self.expires_at {
            RequestStatus::Expired
        } else {
            self.status
        }
    }
}

/// Pure transition function (spec §9 "State-machine re-architecture").
/// Idempotent no-op transition to the same status is permitted; any other
/// transition attempted on a terminal request is `InvalidTransition`.
pub fn transition(
    current: RequestStatus,
    target: RequestStatus,
) -> Result<RequestStatus, RequestStoreError> {
    if current == target {
        return Ok(current);
    }
    if current.is_terminal() {
        return Err(RequestStoreError::InvalidTransition {
            from: format!("{current:?}"),
            to: format!("{target:?}"),
        });
    }
    Ok(target)
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn create(&self, request: ApprovalRequest) -> Result<ApprovalRequest, RequestStoreError>;
    async fn get(&self, id: &str) -> Result<ApprovalRequest, RequestStoreError>;
    async fn update_status(
        &self,
        id: &str,
        target: RequestStatus,
        by: &str,
        expected_version: u64,
    ) -> Result<ApprovalRequest, RequestStoreError>;
    async fn list_by_requester(&self, requester: &str) -> Result<Vec<ApprovalRequest>, RequestStoreError>;
    async fn list_by_status(&self, status: RequestStatus) -> Result<Vec<ApprovalRequest>, RequestStoreError>;
    async fn list_by_profile(&self, profile: &str) -> Result<Vec<ApprovalRequest>, RequestStoreError>;
    /// Any `approved` request matching requester+profile whose `expires_at > now`.
    async fn find_approved(
        &self,
        requester: &str,
        profile: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovalRequest>, RequestStoreError>;
    /// Lazily transitions overdue `pending` rows to `expired` in bulk.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, RequestStoreError>;
}

pub struct InMemoryRequestStore {
    rows: Arc<DashMap<String, RwLock<ApprovalRequest>>>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        InMemoryRequestStore {
            rows: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn create(&self, request: ApprovalRequest) -> Result<ApprovalRequest, RequestStoreError> {
        let id = request.id.clone();
        let out = request.clone();
        self.rows.insert(id, RwLock::new(request));
        Ok(out)
    }

    async fn get(&self, id: &str) -> Result<ApprovalRequest, RequestStoreError> {
        let row = self
            .rows
            .get(id)
            .ok_or_else(|| RequestStoreError::NotFound(id.to_string()))?;
        let mut req = row.read().clone();
        req.status = req.effective_status(Utc::now());
        Ok(req)
    }

    async fn update_status(
        &self,
        id: &str,
        target: RequestStatus,
        by: &str,
        expected_version: u64,
    ) -> Result<ApprovalRequest, RequestStoreError> {
        let row = self
            .rows
            .get(id)
            .ok_or_else(|| RequestStoreError::NotFound(id.to_string()))?;
        let mut guard = row.write();
        let effective = guard.effective_status(Utc::now());
        if guard.version != expected_version {
            return Err(RequestStoreError::Conflict(id.to_string()));
        }
        let next = transition(effective, target)?;
        guard.status = next;
        guard.version += 1;
        if next != RequestStatus::Pending {
            guard.decided_at = Some(Utc::now());
            guard.decided_by = Some(by.to_string());
        }
        Ok(guard.clone())
    }

    async fn list_by_requester(&self, requester: &str) -> Result<Vec<ApprovalRequest>, RequestStoreError> {
        Ok(self
            .rows
            .iter()
            .map(|r| r.value().read().clone())
            .filter(|r| r.requester == requester)
            .collect())
    }

    async fn list_by_status(&self, status: RequestStatus) -> Result<Vec<ApprovalRequest>, RequestStoreError> {
        let now = Utc::now();
        Ok(self
            .rows
            .iter()
            .map(|r| r.value().read().clone())
            .filter(|r| r.effective_status(now) == status)
            .collect())
    }

    async fn list_by_profile(&self, profile: &str) -> Result<Vec<ApprovalRequest>, RequestStoreError> {
        Ok(self
            .rows
            .iter()
            .map(|r| r.value().read().clone())
            .filter(|r| r.profile == profile)
            .collect())
    }

    async fn find_approved(
        &self,
        requester: &str,
        profile: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovalRequest>, RequestStoreError> {
        Ok(self
            .rows
            .iter()
            .map(|r| r.value().read().clone())
            .find(|r| {
                r.requester == requester
                    && r.profile == profile
                    && r.status == RequestStatus::Approved
                    && r.expires_at > now
            }))
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, RequestStoreError> {
        let mut swept = 0;
        for row in self.rows.iter() {
            let mut guard = row.value().write();
            if guard.status == RequestStatus::Pending && now >= guard.expires_at {
                guard.status = RequestStatus::Expired;
                guard.version += 1;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = InMemoryRequestStore::new();
        let req = ApprovalRequest::new("alice", "dev-read", "need access", 3600, Duration::hours(4)).unwrap();
        let id = req.id.clone();
        store.create(req).await.unwrap();
        let fetched = store.get(&id).await.unwrap();
        assert_eq!(fetched.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_state_rejects_further_transition() {
        let store = InMemoryRequestStore::new();
        let req = ApprovalRequest::new("alice", "dev-read", "j", 3600, Duration::hours(4)).unwrap();
        let id = req.id.clone();
        store.create(req).await.unwrap();
        store
            .update_status(&id, RequestStatus::Denied, "bob", 0)
            .await
            .unwrap();
        let result = store.update_status(&id, RequestStatus::Approved, "bob", 1).await;
        assert!(matches!(result, Err(RequestStoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn stale_version_is_conflict() {
        let store = InMemoryRequestStore::new();
        let req = ApprovalRequest::new("alice", "dev-read", "j", 3600, Duration::hours(4)).unwrap();
        let id = req.id.clone();
        store.create(req).await.unwrap();
        let result = store.update_status(&id, RequestStatus::Approved, "bob", 99).await;
        assert!(matches!(result, Err(RequestStoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn idempotent_same_status_transition_succeeds() {
        let store = InMemoryRequestStore::new();
        let req = ApprovalRequest::new("alice", "dev-read", "j", 3600, Duration::hours(4)).unwrap();
        let id = req.id.clone();
        store.create(req).await.unwrap();
        let approved = store
            .update_status(&id, RequestStatus::Approved, "bob", 0)
            .await
            .unwrap();
        let again = store
            .update_status(&id, RequestStatus::Approved, "bob", approved.version)
            .await
            .unwrap();
        assert_eq!(again.status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn requested_duration_over_eight_hours_rejected() {
        let result = ApprovalRequest::new("alice", "dev-read", "j", 9 * 3600, Duration::hours(4));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sweep_expires_overdue_pending_requests() {
        let store = InMemoryRequestStore::new();
        let mut req = ApprovalRequest::new("alice", "dev-read", "j", 3600, Duration::hours(4)).unwrap();
        req.expires_at = Utc::now() - Duration::seconds(1);
        store.create(req).await.unwrap();
        let swept = store.sweep(Utc::now()).await.unwrap();
        assert_eq!(swept, 1);
    }
}
