//! In-memory, read-mostly policy cache (spec §5 "Shared-resource policy").
//!
//! The teacher persists policy in SQLite behind a `Mutex<Connection>`
//! (`policy::store::PolicyStore`). Sentinel's access policy has no
//! chaining/versioning-history requirement, so the store here is a single
//! swappable snapshot behind `arc_swap`-free `parking_lot::RwLock` — readers
//! see the previous snapshot until a refresher swaps it, matching §5's
//! cache-coherence note without requiring an external refresh mechanism.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::PolicyError;
use crate::policy::eval::validate_structure;
use crate::policy::types::Policy;

/// Capability the orchestrator depends on (spec §9 "Orchestrator dependency
/// injection" — `PolicyLoader`).
#[async_trait]
pub trait PolicyLoader: Send + Sync {
    async fn current(&self) -> Result<Arc<Policy>, PolicyError>;
}

/// A single in-process snapshot, refreshable by `replace`.
pub struct InMemoryPolicyStore {
    current: RwLock<Arc<Policy>>,
}

impl InMemoryPolicyStore {
    pub fn new(policy: Policy) -> Result<Self, PolicyError> {
        validate_structure(&policy)?;
        Ok(InMemoryPolicyStore {
            current: RwLock::new(Arc::new(policy)),
        })
    }

    /// Validates before swapping so a malformed reload never replaces a
    /// known-good snapshot.
    pub fn replace(&self, policy: Policy) -> Result<(), PolicyError> {
        validate_structure(&policy)?;
        *self.current.write() = Arc::new(policy);
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<Policy> {
        self.current.read().clone()
    }
}

#[async_trait]
impl PolicyLoader for InMemoryPolicyStore {
    async fn current(&self) -> Result<Arc<Policy>, PolicyError> {
        Ok(self.snapshot())
    }
}
