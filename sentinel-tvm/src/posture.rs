//! Component C — Device Posture Gate (spec §4.C).
//!
//! Server-side only: callers pass a device-id, never a posture claim.
//! Mirrors the teacher's `verifiers` module shape (`verifiers::github`,
//! `verifiers::bluesky` as interchangeable credential sources), generalized
//! here to interchangeable MDM posture sources.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::PostureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PostureStatus {
    Compliant,
    NonCompliant,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePosture {
    pub device_id: String,
    pub status: PostureStatus,
    pub mdm_enrolled: bool,
    pub encrypted: bool,
    pub os_version: String,
    pub last_seen: DateTime<Utc>,
}

/// `device-id` must be 64 lowercase hex chars, per spec §4.C.
pub fn validate_device_id(device_id: &str) -> Result<(), PostureError> {
    if device_id.len() == 64 && device_id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(PostureError::InvalidDeviceId(device_id.to_string()))
    }
}

#[async_trait]
pub trait DevicePostureProvider: Send + Sync {
    async fn lookup(&self, device_id: &str) -> Result<Option<DevicePosture>, PostureError>;
    fn name(&self) -> &str;
}

/// Always reports no posture; used when no MDM integration is configured.
pub struct NullPostureProvider;

#[async_trait]
impl DevicePostureProvider for NullPostureProvider {
    async fn lookup(&self, _device_id: &str) -> Result<Option<DevicePosture>, PostureError> {
        Ok(None)
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// In-memory posture map, for tests and small fixed-fleet deployments.
pub struct StaticPostureProvider {
    postures: DashMap<String, DevicePosture>,
}

impl StaticPostureProvider {
    pub fn new() -> Self {
        StaticPostureProvider {
            postures: DashMap::new(),
        }
    }

    pub fn insert(&self, posture: DevicePosture) {
        self.postures.insert(posture.device_id.clone(), posture);
    }
}

impl Default for StaticPostureProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DevicePostureProvider for StaticPostureProvider {
    async fn lookup(&self, device_id: &str) -> Result<Option<DevicePosture>, PostureError> {
        Ok(self.postures.get(device_id).map(|r| r.value().clone()))
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Merges first-non-nil lookup across an ordered list of providers; a
/// provider error is logged and treated as a soft miss, not a hard failure
/// — the posture layer fails open to `unknown`, the policy layer then
/// fails closed on any non-empty device condition (spec §4.C).
pub struct CompositePostureProvider {
    providers: Vec<Box<dyn DevicePostureProvider>>,
}

impl CompositePostureProvider {
    pub fn new(providers: Vec<Box<dyn DevicePostureProvider>>) -> Self {
        CompositePostureProvider { providers }
    }
}

#[async_trait]
impl DevicePostureProvider for CompositePostureProvider {
    async fn lookup(&self, device_id: &str) -> Result<Option<DevicePosture>, PostureError> {
        for provider in &self.providers {
            match provider.lookup(device_id).await {
                Ok(Some(posture)) => return Ok(Some(posture)),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(provider = provider.name(), error = %e, "posture provider failed, trying next");
                    continue;
                }
            }
        }
        Ok(None)
    }

    fn name(&self) -> &str {
        "composite"
    }
}
