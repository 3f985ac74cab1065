//! Component H — STS Assume-Role Pipeline (spec §4.H).
//!
//! Hop-1 (the TVM's own execution identity) is implicit, resolved by
//! `aws-config` from the process environment/instance role. Hop-2 is a
//! real `aws-sdk-sts` `AssumeRole` call with `.source_identity(...)` set —
//! the idiomatic choice over a hand-rolled XML client, and the crate whose
//! request/response shapes the retrieved corpus's own STS reference code
//! mirrors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StsError;
use crate::identity::SourceIdentity;

#[derive(Debug, Clone)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub session_name: String,
    pub duration_secs: i64,
    pub source_identity: SourceIdentity,
}

#[derive(Debug, Clone)]
pub struct AssumedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

/// Default session-name prefix (spec §4.H: `sentinel-<nanosecond-timestamp>`).
pub fn default_session_name(now_nanos: i128) -> String {
    format!("sentinel-{now_nanos}")
}

/// Trait boundary so the orchestrator can be tested against an in-memory
/// fake (spec §9 DI design) instead of live AWS.
#[async_trait]
pub trait AssumeRolePipeline: Send + Sync {
    async fn assume_role(&self, request: AssumeRoleRequest) -> Result<AssumedCredentials, StsError>;
}

pub struct RealStsClient {
    client: aws_sdk_sts::Client,
}

impl RealStsClient {
    /// Resolves hop-1 credentials from the ambient environment (env vars,
    /// instance profile, container credentials) via `aws-config`.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        RealStsClient {
            client: aws_sdk_sts::Client::new(&config),
        }
    }
}

#[async_trait]
impl AssumeRolePipeline for RealStsClient {
    async fn assume_role(&self, request: AssumeRoleRequest) -> Result<AssumedCredentials, StsError> {
        if request.source_identity.as_str().is_empty() {
            return Err(StsError::MissingSourceIdentity);
        }
        let output = self
            .client
            .assume_role()
            .role_arn(&request.role_arn)
            .role_session_name(&request.session_name)
            .duration_seconds(request.duration_secs as i32)
            .source_identity(request.source_identity.as_str())
            .send()
            .await
            .map_err(|e| StsError::StsFailure(e.to_string()))?;

        let creds = output
            .credentials()
            .ok_or_else(|| StsError::StsFailure("AssumeRole response missing credentials".into()))?;

        let expiration = DateTime::from_timestamp(creds.expiration().secs(), 0)
            .ok_or_else(|| StsError::StsFailure("AssumeRole response has an invalid expiration".into()))?;

        Ok(AssumedCredentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().to_string(),
            expiration,
        })
    }
}

/// In-memory fake returning canned credentials, for orchestrator tests.
pub struct FakeStsClient {
    pub credentials: AssumedCredentials,
}

#[async_trait]
impl AssumeRolePipeline for FakeStsClient {
    async fn assume_role(&self, request: AssumeRoleRequest) -> Result<AssumedCredentials, StsError> {
        if request.source_identity.as_str().is_empty() {
            return Err(StsError::MissingSourceIdentity);
        }
        Ok(self.credentials.clone())
    }
}
