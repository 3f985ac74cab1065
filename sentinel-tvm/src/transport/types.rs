//! Request/response DTOs for the HTTP transport (spec §6), following the
//! teacher's request-suffix/response-suffix naming convention
//! (`BrokerSessionRequest`/`BrokerSessionResponse`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::orchestrator::{CredentialRequest, IssueOutcome};
use crate::policy::Mode;

#[derive(Debug, Clone, Deserialize)]
pub struct IssueCredentialRequest {
    pub user: String,
    pub profile: String,
    pub mode: String,
    pub device_id: Option<String>,
    pub justification: Option<String>,
    pub requested_duration_secs: Option<i64>,
}

impl IssueCredentialRequest {
    /// Combines the body with the principal ARN the transport layer
    /// extracted from the (trusted) authenticator, per spec §4.L.
    pub fn into_domain(self, principal_arn: String) -> Result<CredentialRequest, String> {
        let mode = match self.mode.as_str() {
            "server" => Mode::Server,
            "cli" => Mode::Cli,
            "credential-process" => Mode::CredentialProcess,
            other => return Err(format!("unknown mode: {other}")),
        };
        Ok(CredentialRequest {
            user: self.user,
            profile: self.profile,
            mode,
            device_id: self.device_id,
            justification: self.justification,
            requested_duration_secs: self.requested_duration_secs,
            principal_arn,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum IssueCredentialResponse {
    Ok {
        access_key_id: String,
        secret_access_key: String,
        session_token: String,
        expiration: DateTime<Utc>,
        source_identity: String,
        session_id: String,
    },
    PendingApproval {
        request_id: String,
        expires_at: DateTime<Utc>,
    },
    Denied {
        reason: String,
        alternatives: Vec<String>,
    },
}

impl From<IssueOutcome> for IssueCredentialResponse {
    fn from(outcome: IssueOutcome) -> Self {
        match outcome {
            IssueOutcome::Credential {
                access_key_id,
                secret_access_key,
                session_token,
                expiration,
                source_identity,
                session_id,
            } => IssueCredentialResponse::Ok {
                access_key_id,
                secret_access_key,
                session_token,
                expiration,
                source_identity,
                session_id,
            },
            IssueOutcome::Deferred { request_id, expires_at } => {
                IssueCredentialResponse::PendingApproval { request_id, expires_at }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateApprovalRequest {
    pub status: String,
    pub by: String,
    pub expected_version: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBreakGlassRequest {
    pub invoker: String,
    pub profile: String,
    pub reason_code: String,
    pub justification: String,
    pub ttl_secs: i64,
}
