//! Crate-wide error taxonomy.
//!
//! Every operational boundary wraps its failure into a stable, automatable
//! code and a single safe-to-display suggestion string. Raw upstream error
//! text is preserved on the `String` payload for audit/debug logging but
//! must never reach a caller-visible message verbatim.

use thiserror::Error;

/// The taxonomy a caller of the orchestrator can observe (spec §7).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("policy denied: {reason}")]
    PolicyDenied {
        reason: String,
        alternatives: Vec<String>,
    },

    #[error("rate limit exceeded")]
    TooManyRequests,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("break-glass already active for this invoker/profile")]
    AlreadyActive,

    #[error("upstream unavailable ({dependency}): {detail}")]
    UpstreamUnavailable { dependency: &'static str, detail: String },

    #[error("internal error")]
    Internal,
}

impl OrchestratorError {
    /// Stable code used to drive automation; equality of codes is the
    /// contract, not the Display text.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "ValidationError",
            OrchestratorError::PolicyDenied { .. } => "PolicyDenied",
            OrchestratorError::TooManyRequests => "TooManyRequests",
            OrchestratorError::Conflict(_) => "Conflict",
            OrchestratorError::AlreadyActive => "AlreadyActive",
            OrchestratorError::UpstreamUnavailable { .. } => "UpstreamUnavailable",
            OrchestratorError::Internal => "Internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unsupported policy schema version: {0}")]
    UnsupportedVersion(String),
    #[error("policy validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum PostureError {
    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),
    #[error("mdm provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Error)]
pub enum RequestStoreError {
    #[error("approval request not found: {0}")]
    NotFound(String),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("conflict: stale update for {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum BreakGlassError {
    #[error("break-glass event not found: {0}")]
    NotFound(String),
    #[error("already active for invoker={invoker} profile={profile}")]
    AlreadyActive { invoker: String, profile: String },
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("denied by reason-code policy")]
    ReasonDenied,
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit store error: {0}")]
    Store(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum StsError {
    #[error("missing source identity")]
    MissingSourceIdentity,
    #[error("invalid source identity: {0}")]
    InvalidSourceIdentity(String),
    #[error("STS call failed: {0}")]
    StsFailure(String),
}

impl From<StsError> for OrchestratorError {
    fn from(e: StsError) -> Self {
        OrchestratorError::UpstreamUnavailable {
            dependency: "sts",
            detail: e.to_string(),
        }
    }
}

impl From<RequestStoreError> for OrchestratorError {
    fn from(e: RequestStoreError) -> Self {
        match e {
            RequestStoreError::Conflict(msg) => OrchestratorError::Conflict(msg),
            other => OrchestratorError::UpstreamUnavailable {
                dependency: "request_store",
                detail: other.to_string(),
            },
        }
    }
}

impl From<BreakGlassError> for OrchestratorError {
    fn from(e: BreakGlassError) -> Self {
        match e {
            BreakGlassError::AlreadyActive { .. } => OrchestratorError::AlreadyActive,
            other => OrchestratorError::UpstreamUnavailable {
                dependency: "breakglass_store",
                detail: other.to_string(),
            },
        }
    }
}

impl From<PolicyError> for OrchestratorError {
    fn from(e: PolicyError) -> Self {
        OrchestratorError::Internal.tap_log(&e)
    }
}

impl OrchestratorError {
    /// Logs the internal cause at error level before returning `self`,
    /// so the safe external variant never needs to carry upstream text.
    fn tap_log(self, cause: &dyn std::error::Error) -> Self {
        tracing::error!(cause = %cause, "internal error");
        self
    }
}
