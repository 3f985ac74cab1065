//! Component B — Policy data model (spec §3, §4.B, §6).
//!
//! A `Policy` is a flat, ordered rule list plus a schema version. Unlike the
//! teacher's hash-chained `PolicyDocument`, Sentinel's access policy has no
//! chaining requirement — only `version` gates compatibility.

use serde::{Deserialize, Serialize};

pub const POLICY_SCHEMA_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Effect {
    Allow,
    Deny,
    RequireApproval,
}

/// Delivery mode the credential is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Server,
    Cli,
    CredentialProcess,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Server => "server",
            Mode::Cli => "cli",
            Mode::CredentialProcess => "credential-process",
        }
    }
}

/// `days`: 0 = Sunday .. 6 = Saturday, per spec. `start`/`end` are `HH:MM`
/// in UTC; the window is start-inclusive, end-exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub days: Vec<u8>,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DeviceCondition {
    pub require_mdm: bool,
    pub require_compliant: bool,
    pub require_encryption: bool,
    pub min_os_version: Option<String>,
}

impl DeviceCondition {
    pub fn is_empty(&self) -> bool {
        !self.require_mdm
            && !self.require_compliant
            && !self.require_encryption
            && self.min_os_version.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Rule {
    pub effect: Option<Effect>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub mode: Vec<Mode>,
    pub time_window: Option<TimeWindow>,
    pub device: Option<DeviceCondition>,
    pub max_server_duration: Option<u64>,
    /// Resolved name §9: a `require-approval` rule may additionally carry
    /// `auto_approve: true`, short-circuiting the initial transition.
    #[serde(default)]
    pub auto_approve: bool,
}

impl Rule {
    /// True when every condition slot is empty — the wildcard-match rule.
    pub fn is_wildcard(&self) -> bool {
        self.profiles.is_empty()
            && self.users.is_empty()
            && self.mode.is_empty()
            && self.time_window.is_none()
            && self.device.as_ref().map(DeviceCondition::is_empty).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub version: String,
    pub rules: Vec<Rule>,
}

impl Policy {
    pub fn new(rules: Vec<Rule>) -> Self {
        Policy {
            version: POLICY_SCHEMA_VERSION.to_string(),
            rules,
        }
    }
}
