//! Component A — Source-Identity generation and parsing.
//!
//! `SourceIdentity` is the forensically distinctive string stamped on every
//! STS session: `sentinel:<user>:<req-id>`. It must fit AWS's
//! `SourceIdentity` constraints (<=64 chars, charset `[a-zA-Z0-9_=,.@-]`)
//! and is immutable once issued.

use rand::RngCore;

const PREFIX: &str = "sentinel";
const MAX_SOURCE_IDENTITY_LEN: usize = 64;

/// 16 lowercase hex characters (64 bits) identifying one request instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh request id from a CSPRNG.
    pub fn new() -> Self {
        let mut bytes = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        RequestId(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a request id, validating it is exactly 16 lowercase hex chars.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 16 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            Some(RequestId(s.to_string()))
        } else {
            None
        }
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable, parsed `SourceIdentity` of the form `sentinel:<user>:<req-id>`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourceIdentity {
    formatted: String,
    user: String,
    request_id: RequestId,
}

impl SourceIdentity {
    /// Build a `SourceIdentity` from a raw user string and a request id.
    /// The user portion is sanitized: any byte outside
    /// `[A-Za-z0-9_-]` is dropped, then runs of `-`/`_` are collapsed.
    pub fn format(user: &str, request_id: RequestId) -> Self {
        let sanitized = sanitize_user(user);
        let formatted = format!("{PREFIX}:{sanitized}:{request_id}");
        // Guard against pathologically long usernames blowing the AWS limit;
        // truncate the user segment, not the request id, to keep forensics intact.
        let formatted = if formatted.len() > MAX_SOURCE_IDENTITY_LEN {
            let budget = MAX_SOURCE_IDENTITY_LEN
                .saturating_sub(PREFIX.len() + 2 + request_id.as_str().len());
            let truncated: String = sanitized.chars().take(budget).collect();
            format!("{PREFIX}:{truncated}:{request_id}")
        } else {
            formatted
        };
        SourceIdentity {
            formatted,
            user: sanitized,
            request_id,
        }
    }

    /// Parse a full `sentinel:<user>:<req-id>` string.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("sentinel:")?;
        let (user, req_id_str) = rest.rsplit_once(':')?;
        if user.is_empty() {
            return None;
        }
        let request_id = RequestId::parse(req_id_str)?;
        Some(SourceIdentity {
            formatted: s.to_string(),
            user: user.to_string(),
            request_id,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.formatted
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }
}

impl std::fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.formatted)
    }
}

fn sanitize_user(user: &str) -> String {
    let filtered: String = user
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    collapse_separators(&filtered)
}

fn collapse_separators(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_sep = false;
    for c in s.chars() {
        let is_sep = c == '-' || c == '_';
        if is_sep && last_was_sep {
            continue;
        }
        out.push(c);
        last_was_sep = is_sep;
    }
    out
}
