//! Component J — Audit Logger (spec §4.J).
//!
//! Signing mirrors `freeq-auth-broker`'s `sign_body()`: HMAC-SHA-256 over a
//! canonical serialization, hex-encoded as a trailing field. Verification
//! uses `subtle::ConstantTimeEq` so timing does not leak how much of a
//! forged signature matched.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp_utc: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: String,
    pub resource: String,
    pub decision: String,
    pub correlation_id: String,
    pub fields: serde_json::Value,
    pub signature: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        actor: impl Into<String>,
        resource: impl Into<String>,
        decision: impl Into<String>,
        correlation_id: impl Into<String>,
        fields: serde_json::Value,
    ) -> Self {
        AuditEvent {
            timestamp_utc: Utc::now(),
            event_type: event_type.into(),
            actor: actor.into(),
            resource: resource.into(),
            decision: decision.into(),
            correlation_id: correlation_id.into(),
            fields,
            signature: None,
        }
    }

    /// Canonical bytes signed/verified: the envelope with `signature`
    /// cleared, serialized in struct declaration order.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        serde_json::to_vec(&unsigned).expect("AuditEvent is always serializable")
    }

    pub fn sign(&mut self, key: &[u8]) {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(&self.canonical_bytes());
        let signature = mac.finalize().into_bytes();
        self.signature = Some(hex::encode(signature));
    }

    /// Constant-time verification against the supplied key.
    pub fn verify(&self, key: &[u8]) -> bool {
        let Some(signature_hex) = &self.signature else {
            return false;
        };
        let Ok(expected) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(&self.canonical_bytes());
        let actual = mac.finalize().into_bytes();
        actual.ct_eq(&expected[..]).into()
    }

    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).expect("AuditEvent is always serializable")
    }
}

/// Pluggable forwarder; errors are logged but never block issuance
/// (fail-open, spec §4.J, §4.I).
pub trait AuditForwarder: Send + Sync {
    fn forward(&self, event: &AuditEvent) -> Result<(), String>;
}

/// The Open Question on forwarder-outage durability is resolved
/// stderr-only for this revision (see DESIGN.md) — no durable spool.
pub struct StderrForwarder;

impl AuditForwarder for StderrForwarder {
    fn forward(&self, event: &AuditEvent) -> Result<(), String> {
        eprintln!("{}", event.to_jsonl());
        Ok(())
    }
}

pub struct AuditLogger {
    signing_key: Vec<u8>,
    forwarder: Box<dyn AuditForwarder>,
}

impl AuditLogger {
    pub fn new(signing_key: Vec<u8>, forwarder: Box<dyn AuditForwarder>) -> Self {
        AuditLogger {
            signing_key,
            forwarder,
        }
    }

    /// Signs and emits an event. The stdout JSONL sink always runs; the
    /// forwarder is best-effort and never surfaces its error to the caller.
    pub fn emit(&self, mut event: AuditEvent) {
        event.sign(&self.signing_key);
        println!("{}", event.to_jsonl());
        if let Err(e) = self.forwarder.forward(&event) {
            tracing::warn!(error = %e, "audit forwarder failed, event already logged to stdout");
        }
    }
}
