//! Process configuration (spec §0, §6), parsed from environment variables
//! the same way `freeq-server::config::ServerConfig::parse()` does via
//! `clap`'s `env` feature.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "sentinel-tvm", about = "Intent-aware AWS credential vending service")]
pub struct Config {
    /// Address the HTTP transport binds to.
    #[arg(long, env = "SENTINEL_BIND_ADDR", default_value = "0.0.0.0:8443")]
    pub bind_addr: String,

    /// Selects a distributed rate-limit backend; unset means the
    /// in-process `DashMap` limiter is used, which logs a warning in a
    /// multi-worker deployment (spec §6).
    #[arg(long, env = "rate-limit-table-name")]
    pub rate_limit_table_name: Option<String>,

    /// Selects the device-posture (MDM) provider implementation.
    #[arg(long, env = "mdm-provider", default_value = "null")]
    pub mdm_provider: String,

    /// Hex-encoded HMAC-SHA-256 key used to sign audit events.
    #[arg(long, env = "audit-signing-key")]
    pub audit_signing_key: String,

    /// Opaque configuration string for the audit forwarder sink.
    #[arg(long, env = "audit-forwarder-config")]
    pub audit_forwarder_config: Option<String>,

    /// Default stream/function name the audit forwarder targets.
    #[arg(long, env = "tvm-function-name", default_value = "sentinel-tvm")]
    pub tvm_function_name: String,

    /// Default STS session duration in seconds when no cap applies.
    #[arg(long, env = "SENTINEL_DEFAULT_SESSION_DURATION_SECS", default_value_t = 3600)]
    pub default_session_duration_secs: i64,

    /// Overall per-request timeout budget, in seconds.
    #[arg(long, env = "SENTINEL_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Fixed-window size for the rate limiter, in seconds.
    #[arg(long, env = "SENTINEL_RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    pub rate_limit_window_secs: i64,

    /// Max requests admitted per window per principal.
    #[arg(long, env = "SENTINEL_RATE_LIMIT_MAX_REQUESTS", default_value_t = 100)]
    pub rate_limit_max_requests: u64,
}

impl Config {
    pub fn decoded_audit_signing_key(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.audit_signing_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_env() {
        let config = Config::parse_from([
            "sentinel-tvm",
            "--audit-signing-key",
            "00ff",
        ]);
        assert_eq!(config.bind_addr, "0.0.0.0:8443");
        assert_eq!(config.default_session_duration_secs, 3600);
        assert_eq!(config.decoded_audit_signing_key().unwrap(), vec![0x00, 0xff]);
    }
}
