use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use clap::Parser;
use sentinel_tvm::audit::{AuditLogger, StderrForwarder};
use sentinel_tvm::breakglass::InMemoryBreakGlassStore;
use sentinel_tvm::config::Config;
use sentinel_tvm::notify::NoopSink;
use sentinel_tvm::orchestrator::{Orchestrator, OrchestratorDeps, ResolvedProfile, StaticProfileResolver};
use sentinel_tvm::policy::{InMemoryPolicyStore, Policy};
use sentinel_tvm::posture::NullPostureProvider;
use sentinel_tvm::ratelimit::{InMemoryRateLimitStore, RateLimitConfig};
use sentinel_tvm::requests::{InMemoryRequestStore, RequestStore};
use sentinel_tvm::sessions::InMemorySessionRegistry;
use sentinel_tvm::sts::RealStsClient;
use sentinel_tvm::transport::{router, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::parse();
    tracing::info!(bind_addr = %config.bind_addr, mdm_provider = %config.mdm_provider, "starting sentinel-tvm");

    if config.rate_limit_table_name.is_none() {
        tracing::warn!("rate-limit-table-name is unset; using the in-process limiter, which does not coordinate across workers");
    }

    let audit_key = config
        .decoded_audit_signing_key()
        .map_err(|e| anyhow::anyhow!("audit-signing-key must be hex-encoded: {e}"))?;

    let policy_loader = Arc::new(InMemoryPolicyStore::new(Policy::new(vec![]))?);
    let posture_provider = Arc::new(NullPostureProvider);
    let request_store = Arc::new(InMemoryRequestStore::new());
    let breakglass_store = Arc::new(InMemoryBreakGlassStore::new());
    let rate_limit_store = Arc::new(InMemoryRateLimitStore::new());
    let session_registry = Arc::new(InMemorySessionRegistry::new());
    let sts_client = Arc::new(RealStsClient::from_env().await);
    let audit_logger = Arc::new(AuditLogger::new(audit_key, Box::new(StderrForwarder)));
    let notification_sink = Arc::new(NoopSink);
    let profile_resolver = Arc::new(StaticProfileResolver::new(HashMap::<String, ResolvedProfile>::new()));

    let deps = OrchestratorDeps {
        policy_loader,
        posture_provider,
        request_store: request_store.clone(),
        breakglass_store: breakglass_store.clone(),
        rate_limit_store,
        rate_limit_config: RateLimitConfig {
            window_secs: config.rate_limit_window_secs,
            max_requests: config.rate_limit_max_requests,
        },
        sts_client,
        session_registry,
        audit_logger,
        notification_sink,
        profile_resolver,
        default_session_duration_secs: config.default_session_duration_secs,
        approval_request_ttl: Duration::hours(8),
    };

    spawn_request_sweeper(request_store.clone());

    let state = Arc::new(AppState {
        orchestrator: Orchestrator::new(deps),
        request_store,
        breakglass_store,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(bind_addr = %config.bind_addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SENTINEL_LOG_JSON").map(|v| v == "1").unwrap_or(false);
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Background sweeper transitioning overdue `pending` approval requests to
/// `expired` in bulk (spec §4.D "may be updated to expired by a sweeper").
fn spawn_request_sweeper(request_store: Arc<InMemoryRequestStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(StdDuration::from_secs(60));
        loop {
            interval.tick().await;
            match request_store.sweep(chrono::Utc::now()).await {
                Ok(swept) if swept > 0 => tracing::info!(swept, "expired overdue approval requests"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "request sweeper failed"),
            }
        }
    });
}
