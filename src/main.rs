#![deny(unused)]
//! ctrl: control plane for agent tool invocations.
//!
//! Loads and validates the three config documents, opens the audit store,
//! and serves the approval API. Interception runs in the embedding agent
//! runtime via `ctrl_proxy::Interceptor`; this process owns the pending →
//! approved/denied side of the lifecycle.

use std::sync::Arc;
use std::time::Duration;

use ctrl_approvals::{ApprovalsConfig, ApprovalsServer};
use ctrl_core::config::{load_policy, load_risk, load_servers, AppConfig};
use ctrl_proxy::HttpToolExecutor;
use ctrl_risk::RiskEngine;
use ctrl_store::AuditStore;

fn init_tracing(json_logs: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,ctrl=debug"));

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = AppConfig::load()?;
    init_tracing(app_config.json_logs);

    tracing::info!("Starting ctrl v{}", env!("CARGO_PKG_VERSION"));

    // Config errors are fatal at startup, before anything is served.
    let servers = load_servers(&app_config.servers_path)?;
    let policy = load_policy(&app_config.policy_path)?;
    let risk = load_risk(&app_config.risk_path)?;

    let lint = ctrl_policy::lint_policy(&policy, true);
    for warning in &lint.warnings {
        tracing::warn!(%warning, "policy lint");
    }
    if !lint.errors.is_empty() {
        for error in &lint.errors {
            tracing::error!(%error, "policy lint");
        }
        anyhow::bail!("policy config failed lint");
    }

    // Validates the risk document; scoring itself runs in the agent runtime.
    let _ = RiskEngine::new(risk)?;

    let store = AuditStore::open(&app_config.db_path)?;
    tracing::info!(db = %app_config.db_path, servers = servers.servers.len(), "Audit store ready");

    let executor = Arc::new(HttpToolExecutor::new(
        servers,
        Duration::from_secs(app_config.tool_timeout_secs),
    )?);

    println!();
    println!("ctrl v{} approvals API", env!("CARGO_PKG_VERSION"));
    println!("  GET  /pending        - pending requests");
    println!("  GET  /requests       - request history");
    println!("  GET  /status/{{id}}    - request detail");
    println!("  POST /approve/{{id}}   - approve and execute");
    println!("  POST /deny/{{id}}      - deny");
    println!("  listening on http://{}:{}", app_config.host, app_config.port);
    println!();

    let server = ApprovalsServer::new(
        ApprovalsConfig {
            host: app_config.host.clone(),
            port: app_config.port,
        },
        store,
        executor,
    );
    server.run().await?;

    Ok(())
}
