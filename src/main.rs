use std::sync::Arc;

use anyhow::Context as _;
use inbox_policy::api::{AppState, router};
use inbox_policy::config::EngineConfig;
use inbox_policy::executor::{ExecutorRegistry, UnconfiguredExecutor, WebhookExecutor};
use inbox_policy::pipeline::ProposalEngine;
use inbox_policy::store::{Database, LibSqlBackend};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env().context("invalid configuration")?;

    eprintln!("📬 Inbox Policy v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}/api", config.port);
    eprintln!("   Events WS: ws://0.0.0.0:{}/ws", config.port);
    eprintln!("   Min confidence: {}", config.min_confidence);
    match &config.webhook_url {
        Some(url) => eprintln!("   Executor webhook: {}\n", url),
        None => eprintln!("   Executor webhook: (none, approvals will fail)\n"),
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Executors ────────────────────────────────────────────────────────
    let executors = Arc::new(ExecutorRegistry::new(config.executor_timeout));
    for action_type in &config.action_types {
        match &config.webhook_url {
            Some(url) => {
                executors
                    .register(Arc::new(WebhookExecutor::new(action_type.clone(), url.clone())))
                    .await
            }
            None => {
                executors
                    .register(Arc::new(UnconfiguredExecutor::new(action_type.clone())))
                    .await
            }
        }
    }
    info!(count = executors.count(), "Executors registered");

    // ── HTTP server ──────────────────────────────────────────────────────
    let engine = ProposalEngine::new(config.min_confidence);
    let app = router(AppState::build(db, executors, engine));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "Listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
