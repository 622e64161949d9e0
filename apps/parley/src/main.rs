use std::{sync::Arc, time::Duration};

use parley_core::{
    config::AppConfig,
    http::{self, AppState},
    metering::{PriceRegistry, UsageMeter},
    model::ModelRouter,
    orchestrator::{OrchestratorSettings, TurnDependencies, TurnOrchestrator},
    retrieval::{HttpRetriever, RetrievalAdapter, Retriever},
    safety::{HeuristicModerationProvider, ModerationPolicy, SafetyGate},
    store::{ChatStore, InMemoryChatStore, PostgresChatStore},
    tools::{HttpToolClient, ToolEngine, ToolExecutor, ToolRegistry},
    webhooks::WebhookDispatcher,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;

    let store = build_store(&config).await?;
    let models = Arc::new(ModelRouter::from_config(&config)?);
    info!(provider = models.default_kind().as_str(), "model router ready");

    let tools: Arc<dyn ToolExecutor> = Arc::new(ToolEngine::new(
        Arc::new(ToolRegistry::with_builtins()),
        store.clone(),
        HttpToolClient::default(),
        Duration::from_millis(config.tool_timeout_ms),
    ));
    let safety = Arc::new(SafetyGate::new(
        Arc::new(HeuristicModerationProvider),
        store.clone(),
        ModerationPolicy::platform_default(),
    ));
    let webhooks = Arc::new(WebhookDispatcher::new(
        store.clone(),
        config.webhook_batch_size,
        Duration::from_millis(config.webhook_timeout_ms),
    )?);
    let meter = Arc::new(UsageMeter::new(store.clone(), PriceRegistry::default()));

    let orchestrator = Arc::new(TurnOrchestrator::new(
        TurnDependencies {
            store,
            models,
            tools: tools.clone(),
            safety,
            retrieval: build_retrieval(&config),
            webhooks: webhooks.clone(),
            meter,
        },
        OrchestratorSettings::from_config(&config),
    ));

    if config.webhook_worker_enabled {
        let interval = Duration::from_millis(config.webhook_drain_interval_ms.max(100));
        webhooks.clone().spawn_drain_worker(interval);
    } else {
        warn!("WEBHOOK_WORKER_ENABLED=false; deliveries drain only via POST /internal/webhooks/drain");
    }

    let app = http::router(AppState {
        orchestrator,
        tools,
        webhooks,
    });
    let listener = TcpListener::bind(config.http_bind).await?;
    info!("Parley HTTP API listening on {}", config.http_bind);

    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn ChatStore>> {
    if let Some(database_url) = &config.database_url {
        let store = PostgresChatStore::connect(database_url).await?;
        store.ensure_schema().await?;
        info!("Connected to Postgres chat store");
        Ok(Arc::new(store))
    } else {
        warn!("DATABASE_URL not set; using in-memory store");
        Ok(Arc::new(InMemoryChatStore::default()))
    }
}

fn build_retrieval(config: &AppConfig) -> RetrievalAdapter {
    match &config.retrieval_url {
        Some(url) => {
            info!(url = %url, top_k = config.rag_top_k, "retrieval enabled");
            let retriever: Arc<dyn Retriever> = Arc::new(HttpRetriever::new(url.clone()));
            RetrievalAdapter::new(Some(retriever), config.rag_top_k)
        }
        None => {
            warn!("RETRIEVAL_URL not set; RAG-enabled conversations get no retrieved context");
            RetrievalAdapter::disabled()
        }
    }
}
