use std::{env, net::SocketAddr};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_bind: SocketAddr,
    pub database_url: Option<String>,
    pub model_provider: String,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub openrouter_referer: Option<String>,
    pub openrouter_title: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub retrieval_url: Option<String>,
    pub history_limit: usize,
    pub rag_top_k: usize,
    pub tool_timeout_ms: u64,
    pub default_temperature: f32,
    pub default_top_p: f32,
    pub webhook_worker_enabled: bool,
    pub webhook_drain_interval_ms: u64,
    pub webhook_batch_size: usize,
    pub webhook_timeout_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = env::var("PORT").unwrap_or_else(|_| "8080".to_owned());
        let http_bind = env::var("HTTP_BIND").unwrap_or_else(|_| format!("0.0.0.0:{port}"));
        let http_bind = http_bind.parse()?;

        Ok(Self {
            http_bind,
            database_url: env::var("DATABASE_URL").ok(),
            model_provider: env::var("MODEL_PROVIDER").unwrap_or_else(|_| "auto".to_owned()),
            openrouter_api_key: env::var("OPENROUTER_API_KEY").ok(),
            openrouter_model: env::var("OPENROUTER_MODEL")
                .unwrap_or_else(|_| "anthropic/claude-3.5-sonnet".to_owned()),
            openrouter_referer: env::var("OPENROUTER_REFERER").ok(),
            openrouter_title: env::var("OPENROUTER_TITLE").ok(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_owned()),
            openai_base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_owned()),
            retrieval_url: env::var("RETRIEVAL_URL").ok(),
            history_limit: env_u64("HISTORY_LIMIT", 50) as usize,
            rag_top_k: env_u64("RAG_TOP_K", 4) as usize,
            tool_timeout_ms: env_u64("TOOL_TIMEOUT_MS", 10_000),
            default_temperature: env_f32("DEFAULT_TEMPERATURE", 0.7),
            default_top_p: env_f32("DEFAULT_TOP_P", 1.0),
            webhook_worker_enabled: env_bool("WEBHOOK_WORKER_ENABLED", true),
            webhook_drain_interval_ms: env_u64("WEBHOOK_DRAIN_INTERVAL_MS", 5_000),
            webhook_batch_size: env_u64("WEBHOOK_BATCH_SIZE", 25) as usize,
            webhook_timeout_ms: env_u64("WEBHOOK_TIMEOUT_MS", 10_000),
        })
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|raw| {
            matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<f32>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}
