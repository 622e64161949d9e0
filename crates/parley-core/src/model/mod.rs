mod mock;
mod openai_compat;
mod sse;

use std::{collections::HashMap, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    error::TurnError,
    types::{MessageRole, Usage},
};

pub use mock::MockModelProvider;
pub use openai_compat::OpenAiCompatProvider;

pub const TOOL_RESULTS_PREFIX: &str = "Tool results:";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    /// Falls back to the provider's configured model when unset.
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub usage: Option<Usage>,
}

/// One increment of a streamed completion. The last chunk of every stream
/// is `{ delta: None, done: true }`, optionally carrying usage.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub delta: Option<String>,
    pub done: bool,
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: Some(text.into()),
            done: false,
            usage: None,
        }
    }

    pub fn done(usage: Option<Usage>) -> Self {
        Self {
            delta: None,
            done: true,
            usage,
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn default_model(&self) -> &str;

    async fn complete(&self, request: ModelRequest) -> anyhow::Result<ModelResponse>;

    /// Providers without native streaming emit the whole completion as a
    /// single delta.
    async fn stream(&self, request: ModelRequest) -> anyhow::Result<ChunkStream> {
        let response = self.complete(request).await?;
        let chunks = vec![
            Ok(StreamChunk::delta(response.content)),
            Ok(StreamChunk::done(response.usage)),
        ];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenRouter,
    OpenAi,
    Mock,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::OpenRouter,
        ProviderKind::OpenAi,
        ProviderKind::Mock,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Mock => "mock",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openrouter" => Some(ProviderKind::OpenRouter),
            "openai" => Some(ProviderKind::OpenAi),
            "mock" => Some(ProviderKind::Mock),
            _ => None,
        }
    }
}

/// A provider resolved for one turn.
#[derive(Clone)]
pub struct ResolvedProvider {
    pub kind: ProviderKind,
    pub provider: Arc<dyn ModelProvider>,
}

/// Maps provider keys to initialized clients. Built once at start-up.
pub struct ModelRouter {
    providers: HashMap<ProviderKind, Arc<dyn ModelProvider>>,
    default: ProviderKind,
}

impl ModelRouter {
    pub fn new(default: ProviderKind) -> Self {
        Self {
            providers: HashMap::new(),
            default,
        }
    }

    pub fn register(mut self, kind: ProviderKind, provider: Arc<dyn ModelProvider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn default_kind(&self) -> ProviderKind {
        self.default
    }

    pub fn resolve(&self, key: Option<&str>) -> Result<ResolvedProvider, TurnError> {
        let kind = match key.map(str::trim).filter(|key| !key.is_empty()) {
            Some(key) => ProviderKind::parse(key).ok_or_else(|| {
                TurnError::Configuration(format!("unknown model provider `{key}`"))
            })?,
            None => self.default,
        };

        let provider = self.providers.get(&kind).cloned().ok_or_else(|| {
            TurnError::Configuration(format!(
                "model provider `{}` is not initialized",
                kind.as_str()
            ))
        })?;

        Ok(ResolvedProvider { kind, provider })
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let mut providers: HashMap<ProviderKind, Arc<dyn ModelProvider>> = HashMap::new();

        if let Some(api_key) = config.openrouter_api_key.clone() {
            providers.insert(
                ProviderKind::OpenRouter,
                Arc::new(OpenAiCompatProvider::openrouter(
                    api_key,
                    config.openrouter_model.clone(),
                    config.openrouter_referer.clone(),
                    config.openrouter_title.clone(),
                )),
            );
        }
        if let Some(api_key) = config.openai_api_key.clone() {
            providers.insert(
                ProviderKind::OpenAi,
                Arc::new(OpenAiCompatProvider::openai(
                    api_key,
                    config.openai_model.clone(),
                    config.openai_base_url.clone(),
                )),
            );
        }
        providers.insert(ProviderKind::Mock, Arc::new(MockModelProvider::default()));

        let default = match config.model_provider.trim().to_ascii_lowercase().as_str() {
            "auto" => {
                if providers.contains_key(&ProviderKind::OpenRouter) {
                    ProviderKind::OpenRouter
                } else if providers.contains_key(&ProviderKind::OpenAi) {
                    ProviderKind::OpenAi
                } else {
                    warn!("no model API key configured; falling back to mock provider");
                    ProviderKind::Mock
                }
            }
            other => ProviderKind::parse(other)
                .ok_or_else(|| anyhow::anyhow!("unknown MODEL_PROVIDER value `{other}`"))?,
        };

        if !providers.contains_key(&default) {
            anyhow::bail!(
                "MODEL_PROVIDER is `{}` but its API key is not configured",
                default.as_str()
            );
        }

        info!(
            default_provider = default.as_str(),
            initialized = ?providers.keys().map(|kind| kind.as_str()).collect::<Vec<_>>(),
            "model router initialized"
        );

        Ok(Self { providers, default })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: String,
}

/// Shapes history for chat-completion APIs that know only system, user and
/// assistant roles. System messages are merged in order into one leading
/// message; tool messages become user messages under a results prefix.
pub fn normalize_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    let system = messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .map(|message| message.content.trim())
        .filter(|content| !content.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut wire = Vec::with_capacity(messages.len() + 1);
    if !system.is_empty() {
        wire.push(WireMessage {
            role: "system",
            content: system,
        });
    }

    for message in messages {
        match message.role {
            MessageRole::System => {}
            MessageRole::User => wire.push(WireMessage {
                role: "user",
                content: message.content.clone(),
            }),
            MessageRole::Assistant => wire.push(WireMessage {
                role: "assistant",
                content: message.content.clone(),
            }),
            MessageRole::Tool => wire.push(WireMessage {
                role: "user",
                content: format!("{TOOL_RESULTS_PREFIX}\n{}", message.content),
            }),
        }
    }

    wire
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::StreamExt;

    use crate::{error::TurnError, types::MessageRole};

    use super::{
        ChatMessage, MockModelProvider, ModelProvider, ModelRequest, ModelRouter, ProviderKind,
        normalize_messages,
    };

    #[test]
    fn resolve_fails_fast_for_unknown_and_uninitialized_providers() {
        let router = ModelRouter::new(ProviderKind::Mock)
            .register(ProviderKind::Mock, Arc::new(MockModelProvider::default()));

        let resolved = router.resolve(None).expect("default provider");
        assert_eq!(resolved.kind, ProviderKind::Mock);
        assert_eq!(
            router.resolve(Some(" MOCK ")).expect("case-insensitive").kind,
            ProviderKind::Mock
        );

        assert!(matches!(
            router.resolve(Some("anthropic")),
            Err(TurnError::Configuration(_))
        ));
        assert!(matches!(
            router.resolve(Some("openai")),
            Err(TurnError::Configuration(_))
        ));
    }

    #[test]
    fn normalize_merges_system_and_rewrites_tool_role() {
        let wire = normalize_messages(&[
            ChatMessage::new(MessageRole::System, "org policy"),
            ChatMessage::new(MessageRole::User, "hi"),
            ChatMessage::new(MessageRole::System, "rag context"),
            ChatMessage::new(MessageRole::Assistant, "hello"),
            ChatMessage::new(MessageRole::Tool, "[{\"ok\":true}]"),
        ]);

        let roles = wire.iter().map(|message| message.role).collect::<Vec<_>>();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(wire[0].content, "org policy\n\nrag context");
        assert!(wire[3].content.starts_with("Tool results:\n"));
    }

    #[tokio::test]
    async fn default_stream_ends_with_done_sentinel() {
        let provider = MockModelProvider::default();
        let chunks = provider
            .stream(ModelRequest {
                messages: vec![ChatMessage::new(MessageRole::User, "ping")],
                ..ModelRequest::default()
            })
            .await
            .expect("stream should open")
            .collect::<Vec<_>>()
            .await;

        let last = chunks
            .last()
            .expect("at least one chunk")
            .as_ref()
            .expect("chunk ok");
        assert!(last.done);
        assert!(last.delta.is_none());
        assert!(chunks.len() >= 2);
    }
}
