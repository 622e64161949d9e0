use std::{sync::Arc, time::Instant};

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    error::TurnError,
    metering::UsageMeter,
    model::{ChatMessage, ModelRequest, ModelResponse, ModelRouter, ResolvedProvider},
    retrieval::RetrievalAdapter,
    safety::{ModerationAction, ModerationDecision, ModerationInput, ModerationSource, SafetyGate},
    store::ChatStore,
    tools::{ToolExecutor, detect_tool_envelope, tools_system_message},
    types::{
        Conversation, GenerationProfile, MessageRecord, MessageRole, ModerationNotice,
        NewMessage, ToolCallResult, ToolContext, TurnReply, TurnStreamEvent, TurnTimings, Usage,
    },
    webhooks::{
        EVENT_MESSAGE_SENT, EVENT_MODERATION_FLAGGED, EVENT_TOOL_ERROR, EVENT_TURN_COMPLETED,
        WebhookDispatcher,
    },
};

const SLOW_TURN_THRESHOLD_MS: u64 = 30_000;
const MAX_USER_MESSAGE_CHARS: usize = 32_000;
const STREAM_CHANNEL_CAPACITY: usize = 64;
const METERED_FEATURE: &str = "chat";
const BLOCKED_REPLY_NOTICE: &str =
    "I can't share that response because it conflicts with this workspace's content policy.";
const FINALIZE_INSTRUCTION: &str = "These are the results of the tools you requested. \
     Use them to answer the user's last message in plain text. \
     If a tool failed, tell the user briefly what went wrong.";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub history_limit: usize,
    pub default_temperature: f32,
    pub default_top_p: f32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            history_limit: 50,
            default_temperature: 0.7,
            default_top_p: 1.0,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            history_limit: config.history_limit.max(1),
            default_temperature: config.default_temperature,
            default_top_p: config.default_top_p,
        }
    }
}

/// Collaborators a turn needs, built once at start-up.
pub struct TurnDependencies {
    pub store: Arc<dyn ChatStore>,
    pub models: Arc<ModelRouter>,
    pub tools: Arc<dyn ToolExecutor>,
    pub safety: Arc<SafetyGate>,
    pub retrieval: RetrievalAdapter,
    pub webhooks: Arc<WebhookDispatcher>,
    pub meter: Arc<UsageMeter>,
}

pub struct TurnOrchestrator {
    store: Arc<dyn ChatStore>,
    models: Arc<ModelRouter>,
    tools: Arc<dyn ToolExecutor>,
    safety: Arc<SafetyGate>,
    retrieval: RetrievalAdapter,
    webhooks: Arc<WebhookDispatcher>,
    meter: Arc<UsageMeter>,
    settings: OrchestratorSettings,
}

struct GenerationParams {
    provider: ResolvedProvider,
    model: String,
    temperature: f32,
    top_p: f32,
    max_tokens: Option<u32>,
}

struct PreparedTurn {
    started_at: Instant,
    conversation: Conversation,
    user_id: String,
    params: GenerationParams,
    tool_ctx: ToolContext,
    user_message: MessageRecord,
    context: Vec<ChatMessage>,
    notices: Vec<ModerationNotice>,
    timings: TurnTimings,
}

enum FinalPhase {
    /// The planning response was already the answer.
    Answered(ModelResponse),
    Generate {
        messages: Vec<ChatMessage>,
        prior_usage: Option<Usage>,
    },
}

#[derive(Default)]
struct ToolRound {
    tool_message_id: Option<String>,
    results: Vec<ToolCallResult>,
}

struct PlannedTurn {
    phase: FinalPhase,
    tools: ToolRound,
}

impl TurnOrchestrator {
    pub fn new(deps: TurnDependencies, settings: OrchestratorSettings) -> Self {
        Self {
            store: deps.store,
            models: deps.models,
            tools: deps.tools,
            safety: deps.safety,
            retrieval: deps.retrieval,
            webhooks: deps.webhooks,
            meter: deps.meter,
            settings,
        }
    }

    pub async fn run_turn(
        &self,
        conversation_id: &str,
        user_id: &str,
        content: &str,
    ) -> Result<TurnReply, TurnError> {
        let mut prepared = self.prepare(conversation_id, user_id, content).await?;
        let planned = self.plan(&mut prepared).await?;

        let final_model_started_at = Instant::now();
        let (reply_text, usage) = match planned.phase {
            FinalPhase::Answered(response) => (response.content, response.usage),
            FinalPhase::Generate {
                messages,
                prior_usage,
            } => {
                let request = self.model_request(&prepared.params, messages);
                let response = prepared
                    .params
                    .provider
                    .provider
                    .complete(request)
                    .await
                    .map_err(TurnError::Model)?;
                (response.content, combine_usage(prior_usage, response.usage))
            }
        };
        prepared.timings.final_model_ms = elapsed_ms(final_model_started_at);

        self.finish(prepared, planned.tools, reply_text, usage).await
    }

    /// Streams the final phase as `token` events, ending with exactly one
    /// `end` or `error`. Dropping the receiver cancels the upstream model
    /// stream and nothing further is persisted.
    pub fn run_turn_stream(
        self: &Arc<Self>,
        conversation_id: String,
        user_id: String,
        content: String,
    ) -> mpsc::Receiver<TurnStreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let orchestrator = Arc::clone(self);

        tokio::spawn(async move {
            if let Err(error) = orchestrator
                .stream_turn(&conversation_id, &user_id, &content, &tx)
                .await
            {
                warn!(
                    conversation_id = %conversation_id,
                    kind = error.kind(),
                    error = %error,
                    "streaming turn failed"
                );
                let _ = tx
                    .send(TurnStreamEvent::Error {
                        error: error.to_string(),
                    })
                    .await;
            }
        });

        rx
    }

    async fn stream_turn(
        &self,
        conversation_id: &str,
        user_id: &str,
        content: &str,
        tx: &mpsc::Sender<TurnStreamEvent>,
    ) -> Result<(), TurnError> {
        let mut prepared = self.prepare(conversation_id, user_id, content).await?;
        let planned = self.plan(&mut prepared).await?;
        if tx.is_closed() {
            info!(conversation_id = %conversation_id, "client disconnected before generation");
            return Ok(());
        }

        let final_model_started_at = Instant::now();
        let (reply_text, usage) = match planned.phase {
            FinalPhase::Answered(response) => {
                let token = TurnStreamEvent::Token {
                    token: response.content.clone(),
                };
                if tx.send(token).await.is_err() {
                    info!(conversation_id = %conversation_id, "client disconnected during stream");
                    return Ok(());
                }
                (response.content, response.usage)
            }
            FinalPhase::Generate {
                messages,
                prior_usage,
            } => {
                let request = self.model_request(&prepared.params, messages);
                let mut stream = prepared
                    .params
                    .provider
                    .provider
                    .stream(request)
                    .await
                    .map_err(TurnError::Model)?;

                let mut text = String::new();
                let mut stream_usage = None;
                loop {
                    let next = tokio::select! {
                        _ = tx.closed() => {
                            info!(
                                conversation_id = %conversation_id,
                                "client disconnected; cancelling model stream"
                            );
                            return Ok(());
                        }
                        next = stream.next() => next,
                    };

                    match next {
                        None => break,
                        Some(Err(error)) => return Err(TurnError::Model(error)),
                        Some(Ok(chunk)) => {
                            if let Some(delta) = chunk.delta {
                                text.push_str(&delta);
                                if tx.send(TurnStreamEvent::Token { token: delta }).await.is_err() {
                                    info!(
                                        conversation_id = %conversation_id,
                                        "client disconnected; cancelling model stream"
                                    );
                                    return Ok(());
                                }
                            }
                            if chunk.done {
                                stream_usage = chunk.usage;
                                break;
                            }
                        }
                    }
                }
                (text, combine_usage(prior_usage, stream_usage))
            }
        };
        prepared.timings.final_model_ms = elapsed_ms(final_model_started_at);

        let reply = self.finish(prepared, planned.tools, reply_text, usage).await?;
        let _ = tx
            .send(TurnStreamEvent::End {
                message_id: reply.assistant_message_id,
                message: reply.assistant_content,
                usage: reply.usage,
            })
            .await;
        Ok(())
    }

    /// Loads the conversation, gates the user message, persists it and
    /// assembles the model context.
    async fn prepare(
        &self,
        conversation_id: &str,
        user_id: &str,
        content: &str,
    ) -> Result<PreparedTurn, TurnError> {
        let started_at = Instant::now();
        let content = content.trim();
        if user_id.trim().is_empty() {
            return Err(TurnError::Validation("userId is required".to_owned()));
        }
        if content.is_empty() {
            return Err(TurnError::Validation(
                "message content must not be empty".to_owned(),
            ));
        }
        if content.chars().count() > MAX_USER_MESSAGE_CHARS {
            return Err(TurnError::Validation(format!(
                "message content exceeds {MAX_USER_MESSAGE_CHARS} characters"
            )));
        }

        let mut timings = TurnTimings::default();

        let load_conversation_started_at = Instant::now();
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await
            .map_err(TurnError::Store)?
            .ok_or_else(|| TurnError::NotFound(format!("conversation {conversation_id}")))?;
        let profile = self.load_profile(&conversation).await;
        let params = self.resolve_params(&conversation, profile.as_ref())?;
        let preset_id = profile
            .and_then(|profile| profile.preset_id)
            .or_else(|| conversation.preset_id.clone());
        timings.load_context_ms = elapsed_ms(load_conversation_started_at);

        let moderation_started_at = Instant::now();
        let mut notices = Vec::new();
        let decision = self
            .moderate(content, ModerationSource::User, &conversation, user_id)
            .await?;
        timings.moderation_ms = elapsed_ms(moderation_started_at);
        if let Some(category) = decision.top_category {
            if decision.is_blocked() {
                info!(
                    conversation_id = %conversation.id,
                    org_id = conversation.org_id.as_deref().unwrap_or("-"),
                    user_id = %user_id,
                    category = category.as_str(),
                    "turn blocked by moderation"
                );
                return Err(TurnError::Blocked {
                    category,
                    action: decision.action,
                });
            }
            if decision.action == ModerationAction::Warn {
                notices.push(ModerationNotice {
                    source: ModerationSource::User,
                    action: decision.action,
                    category,
                });
            }
        }

        let persist_started_at = Instant::now();
        let user_message = self
            .store
            .insert_message(NewMessage {
                conversation_id: conversation.id.clone(),
                user_id: Some(user_id.to_owned()),
                role: MessageRole::User,
                content: content.to_owned(),
                metadata: json!({}),
            })
            .await
            .map_err(TurnError::Store)?;
        timings.persist_ms = elapsed_ms(persist_started_at);

        self.emit(
            conversation.org_id.as_deref(),
            EVENT_MESSAGE_SENT,
            Some(&conversation.id),
            Some(&user_message.id),
            json!({ "userId": user_id, "role": "user" }),
        )
        .await;

        let load_context_started_at = Instant::now();
        let history = self
            .store
            .list_recent_messages(&conversation.id, self.settings.history_limit)
            .await
            .map_err(TurnError::Store)?;
        let mut context = self
            .system_layers(&conversation, preset_id.as_deref(), content)
            .await;
        context.extend(
            history
                .into_iter()
                .map(|message| ChatMessage::new(message.role, message.content)),
        );
        timings.load_context_ms += elapsed_ms(load_context_started_at);

        let tool_ctx = ToolContext {
            user_id: user_id.to_owned(),
            org_id: conversation.org_id.clone(),
            conversation_id: Some(conversation.id.clone()),
        };

        Ok(PreparedTurn {
            started_at,
            conversation,
            user_id: user_id.to_owned(),
            params,
            tool_ctx,
            user_message,
            context,
            notices,
            timings,
        })
    }

    /// Single planning round, and at most one tool execution round.
    async fn plan(&self, prepared: &mut PreparedTurn) -> Result<PlannedTurn, TurnError> {
        let direct = |prepared: &PreparedTurn| PlannedTurn {
            phase: FinalPhase::Generate {
                messages: prepared.context.clone(),
                prior_usage: None,
            },
            tools: ToolRound::default(),
        };

        if !prepared.conversation.settings.structured_tools {
            return Ok(direct(prepared));
        }

        let definitions = match self.tools.list_tools(&prepared.tool_ctx).await {
            Ok(definitions) => definitions,
            Err(error) => {
                warn!(
                    conversation_id = %prepared.conversation.id,
                    ?error,
                    "failed to list tools; answering without tools"
                );
                Vec::new()
            }
        };
        if definitions.is_empty() {
            debug!(conversation_id = %prepared.conversation.id, "no tools available; skipping planning");
            return Ok(direct(prepared));
        }

        let planning_started_at = Instant::now();
        let mut planning_messages = prepared.context.clone();
        planning_messages.push(ChatMessage::new(
            MessageRole::System,
            tools_system_message(&definitions),
        ));
        let plan = prepared
            .params
            .provider
            .provider
            .complete(self.model_request(&prepared.params, planning_messages))
            .await
            .map_err(TurnError::Model)?;
        prepared.timings.planning_ms = elapsed_ms(planning_started_at);

        let Some(envelope) = detect_tool_envelope(&plan.content) else {
            debug!(
                conversation_id = %prepared.conversation.id,
                response = %truncate_for_log(&plan.content, 160),
                "planner answered directly"
            );
            return Ok(PlannedTurn {
                phase: FinalPhase::Answered(plan),
                tools: ToolRound::default(),
            });
        };

        let tool_execution_started_at = Instant::now();
        let results = self
            .tools
            .execute_tool_envelope(&envelope, &prepared.tool_ctx)
            .await;
        prepared.timings.tool_execution_ms = elapsed_ms(tool_execution_started_at);

        let results_json = json!(results).to_string();
        let persist_started_at = Instant::now();
        let tool_message = self
            .store
            .insert_message(NewMessage {
                conversation_id: prepared.conversation.id.clone(),
                user_id: None,
                role: MessageRole::Tool,
                content: results_json.clone(),
                metadata: json!({
                    "toolCalls": envelope.tool_calls,
                    "results": results,
                }),
            })
            .await
            .map_err(TurnError::Store)?;
        prepared.timings.persist_ms += elapsed_ms(persist_started_at);

        for failed in results.iter().filter(|result| !result.ok) {
            self.emit(
                prepared.conversation.org_id.as_deref(),
                EVENT_TOOL_ERROR,
                Some(&prepared.conversation.id),
                Some(&tool_message.id),
                json!({
                    "tool": failed.tool,
                    "error": failed.error,
                    "userId": prepared.user_id,
                }),
            )
            .await;
        }

        info!(
            conversation_id = %prepared.conversation.id,
            tool_calls = results.len(),
            failed = results.iter().filter(|result| !result.ok).count(),
            tool_execution_ms = prepared.timings.tool_execution_ms,
            "tool round executed"
        );

        let mut messages = prepared.context.clone();
        messages.push(ChatMessage::new(
            MessageRole::Tool,
            format!("{results_json}\n\n{FINALIZE_INSTRUCTION}"),
        ));

        Ok(PlannedTurn {
            phase: FinalPhase::Generate {
                messages,
                prior_usage: plan.usage,
            },
            tools: ToolRound {
                tool_message_id: Some(tool_message.id),
                results,
            },
        })
    }

    async fn finish(
        &self,
        prepared: PreparedTurn,
        tools: ToolRound,
        reply_text: String,
        usage: Option<Usage>,
    ) -> Result<TurnReply, TurnError> {
        let PreparedTurn {
            started_at,
            conversation,
            user_id,
            params,
            user_message,
            mut notices,
            mut timings,
            ..
        } = prepared;

        let moderation_started_at = Instant::now();
        let decision = self
            .moderate(&reply_text, ModerationSource::Assistant, &conversation, &user_id)
            .await?;
        timings.moderation_ms += elapsed_ms(moderation_started_at);
        let reply_text = match decision.top_category {
            Some(category) if decision.is_blocked() => {
                warn!(
                    conversation_id = %conversation.id,
                    category = category.as_str(),
                    "assistant reply blocked by moderation"
                );
                notices.push(ModerationNotice {
                    source: ModerationSource::Assistant,
                    action: decision.action,
                    category,
                });
                BLOCKED_REPLY_NOTICE.to_owned()
            }
            Some(category) if decision.action == ModerationAction::Warn => {
                notices.push(ModerationNotice {
                    source: ModerationSource::Assistant,
                    action: decision.action,
                    category,
                });
                reply_text
            }
            _ => reply_text,
        };

        let persist_started_at = Instant::now();
        let mut metadata = json!({
            "provider": params.provider.kind.as_str(),
            "model": params.model,
            "usage": usage,
        });
        if let Some(tool_message_id) = &tools.tool_message_id {
            metadata["toolMessageId"] = json!(tool_message_id);
        }
        if !notices.is_empty() {
            metadata["moderation"] = json!(notices);
        }
        let assistant_message = self
            .store
            .insert_message(NewMessage {
                conversation_id: conversation.id.clone(),
                user_id: None,
                role: MessageRole::Assistant,
                content: reply_text.clone(),
                metadata,
            })
            .await
            .map_err(TurnError::Store)?;

        if let Err(error) = self
            .store
            .touch_conversation(&conversation.id, Utc::now())
            .await
        {
            warn!(conversation_id = %conversation.id, ?error, "failed to update conversation activity");
        }
        timings.persist_ms += elapsed_ms(persist_started_at);

        if let Err(error) = self
            .meter
            .record_turn(
                conversation.org_id.as_deref(),
                &user_id,
                params.provider.kind.as_str(),
                &params.model,
                METERED_FEATURE,
                usage,
            )
            .await
        {
            warn!(conversation_id = %conversation.id, ?error, "failed to record usage");
        }

        self.emit(
            conversation.org_id.as_deref(),
            EVENT_TURN_COMPLETED,
            Some(&conversation.id),
            Some(&assistant_message.id),
            json!({
                "userId": user_id,
                "userMessageId": user_message.id,
                "assistantMessageId": assistant_message.id,
                "toolMessageId": tools.tool_message_id,
                "provider": params.provider.kind.as_str(),
                "model": params.model,
                "usage": usage,
                "toolCalls": tools.results.len(),
                "toolErrors": tools.results.iter().filter(|result| !result.ok).count(),
            }),
        )
        .await;

        timings.total_ms = elapsed_ms(started_at);
        let usage_total = usage.map(|usage| usage.total_tokens()).unwrap_or(0);
        if timings.total_ms >= SLOW_TURN_THRESHOLD_MS {
            warn!(
                conversation_id = %conversation.id,
                org_id = conversation.org_id.as_deref().unwrap_or("-"),
                user_id = %user_id,
                model = %params.model,
                total_ms = timings.total_ms,
                planning_ms = timings.planning_ms,
                tool_execution_ms = timings.tool_execution_ms,
                final_model_ms = timings.final_model_ms,
                persist_ms = timings.persist_ms,
                "slow turn detected"
            );
        } else {
            info!(
                conversation_id = %conversation.id,
                org_id = conversation.org_id.as_deref().unwrap_or("-"),
                user_id = %user_id,
                model = %params.model,
                total_tokens = usage_total,
                total_ms = timings.total_ms,
                planning_ms = timings.planning_ms,
                tool_execution_ms = timings.tool_execution_ms,
                final_model_ms = timings.final_model_ms,
                persist_ms = timings.persist_ms,
                "turn completed"
            );
        }

        Ok(TurnReply {
            conversation_id: conversation.id,
            user_message_id: user_message.id,
            assistant_message_id: assistant_message.id,
            assistant_content: reply_text,
            usage,
            tool_message_id: tools.tool_message_id,
            tool_results: tools.results,
            moderation: notices,
            timings,
        })
    }

    async fn load_profile(&self, conversation: &Conversation) -> Option<GenerationProfile> {
        let profile_id = conversation.profile_id.as_deref()?;
        match self.store.get_profile(profile_id).await {
            Ok(Some(profile)) => Some(profile),
            Ok(None) => {
                warn!(
                    conversation_id = %conversation.id,
                    profile_id = %profile_id,
                    "linked generation profile not found; using conversation settings"
                );
                None
            }
            Err(error) => {
                warn!(
                    conversation_id = %conversation.id,
                    profile_id = %profile_id,
                    ?error,
                    "failed to load generation profile; using conversation settings"
                );
                None
            }
        }
    }

    /// Profile fields win over conversation fields, which win over defaults.
    fn resolve_params(
        &self,
        conversation: &Conversation,
        profile: Option<&GenerationProfile>,
    ) -> Result<GenerationParams, TurnError> {
        let provider_key = profile
            .and_then(|profile| profile.provider.as_deref())
            .or(conversation.provider.as_deref());
        let provider = self.models.resolve(provider_key)?;

        let model = profile
            .and_then(|profile| profile.model.clone())
            .or_else(|| conversation.model.clone())
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| provider.provider.default_model().to_owned());

        Ok(GenerationParams {
            model,
            temperature: profile
                .and_then(|profile| profile.temperature)
                .or(conversation.temperature)
                .unwrap_or(self.settings.default_temperature),
            top_p: profile
                .and_then(|profile| profile.top_p)
                .or(conversation.top_p)
                .unwrap_or(self.settings.default_top_p),
            max_tokens: profile
                .and_then(|profile| profile.max_tokens)
                .or(conversation.max_tokens),
            provider,
        })
    }

    /// Org policy, preset prompt, conversation prompt, then retrieved
    /// context. Each layer is optional and a failed layer is skipped.
    async fn system_layers(
        &self,
        conversation: &Conversation,
        preset_id: Option<&str>,
        query: &str,
    ) -> Vec<ChatMessage> {
        let mut layers = Vec::new();

        if let Some(org_id) = conversation.org_id.as_deref() {
            match self.store.get_org_policy_prompt(org_id).await {
                Ok(Some(prompt)) if !prompt.trim().is_empty() => {
                    layers.push(ChatMessage::new(MessageRole::System, prompt));
                }
                Ok(_) => {}
                Err(error) => warn!(
                    org_id = %org_id,
                    ?error,
                    "failed to load org AI policy; skipping layer"
                ),
            }
        }

        if let Some(preset_id) = preset_id {
            match self.store.get_preset_prompt(preset_id).await {
                Ok(Some(prompt)) if !prompt.trim().is_empty() => {
                    layers.push(ChatMessage::new(MessageRole::System, prompt));
                }
                Ok(_) => {}
                Err(error) => warn!(
                    preset_id = %preset_id,
                    ?error,
                    "failed to load preset prompt; skipping layer"
                ),
            }
        }

        if let Some(prompt) = conversation
            .system_prompt
            .as_deref()
            .filter(|prompt| !prompt.trim().is_empty())
        {
            layers.push(ChatMessage::new(MessageRole::System, prompt));
        }

        if conversation.settings.rag_enabled {
            if let Some(block) = self
                .retrieval
                .context_block(query, conversation.settings.rag_namespace.as_deref())
                .await
            {
                layers.push(ChatMessage::new(MessageRole::System, block));
            }
        }

        layers
    }

    async fn moderate(
        &self,
        content: &str,
        source: ModerationSource,
        conversation: &Conversation,
        user_id: &str,
    ) -> Result<ModerationDecision, TurnError> {
        let decision = self
            .safety
            .run_moderation(ModerationInput {
                content,
                source,
                org_id: conversation.org_id.as_deref(),
                conversation_id: Some(&conversation.id),
                user_id: Some(user_id),
            })
            .await
            .map_err(TurnError::Moderation)?;

        if let (Some(incident_id), Some(category)) =
            (decision.incident_id.as_deref(), decision.top_category)
        {
            self.emit(
                conversation.org_id.as_deref(),
                EVENT_MODERATION_FLAGGED,
                Some(&conversation.id),
                None,
                json!({
                    "incidentId": incident_id,
                    "source": source.as_str(),
                    "category": category.as_str(),
                    "action": decision.action.as_str(),
                    "userId": user_id,
                }),
            )
            .await;
        }

        Ok(decision)
    }

    /// Webhook fan-out never fails a turn. Personal conversations emit nothing.
    async fn emit(
        &self,
        org_id: Option<&str>,
        event_type: &str,
        conversation_id: Option<&str>,
        message_id: Option<&str>,
        metadata: Value,
    ) {
        let Some(org_id) = org_id else {
            return;
        };
        if let Err(error) = self
            .webhooks
            .emit_event(event_type, org_id, conversation_id, message_id, metadata)
            .await
        {
            warn!(org_id = %org_id, event_type = %event_type, ?error, "failed to record webhook event");
        }
    }

    fn model_request(&self, params: &GenerationParams, messages: Vec<ChatMessage>) -> ModelRequest {
        ModelRequest {
            model: Some(params.model.clone()),
            messages,
            temperature: Some(params.temperature),
            top_p: Some(params.top_p),
            max_tokens: params.max_tokens,
        }
    }
}

/// Missing usage on one call counts as zero when the other call reported it.
fn combine_usage(first: Option<Usage>, second: Option<Usage>) -> Option<Usage> {
    match (first, second) {
        (None, None) => None,
        (first, second) => Some(first.unwrap_or_default().add(second.unwrap_or_default())),
    }
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let mut result = input.replace('\n', "\\n");
    if let Some((index, _)) = result.char_indices().nth(max_chars) {
        result.truncate(index);
        result.push_str("...");
    }
    result
}

fn elapsed_ms(started_at: Instant) -> u64 {
    started_at
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
