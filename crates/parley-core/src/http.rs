use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::{
    error::TurnError,
    orchestrator::TurnOrchestrator,
    tools::{ToolDefinition, ToolExecutor},
    types::{
        ToolCallEnvelope, ToolCallRequest, ToolCallResult, ToolContext, TurnReply,
        TurnStreamEvent,
    },
    webhooks::{DrainReport, WebhookDispatcher},
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub tools: Arc<dyn ToolExecutor>,
    pub webhooks: Arc<WebhookDispatcher>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub user_id: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ToolsQuery {
    pub org_id: Option<String>,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteToolRequest {
    #[serde(flatten)]
    pub call: ToolCallRequest,
    #[serde(default)]
    pub context: ToolContext,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteEnvelopeRequest {
    #[serde(flatten)]
    pub envelope: ToolCallEnvelope,
    #[serde(default)]
    pub context: ToolContext,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/conversations/{conversation_id}/turns", post(run_turn))
        .route(
            "/conversations/{conversation_id}/turns/stream",
            post(run_turn_stream),
        )
        .route("/tools", get(list_tools))
        .route("/tools/execute", post(execute_tool))
        .route("/tools/envelope", post(execute_envelope))
        .route("/internal/webhooks/drain", post(drain_webhooks))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn run_turn(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnReply>, ApiError> {
    let reply = state
        .orchestrator
        .run_turn(&conversation_id, &request.user_id, &request.content)
        .await?;
    Ok(Json(reply))
}

async fn run_turn_stream(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(request): Json<TurnRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut events =
        state
            .orchestrator
            .run_turn_stream(conversation_id, request.user_id, request.content);

    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            yield Ok(sse_event(&event));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(event: &TurnStreamEvent) -> Event {
    let name = match event {
        TurnStreamEvent::Token { .. } => "token",
        TurnStreamEvent::End { .. } => "end",
        TurnStreamEvent::Error { .. } => "error",
    };
    match serde_json::to_string(event) {
        Ok(data) => Event::default().event(name).data(data),
        Err(error) => {
            warn!(?error, "failed to encode stream event");
            Event::default()
                .event("error")
                .data(json!({ "type": "error", "error": "encoding failed" }).to_string())
        }
    }
}

async fn list_tools(
    State(state): State<AppState>,
    Query(query): Query<ToolsQuery>,
) -> Result<Json<Vec<ToolDefinition>>, ApiError> {
    let ctx = ToolContext {
        user_id: query.user_id,
        org_id: query.org_id.filter(|org_id| !org_id.is_empty()),
        conversation_id: None,
    };
    let tools = state.tools.list_tools(&ctx).await.map_err(ApiError::internal)?;
    Ok(Json(tools))
}

async fn execute_tool(
    State(state): State<AppState>,
    Json(request): Json<ExecuteToolRequest>,
) -> Json<ToolCallResult> {
    Json(
        state
            .tools
            .execute_tool_call(&request.call, &request.context)
            .await,
    )
}

async fn execute_envelope(
    State(state): State<AppState>,
    Json(request): Json<ExecuteEnvelopeRequest>,
) -> Json<Vec<ToolCallResult>> {
    Json(
        state
            .tools
            .execute_tool_envelope(&request.envelope, &request.context)
            .await,
    )
}

async fn drain_webhooks(State(state): State<AppState>) -> Result<Json<DrainReport>, ApiError> {
    let report = state
        .webhooks
        .drain_once()
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(report))
}

/// JSON error body with a status derived from the failure class.
pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    fn internal(error: anyhow::Error) -> Self {
        error!(?error, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({ "error": format!("internal error: {error:#}"), "kind": "internal" }),
        }
    }
}

impl From<TurnError> for ApiError {
    fn from(error: TurnError) -> Self {
        let status = match &error {
            TurnError::Validation(_) => StatusCode::BAD_REQUEST,
            TurnError::NotFound(_) => StatusCode::NOT_FOUND,
            TurnError::Blocked { .. } => StatusCode::FORBIDDEN,
            TurnError::Model(_) => StatusCode::BAD_GATEWAY,
            TurnError::Configuration(_) | TurnError::Moderation(_) | TurnError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            error!(kind = error.kind(), error = %error, "turn failed");
        } else {
            warn!(kind = error.kind(), error = %error, "turn rejected");
        }

        let mut body = json!({ "error": error.to_string(), "kind": error.kind() });
        if let TurnError::Blocked { category, action } = &error {
            body["category"] = json!(category);
            body["action"] = json!(action);
        }
        Self { status, body }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc, time::Duration};

    use chrono::Utc;
    use serde_json::{Value, json};

    use crate::{
        metering::{PriceRegistry, UsageMeter},
        model::{MockModelProvider, ModelRouter, ProviderKind},
        orchestrator::{OrchestratorSettings, TurnDependencies, TurnOrchestrator},
        retrieval::RetrievalAdapter,
        safety::{
            HeuristicModerationProvider, ModerationAction, ModerationCategory, ModerationPolicy,
            SafetyGate,
        },
        store::{ChatStore, InMemoryChatStore},
        tools::{HttpToolClient, ToolEngine, ToolExecutor, ToolRegistry},
        types::{Conversation, ConversationSettings},
        webhooks::WebhookDispatcher,
    };

    use super::{AppState, router};

    async fn spawn_app() -> (String, Arc<InMemoryChatStore>) {
        let store = Arc::new(InMemoryChatStore::default());
        let now = Utc::now();
        store
            .put_conversation(Conversation {
                id: "conv-1".to_owned(),
                org_id: Some("org-1".to_owned()),
                owner_user_id: "user-1".to_owned(),
                provider: None,
                model: None,
                system_prompt: None,
                temperature: None,
                top_p: None,
                max_tokens: None,
                profile_id: None,
                preset_id: None,
                settings: ConversationSettings::default(),
                last_activity_at: now,
                created_at: now,
            })
            .await;
        store
            .put_moderation_overrides(
                "org-1",
                HashMap::from([(ModerationCategory::Hate, ModerationAction::Block)]),
            )
            .await;

        let shared: Arc<dyn ChatStore> = store.clone();
        let tools: Arc<dyn ToolExecutor> = Arc::new(ToolEngine::new(
            Arc::new(ToolRegistry::with_builtins()),
            shared.clone(),
            HttpToolClient::default(),
            Duration::from_secs(2),
        ));
        let webhooks = Arc::new(
            WebhookDispatcher::new(shared.clone(), 10, Duration::from_secs(2))
                .expect("dispatcher"),
        );
        let orchestrator = Arc::new(TurnOrchestrator::new(
            TurnDependencies {
                store: shared.clone(),
                models: Arc::new(
                    ModelRouter::new(ProviderKind::Mock)
                        .register(ProviderKind::Mock, Arc::new(MockModelProvider)),
                ),
                tools: tools.clone(),
                safety: Arc::new(SafetyGate::new(
                    Arc::new(HeuristicModerationProvider),
                    shared.clone(),
                    ModerationPolicy::platform_default(),
                )),
                retrieval: RetrievalAdapter::disabled(),
                webhooks: webhooks.clone(),
                meter: Arc::new(UsageMeter::new(shared, PriceRegistry::default())),
            },
            OrchestratorSettings::default(),
        ));

        let app = router(AppState {
            orchestrator,
            tools,
            webhooks,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server");
        });
        (format!("http://{addr}"), store)
    }

    #[tokio::test]
    async fn turn_endpoint_returns_reply() {
        let (base, _store) = spawn_app().await;
        let response = reqwest::Client::new()
            .post(format!("{base}/conversations/conv-1/turns"))
            .json(&json!({ "userId": "user-1", "content": "hello" }))
            .send()
            .await
            .expect("request");

        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.expect("json body");
        assert_eq!(body["assistantContent"], "Parley mock reply: hello");
        assert_eq!(body["conversationId"], "conv-1");
    }

    #[tokio::test]
    async fn turn_errors_map_to_status_codes() {
        let (base, store) = spawn_app().await;
        let client = reqwest::Client::new();

        let missing = client
            .post(format!("{base}/conversations/nope/turns"))
            .json(&json!({ "userId": "user-1", "content": "hello" }))
            .send()
            .await
            .expect("request");
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let empty = client
            .post(format!("{base}/conversations/conv-1/turns"))
            .json(&json!({ "userId": "user-1", "content": "" }))
            .send()
            .await
            .expect("request");
        assert_eq!(empty.status(), reqwest::StatusCode::BAD_REQUEST);

        let blocked = client
            .post(format!("{base}/conversations/conv-1/turns"))
            .json(&json!({ "userId": "user-1", "content": "they are subhuman" }))
            .send()
            .await
            .expect("request");
        assert_eq!(blocked.status(), reqwest::StatusCode::FORBIDDEN);
        let body: Value = blocked.json().await.expect("json body");
        assert_eq!(body["category"], "hate");
        assert_eq!(body["action"], "block");

        assert!(
            store
                .list_messages("conv-1")
                .await
                .expect("messages")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn stream_endpoint_emits_token_and_end_events() {
        let (base, _store) = spawn_app().await;
        let body = reqwest::Client::new()
            .post(format!("{base}/conversations/conv-1/turns/stream"))
            .json(&json!({ "userId": "user-1", "content": "hello" }))
            .send()
            .await
            .expect("request")
            .text()
            .await
            .expect("body");

        let token_at = body.find("event: token").expect("token event");
        let end_at = body.find("event: end").expect("end event");
        assert!(token_at < end_at);
        assert!(body.contains("Parley mock reply: hello"));
    }

    #[tokio::test]
    async fn tool_endpoints_list_and_execute() {
        let (base, _store) = spawn_app().await;
        let client = reqwest::Client::new();

        let tools: Value = client
            .get(format!("{base}/tools?org_id=org-1"))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json body");
        assert_eq!(tools[0]["name"], "time.now");

        let result: Value = client
            .post(format!("{base}/tools/execute"))
            .json(&json!({ "tool": "time.now", "args": {}, "context": { "userId": "user-1" } }))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json body");
        assert_eq!(result["ok"], true);

        let results: Value = client
            .post(format!("{base}/tools/envelope"))
            .json(&json!({ "toolCalls": [{ "tool": "nope" }, { "tool": "time.now" }] }))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json body");
        assert_eq!(results[0]["error"], "Unknown tool: nope");
        assert_eq!(results[1]["ok"], true);
    }

    #[tokio::test]
    async fn drain_endpoint_reports_counts() {
        let (base, _store) = spawn_app().await;
        let report: Value = reqwest::Client::new()
            .post(format!("{base}/internal/webhooks/drain"))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json body");
        assert_eq!(report["claimed"], 0);
    }
}
