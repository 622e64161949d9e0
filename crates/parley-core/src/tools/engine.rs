use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{
    store::ChatStore,
    types::{ExternalToolRecord, ToolCallRequest, ToolCallResult, ToolContext},
};

use super::{
    BuiltinTool, HttpToolClient, ToolDefinition, ToolExecutor, ToolRegistry, validate_args,
};

enum ResolvedTool {
    Builtin(Arc<dyn BuiltinTool>),
    External(ExternalToolRecord),
}

impl ResolvedTool {
    fn parameters(&self) -> Value {
        match self {
            ResolvedTool::Builtin(tool) => tool.definition().parameters,
            ResolvedTool::External(record) => record.parameters.clone(),
        }
    }
}

/// Resolves, validates, time-bounds and records every tool call.
pub struct ToolEngine {
    registry: Arc<ToolRegistry>,
    store: Arc<dyn ChatStore>,
    http: HttpToolClient,
    timeout: Duration,
}

impl ToolEngine {
    pub fn new(
        registry: Arc<ToolRegistry>,
        store: Arc<dyn ChatStore>,
        http: HttpToolClient,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            http,
            timeout,
        }
    }

    async fn resolve(&self, name: &str, ctx: &ToolContext) -> Result<ResolvedTool, String> {
        if let Some(tool) = self.registry.get(name) {
            return Ok(ResolvedTool::Builtin(tool));
        }

        let Some(org_id) = ctx.org_id.as_deref() else {
            return Err(format!("Unknown tool: {name}"));
        };

        let external = self.store.list_external_tools(org_id).await.map_err(|error| {
            warn!(org_id = %org_id, tool = %name, ?error, "failed to load org tools");
            format!("Failed to load tools for org: {error}")
        })?;

        external
            .into_iter()
            .find(|record| record.name == name && record.enabled)
            .map(ResolvedTool::External)
            .ok_or_else(|| format!("Unknown tool: {name}"))
    }

    async fn run(
        &self,
        call: &ToolCallRequest,
        ctx: &ToolContext,
    ) -> Result<Value, String> {
        if let Some(reason) = &call.rejection {
            return Err(reason.clone());
        }
        let tool = self.resolve(&call.tool, ctx).await?;

        let args = match &call.args {
            Value::Null => Value::Object(Map::new()),
            args => args.clone(),
        };
        validate_args(&tool.parameters(), &args)
            .map_err(|message| format!("Invalid arguments for {}: {message}", call.tool))?;

        let execution = async {
            match &tool {
                ResolvedTool::Builtin(tool) => tool.call(args.clone(), ctx).await,
                ResolvedTool::External(record) => self.http.call(record, &args, ctx).await,
            }
        };

        match tokio::time::timeout(self.timeout, execution).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(format!("{error:#}")),
            Err(_) => Err(format!(
                "Tool {} timed out after {}ms",
                call.tool,
                self.timeout.as_millis()
            )),
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolEngine {
    async fn list_tools(&self, ctx: &ToolContext) -> anyhow::Result<Vec<ToolDefinition>> {
        let mut definitions = self.registry.definitions();

        if let Some(org_id) = ctx.org_id.as_deref() {
            let mut external = self.store.list_external_tools(org_id).await?;
            external.sort_by(|left, right| left.name.cmp(&right.name));
            for record in external {
                if !record.enabled || self.registry.get(&record.name).is_some() {
                    continue;
                }
                definitions.push(ToolDefinition {
                    name: record.name,
                    description: record.description,
                    parameters: record.parameters,
                });
            }
        }

        Ok(definitions)
    }

    async fn execute_tool_call(
        &self,
        call: &ToolCallRequest,
        ctx: &ToolContext,
    ) -> ToolCallResult {
        let started_at = Instant::now();
        let outcome = self.run(call, ctx).await;
        let duration_ms = started_at.elapsed().as_millis() as u64;

        let org_id = ctx.org_id.as_deref().unwrap_or("-");
        match outcome {
            Ok(result) => {
                info!(
                    metric = "tool.exec.duration",
                    tool = %call.tool,
                    org_id = %org_id,
                    outcome = "ok",
                    duration_ms,
                    "tool call finished"
                );
                ToolCallResult::success(&call.tool, result)
            }
            Err(error) => {
                warn!(
                    metric = "tool.exec.duration",
                    tool = %call.tool,
                    org_id = %org_id,
                    outcome = "error",
                    duration_ms,
                    error = %error,
                    "tool call failed"
                );
                ToolCallResult::failure(&call.tool, error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc, time::Duration};

    use async_trait::async_trait;
    use axum::{Router, http::StatusCode, routing::post};
    use serde_json::{Value, json};

    use crate::{
        store::InMemoryChatStore,
        tools::{
            BuiltinTool, HttpToolClient, ToolDefinition, ToolExecutor, ToolRegistry,
            detect_tool_envelope,
        },
        types::{
            ExternalToolRecord, ToolCallEnvelope, ToolCallRequest, ToolContext,
        },
    };

    use super::ToolEngine;

    struct SlowTool;

    #[async_trait]
    impl BuiltinTool for SlowTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "slow".to_owned(),
                description: "Never finishes in time.".to_owned(),
                parameters: json!({}),
            }
        }

        async fn call(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!("late"))
        }
    }

    struct GreetTool;

    #[async_trait]
    impl BuiltinTool for GreetTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "greet".to_owned(),
                description: "Greets someone by name.".to_owned(),
                parameters: json!({
                    "type": "object",
                    "properties": { "name": { "type": "string" } },
                    "required": ["name"]
                }),
            }
        }

        async fn call(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
            let name = args["name"].as_str().unwrap_or_default();
            Ok(json!(format!("hello {name} from {}", ctx.user_id)))
        }
    }

    fn engine(store: Arc<InMemoryChatStore>) -> ToolEngine {
        let registry = ToolRegistry::with_builtins()
            .register(Arc::new(GreetTool))
            .register(Arc::new(SlowTool));
        ToolEngine::new(
            Arc::new(registry),
            store,
            HttpToolClient::default(),
            Duration::from_millis(100),
        )
    }

    fn org_ctx() -> ToolContext {
        ToolContext {
            user_id: "user-1".to_owned(),
            org_id: Some("org-1".to_owned()),
            conversation_id: Some("conv-1".to_owned()),
        }
    }

    fn call(tool: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest::new(tool, args)
    }

    fn external(name: &str, url: String, enabled: bool) -> ExternalToolRecord {
        ExternalToolRecord {
            id: format!("ext-{name}"),
            org_id: "org-1".to_owned(),
            name: name.to_owned(),
            description: format!("{name} via HTTP"),
            parameters: json!({ "type": "object" }),
            method: "POST".to_owned(),
            url,
            headers: BTreeMap::new(),
            enabled,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("test server");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn unknown_tool_is_a_result_not_an_error() {
        let engine = engine(Arc::new(InMemoryChatStore::default()));
        let result = engine
            .execute_tool_call(&call("weather.get", json!({})), &org_ctx())
            .await;

        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("Unknown tool: weather.get"));
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_before_execution() {
        let engine = engine(Arc::new(InMemoryChatStore::default()));
        let result = engine
            .execute_tool_call(&call("greet", json!({ "name": 5 })), &org_ctx())
            .await;

        assert!(!result.ok);
        let error = result.error.expect("error message");
        assert!(error.starts_with("Invalid arguments for greet"), "{error}");
    }

    #[tokio::test]
    async fn slow_tool_is_cut_off_by_timeout() {
        let engine = engine(Arc::new(InMemoryChatStore::default()));
        let result = engine
            .execute_tool_call(&call("slow", Value::Null), &org_ctx())
            .await;

        assert!(!result.ok);
        assert!(result.error.expect("timeout").contains("timed out"));
    }

    #[tokio::test]
    async fn external_tools_only_resolve_with_an_org() {
        let base = serve(Router::new().route("/crm", post(|| async { "{\"tier\":\"gold\"}" }))).await;
        let store = Arc::new(InMemoryChatStore::default());
        store
            .put_external_tool(external("crm.lookup", format!("{base}/crm"), true))
            .await;
        let engine = engine(store);

        let with_org = engine
            .execute_tool_call(&call("crm.lookup", json!({})), &org_ctx())
            .await;
        assert!(with_org.ok, "{:?}", with_org.error);
        assert_eq!(with_org.result, Some(json!({ "tier": "gold" })));

        let personal = ToolContext {
            org_id: None,
            ..org_ctx()
        };
        let without_org = engine
            .execute_tool_call(&call("crm.lookup", json!({})), &personal)
            .await;
        assert_eq!(without_org.error.as_deref(), Some("Unknown tool: crm.lookup"));
    }

    #[tokio::test]
    async fn envelope_keeps_order_and_continues_past_failures() {
        let base = serve(Router::new().route(
            "/broken",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;
        let store = Arc::new(InMemoryChatStore::default());
        store
            .put_external_tool(external("crm.broken", format!("{base}/broken"), true))
            .await;
        let engine = engine(store);

        let envelope = ToolCallEnvelope {
            tool_calls: vec![
                call("crm.broken", json!({})),
                call("missing", json!({})),
                call("greet", json!({ "name": "Ada" })),
                call("time.now", json!({})),
            ],
        };
        let results = engine.execute_tool_envelope(&envelope, &org_ctx()).await;

        let tools = results.iter().map(|r| r.tool.as_str()).collect::<Vec<_>>();
        assert_eq!(tools, vec!["crm.broken", "missing", "greet", "time.now"]);
        let oks = results.iter().map(|r| r.ok).collect::<Vec<_>>();
        assert_eq!(oks, vec![false, false, true, true]);
        assert!(results[0].error.as_deref().unwrap_or_default().contains("HTTP 500"));
        assert_eq!(results[2].result, Some(json!("hello Ada from user-1")));
    }

    #[tokio::test]
    async fn malformed_planner_entry_fails_alone() {
        let engine = engine(Arc::new(InMemoryChatStore::default()));
        let envelope = detect_tool_envelope(
            r#"{"toolCalls":[{"tool":"time.now","args":{}},{"tool":5}]}"#,
        )
        .expect("envelope");

        let results = engine.execute_tool_envelope(&envelope, &org_ctx()).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].ok);
        assert!(!results[1].ok);
        assert_eq!(results[1].tool, "toolCalls[1]");
        assert_eq!(
            results[1].error.as_deref(),
            Some("Invalid tool call at index 1: `tool` must be a string")
        );
    }

    #[tokio::test]
    async fn list_tools_merges_org_tools_and_is_stable() {
        let store = Arc::new(InMemoryChatStore::default());
        store
            .put_external_tool(external("crm.lookup", "http://127.0.0.1:9/crm".to_owned(), true))
            .await;
        store
            .put_external_tool(external("crm.disabled", "http://127.0.0.1:9/x".to_owned(), false))
            .await;
        store
            .put_external_tool(external("greet", "http://127.0.0.1:9/shadow".to_owned(), true))
            .await;
        let engine = engine(store);

        let first = engine.list_tools(&org_ctx()).await.expect("list tools");
        let second = engine.list_tools(&org_ctx()).await.expect("list tools");
        assert_eq!(first, second);

        let names = first.iter().map(|d| d.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["greet", "slow", "time.now", "crm.lookup"]);

        let personal = ToolContext {
            org_id: None,
            ..org_ctx()
        };
        let builtin_only = engine.list_tools(&personal).await.expect("list tools");
        assert_eq!(builtin_only.len(), 3);
    }
}
