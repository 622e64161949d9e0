mod engine;
mod envelope;
mod http_tool;
mod schema;
mod time_now;

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ToolCallEnvelope, ToolCallRequest, ToolCallResult, ToolContext};

pub use engine::ToolEngine;
pub use envelope::{detect_tool_envelope, tools_system_message};
pub use http_tool::HttpToolClient;
pub use schema::validate_args;
pub use time_now::TimeNowTool;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// In-process tool compiled into the binary.
#[async_trait]
pub trait BuiltinTool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<Value>;
}

/// Process-wide built-in tools, keyed by name. Constructed once and shared;
/// org tools are merged in per request and never stored here.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn BuiltinTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        Self::new().register(Arc::new(TimeNowTool))
    }

    pub fn register(mut self, tool: Arc<dyn BuiltinTool>) -> Self {
        self.tools.insert(tool.definition().name, tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BuiltinTool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn list_tools(&self, ctx: &ToolContext) -> anyhow::Result<Vec<ToolDefinition>>;

    /// Never fails: every problem is reported as `ok: false` in the result.
    async fn execute_tool_call(&self, call: &ToolCallRequest, ctx: &ToolContext)
    -> ToolCallResult;

    /// Runs calls one after another; results keep request order.
    async fn execute_tool_envelope(
        &self,
        envelope: &ToolCallEnvelope,
        ctx: &ToolContext,
    ) -> Vec<ToolCallResult> {
        let mut results = Vec::with_capacity(envelope.tool_calls.len());
        for call in &envelope.tool_calls {
            results.push(self.execute_tool_call(call, ctx).await);
        }
        results
    }
}
