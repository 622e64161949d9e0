use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::types::ToolContext;

use super::{BuiltinTool, ToolDefinition};

#[derive(Debug, Clone, Default)]
pub struct TimeNowTool;

#[async_trait]
impl BuiltinTool for TimeNowTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "time.now".to_owned(),
            description: "Returns the current UTC time as an ISO-8601 string and Unix milliseconds."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }

    async fn call(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
        let now = Utc::now();
        Ok(json!({
            "iso": now.to_rfc3339(),
            "unixMs": now.timestamp_millis(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{tools::BuiltinTool, types::ToolContext};

    use super::TimeNowTool;

    #[tokio::test]
    async fn returns_iso_and_unix_millis() {
        let result = TimeNowTool
            .call(json!({}), &ToolContext::default())
            .await
            .expect("time.now should succeed");

        let iso = result["iso"].as_str().expect("iso string");
        let parsed = chrono::DateTime::parse_from_rfc3339(iso).expect("valid rfc3339");
        assert_eq!(result["unixMs"].as_i64(), Some(parsed.timestamp_millis()));
    }
}
