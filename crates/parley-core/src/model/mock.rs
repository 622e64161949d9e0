use async_trait::async_trait;
use serde_json::json;

use crate::types::{MessageRole, Usage};

use super::{ChatMessage, ModelProvider, ModelRequest, ModelResponse};

/// Offline provider used when no API key is configured. Asks for `time.now`
/// when offered tools and the user asks about the time; otherwise echoes.
#[derive(Debug, Default)]
pub struct MockModelProvider;

#[async_trait]
impl ModelProvider for MockModelProvider {
    fn default_model(&self) -> &str {
        "mock-1"
    }

    async fn complete(&self, request: ModelRequest) -> anyhow::Result<ModelResponse> {
        let offered_time_tool = request.messages.iter().any(|message| {
            message.role == MessageRole::System && message.content.contains("- time.now:")
        });
        let last = request.messages.last();
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .map(|message| message.content.as_str())
            .unwrap_or_default();

        let content = match last {
            Some(message) if message.role == MessageRole::Tool => {
                format!("Based on the tool results: {}", message.content)
            }
            _ if offered_time_tool && asks_for_time(last_user) => json!({
                "toolCalls": [{ "tool": "time.now", "args": {} }]
            })
            .to_string(),
            _ => format!("Parley mock reply: {last_user}"),
        };

        let usage = Usage {
            input_tokens: count_words(&request.messages),
            output_tokens: content.split_whitespace().count() as u32,
        };

        Ok(ModelResponse {
            content,
            usage: Some(usage),
        })
    }
}

fn asks_for_time(input: &str) -> bool {
    let lowered = input.to_lowercase();
    lowered.contains("what time") || lowered.contains("current time")
}

fn count_words(messages: &[ChatMessage]) -> u32 {
    messages
        .iter()
        .map(|message| message.content.split_whitespace().count() as u32)
        .sum()
}
