use serde_json::{Map, Value};

use crate::types::{ToolCallEnvelope, ToolCallRequest};

use super::ToolDefinition;

/// Decides whether a raw planning response is a tool request.
///
/// After trimming, the whole response must be a JSON object with a
/// non-empty `toolCalls` array. Anything else, including prose that wraps
/// an envelope or fenced JSON, is a plain answer. Entries that are not
/// `{ "tool": "<name>", "args": ... }` stay in the envelope as rejected
/// calls so the rest of the batch still runs.
pub fn detect_tool_envelope(raw: &str) -> Option<ToolCallEnvelope> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        return None;
    }

    let value = serde_json::from_str::<Value>(trimmed).ok()?;
    let calls = value.as_object()?.get("toolCalls")?.as_array()?;
    if calls.is_empty() {
        return None;
    }

    let tool_calls = calls
        .iter()
        .enumerate()
        .map(|(index, call)| read_tool_call(index, call))
        .collect();

    Some(ToolCallEnvelope { tool_calls })
}

fn read_tool_call(index: usize, call: &Value) -> ToolCallRequest {
    let placeholder = format!("toolCalls[{index}]");
    let Some(call) = call.as_object() else {
        return ToolCallRequest::rejected(
            placeholder,
            format!("Invalid tool call at index {index}: expected an object"),
        );
    };
    let Some(tool) = call.get("tool").and_then(Value::as_str) else {
        return ToolCallRequest::rejected(
            placeholder,
            format!("Invalid tool call at index {index}: `tool` must be a string"),
        );
    };
    let tool = tool.trim();
    if tool.is_empty() {
        return ToolCallRequest::rejected(
            placeholder,
            format!("Invalid tool call at index {index}: `tool` is empty"),
        );
    }

    let args = match call.get("args") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(args) => args.clone(),
    };
    ToolCallRequest::new(tool, args)
}

/// System message offered to the model during the planning round.
pub fn tools_system_message(definitions: &[ToolDefinition]) -> String {
    let mut message = String::from(
        "You can call tools before answering. Available tools:\n",
    );
    for definition in definitions {
        message.push_str(&format!(
            "- {}: {} Arguments schema: {}\n",
            definition.name, definition.description, definition.parameters
        ));
    }
    message.push_str(
        "\nIf a tool is needed, reply with ONLY a JSON object of the form \
         {\"toolCalls\": [{\"tool\": \"<name>\", \"args\": {...}}]} and nothing else. \
         Otherwise answer the user directly in plain text.",
    );
    message
}
