use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::safety::{ModerationAction, ModerationCategory, ModerationSource};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(MessageRole::System),
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

/// Tool and retrieval switches stored alongside a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationSettings {
    pub structured_tools: bool,
    pub rag_enabled: bool,
    pub rag_namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub org_id: Option<String>,
    pub owner_user_id: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub profile_id: Option<String>,
    pub preset_id: Option<String>,
    pub settings: ConversationSettings,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A reusable set of generation overrides a conversation can link to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationProfile {
    pub id: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub preset_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub user_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub user_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn add(self, other: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens.saturating_add(other.input_tokens),
            output_tokens: self.output_tokens.saturating_add(other.output_tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    /// Set when a planner entry could not be read as a tool call. The
    /// engine reports it as a failed call without running anything.
    #[serde(skip)]
    pub rejection: Option<String>,
}

impl ToolCallRequest {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
            rejection: None,
        }
    }

    pub fn rejected(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: Value::Null,
            rejection: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEnvelope {
    pub tool_calls: Vec<ToolCallRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallResult {
    pub tool: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn success(tool: impl Into<String>, result: Value) -> Self {
        Self {
            tool: tool.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Identity handed to every tool executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolContext {
    pub user_id: String,
    pub org_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// Org-scoped HTTP-backed tool configured by an org admin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalToolRecord {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationIncident {
    pub id: String,
    pub org_id: Option<String>,
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
    pub source: ModerationSource,
    pub scores: BTreeMap<ModerationCategory, f32>,
    pub action: ModerationAction,
    pub top_category: ModerationCategory,
    pub snippet: String,
    pub is_severe: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub org_id: String,
    pub url: String,
    pub secret: String,
    pub event_types: Vec<String>,
    pub active: bool,
}

/// Canonical emitted fact; this is the exact JSON body sent to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub org_id: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::InFlight => "in_flight",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(DeliveryStatus::Pending),
            "in_flight" => Some(DeliveryStatus::InFlight),
            "success" => Some(DeliveryStatus::Success),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: String,
    pub event_id: String,
    pub subscription_id: String,
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the row last moved to `in_flight`.
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A delivery row claimed by a drain cycle, joined with what it needs to send.
#[derive(Debug, Clone)]
pub struct ClaimedDelivery {
    pub delivery_id: String,
    pub event: WebhookEvent,
    pub subscription: WebhookSubscription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// One turn's worth of metered usage, applied to both the org-daily and
/// org-user-daily aggregates.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageIncrement {
    pub org_id: String,
    pub user_id: String,
    pub date: NaiveDate,
    pub provider: String,
    pub model: String,
    pub feature: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageAggregate {
    pub org_id: String,
    /// `None` for the org-daily rollup.
    pub user_id: Option<String>,
    pub date: NaiveDate,
    pub provider: String,
    pub model: String,
    pub feature: String,
    pub request_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnTimings {
    pub total_ms: u64,
    pub load_context_ms: u64,
    pub moderation_ms: u64,
    pub planning_ms: u64,
    pub tool_execution_ms: u64,
    pub final_model_ms: u64,
    pub persist_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationNotice {
    pub source: ModerationSource,
    pub action: ModerationAction,
    pub category: ModerationCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReply {
    pub conversation_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub assistant_content: String,
    pub usage: Option<Usage>,
    pub tool_message_id: Option<String>,
    pub tool_results: Vec<ToolCallResult>,
    pub moderation: Vec<ModerationNotice>,
    pub timings: TurnTimings,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnStreamEvent {
    Token {
        token: String,
    },
    End {
        #[serde(rename = "messageId")]
        message_id: String,
        message: String,
        usage: Option<Usage>,
    },
    Error {
        error: String,
    },
}
