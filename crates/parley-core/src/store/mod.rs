mod in_memory;
mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    safety::{ModerationAction, ModerationCategory},
    types::{
        ClaimedDelivery, Conversation, DeliveryOutcome, ExternalToolRecord, GenerationProfile,
        MessageRecord, ModerationIncident, NewMessage, UsageAggregate, UsageIncrement,
        WebhookDelivery, WebhookEvent, WebhookSubscription,
    },
};

pub use in_memory::InMemoryChatStore;
pub use postgres::PostgresChatStore;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_conversation(&self, conversation_id: &str)
    -> anyhow::Result<Option<Conversation>>;

    async fn get_profile(&self, profile_id: &str) -> anyhow::Result<Option<GenerationProfile>>;

    async fn get_org_policy_prompt(&self, org_id: &str) -> anyhow::Result<Option<String>>;

    async fn get_preset_prompt(&self, preset_id: &str) -> anyhow::Result<Option<String>>;

    async fn insert_message(&self, message: NewMessage) -> anyhow::Result<MessageRecord>;

    /// Last `limit` messages of a conversation, oldest first.
    async fn list_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<MessageRecord>>;

    async fn list_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<MessageRecord>>;

    /// Moves `last_activity_at` forward; never backwards.
    async fn touch_conversation(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Enabled HTTP-backed tools for an org.
    async fn list_external_tools(&self, org_id: &str) -> anyhow::Result<Vec<ExternalToolRecord>>;

    async fn get_moderation_overrides(
        &self,
        org_id: &str,
    ) -> anyhow::Result<HashMap<ModerationCategory, ModerationAction>>;

    async fn insert_moderation_incident(&self, incident: ModerationIncident)
    -> anyhow::Result<()>;

    async fn list_moderation_incidents(
        &self,
        org_id: &str,
    ) -> anyhow::Result<Vec<ModerationIncident>>;

    async fn list_active_subscriptions(
        &self,
        org_id: &str,
    ) -> anyhow::Result<Vec<WebhookSubscription>>;

    /// Writes the event and its pending deliveries as one unit.
    async fn insert_event_with_deliveries(
        &self,
        event: &WebhookEvent,
        deliveries: &[WebhookDelivery],
    ) -> anyhow::Result<()>;

    /// Atomically moves up to `limit` pending deliveries to `in_flight` and
    /// returns them. A row is handed to at most one caller.
    async fn claim_pending_deliveries(&self, limit: usize)
    -> anyhow::Result<Vec<ClaimedDelivery>>;

    async fn complete_delivery(
        &self,
        delivery_id: &str,
        outcome: DeliveryOutcome,
    ) -> anyhow::Result<()>;

    /// Fails `in_flight` deliveries claimed before `claimed_before` with
    /// `reason` as the recorded error. Returns how many rows were expired.
    async fn expire_stale_deliveries(
        &self,
        claimed_before: DateTime<Utc>,
        reason: &str,
    ) -> anyhow::Result<usize>;

    async fn list_deliveries(&self, event_id: &str) -> anyhow::Result<Vec<WebhookDelivery>>;

    async fn list_events(&self, org_id: &str) -> anyhow::Result<Vec<WebhookEvent>>;

    /// Adds to both the org-daily and org-user-daily rows in one atomic step.
    async fn increment_usage(&self, increment: UsageIncrement) -> anyhow::Result<()>;

    async fn list_usage_aggregates(&self, org_id: &str) -> anyhow::Result<Vec<UsageAggregate>>;
}
