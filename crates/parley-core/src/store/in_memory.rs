use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use crate::{
    safety::{ModerationAction, ModerationCategory},
    types::{
        ClaimedDelivery, Conversation, DeliveryOutcome, DeliveryStatus, ExternalToolRecord,
        GenerationProfile, MessageRecord, ModerationIncident, NewMessage, UsageAggregate,
        UsageIncrement, WebhookDelivery, WebhookEvent, WebhookSubscription,
    },
};

use super::ChatStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UsageKey {
    org_id: String,
    user_id: Option<String>,
    date: NaiveDate,
    provider: String,
    model: String,
    feature: String,
}

/// Deliveries and events are keyed by id; the side indexes keep claim and
/// expiry proportional to the rows they touch.
#[derive(Debug, Default)]
struct WebhookState {
    subscriptions: HashMap<String, WebhookSubscription>,
    events: HashMap<String, WebhookEvent>,
    events_by_org: HashMap<String, Vec<String>>,
    deliveries: HashMap<String, WebhookDelivery>,
    deliveries_by_event: HashMap<String, Vec<String>>,
    pending: VecDeque<String>,
    in_flight: HashSet<String>,
}

/// Process-local store used by tests and when no database is configured.
#[derive(Debug)]
pub struct InMemoryChatStore {
    conversations: RwLock<HashMap<String, Conversation>>,
    profiles: RwLock<HashMap<String, GenerationProfile>>,
    org_policies: RwLock<HashMap<String, String>>,
    presets: RwLock<HashMap<String, String>>,
    messages: RwLock<HashMap<String, Vec<MessageRecord>>>,
    external_tools: RwLock<HashMap<String, Vec<ExternalToolRecord>>>,
    moderation_overrides: RwLock<HashMap<String, HashMap<ModerationCategory, ModerationAction>>>,
    incidents: RwLock<Vec<ModerationIncident>>,
    webhooks: RwLock<WebhookState>,
    usage: RwLock<HashMap<UsageKey, UsageAggregate>>,
    message_seq: AtomicU64,
}

impl Default for InMemoryChatStore {
    fn default() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            org_policies: RwLock::new(HashMap::new()),
            presets: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            external_tools: RwLock::new(HashMap::new()),
            moderation_overrides: RwLock::new(HashMap::new()),
            incidents: RwLock::new(Vec::new()),
            webhooks: RwLock::new(WebhookState::default()),
            usage: RwLock::new(HashMap::new()),
            message_seq: AtomicU64::new(1),
        }
    }
}

impl InMemoryChatStore {
    pub async fn put_conversation(&self, conversation: Conversation) {
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation);
    }

    pub async fn put_profile(&self, profile: GenerationProfile) {
        self.profiles
            .write()
            .await
            .insert(profile.id.clone(), profile);
    }

    pub async fn put_org_policy_prompt(&self, org_id: &str, prompt: &str) {
        self.org_policies
            .write()
            .await
            .insert(org_id.to_owned(), prompt.to_owned());
    }

    pub async fn put_preset_prompt(&self, preset_id: &str, prompt: &str) {
        self.presets
            .write()
            .await
            .insert(preset_id.to_owned(), prompt.to_owned());
    }

    pub async fn put_external_tool(&self, tool: ExternalToolRecord) {
        self.external_tools
            .write()
            .await
            .entry(tool.org_id.clone())
            .or_default()
            .push(tool);
    }

    pub async fn put_moderation_overrides(
        &self,
        org_id: &str,
        overrides: HashMap<ModerationCategory, ModerationAction>,
    ) {
        self.moderation_overrides
            .write()
            .await
            .insert(org_id.to_owned(), overrides);
    }

    pub async fn put_subscription(&self, subscription: WebhookSubscription) {
        self.webhooks
            .write()
            .await
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub async fn set_subscription_active(&self, subscription_id: &str, active: bool) -> bool {
        let mut webhooks = self.webhooks.write().await;
        match webhooks.subscriptions.get_mut(subscription_id) {
            Some(subscription) => {
                subscription.active = active;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Option<Conversation>> {
        Ok(self.conversations.read().await.get(conversation_id).cloned())
    }

    async fn get_profile(&self, profile_id: &str) -> anyhow::Result<Option<GenerationProfile>> {
        Ok(self.profiles.read().await.get(profile_id).cloned())
    }

    async fn get_org_policy_prompt(&self, org_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.org_policies.read().await.get(org_id).cloned())
    }

    async fn get_preset_prompt(&self, preset_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.presets.read().await.get(preset_id).cloned())
    }

    async fn insert_message(&self, message: NewMessage) -> anyhow::Result<MessageRecord> {
        let id = self.message_seq.fetch_add(1, Ordering::Relaxed);
        let record = MessageRecord {
            id: format!("msg-{id}"),
            conversation_id: message.conversation_id,
            user_id: message.user_id,
            role: message.role,
            content: message.content,
            metadata: message.metadata,
            created_at: Utc::now(),
        };
        self.messages
            .write()
            .await
            .entry(record.conversation_id.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn list_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<MessageRecord>> {
        let mut messages = self.list_messages(conversation_id).await?;
        if messages.len() > limit {
            let start = messages.len().saturating_sub(limit);
            messages = messages.split_off(start);
        }
        Ok(messages)
    }

    async fn list_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<MessageRecord>> {
        Ok(self
            .messages
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .with_context(|| format!("conversation {conversation_id} does not exist"))?;
        if at > conversation.last_activity_at {
            conversation.last_activity_at = at;
        }
        Ok(())
    }

    async fn list_external_tools(&self, org_id: &str) -> anyhow::Result<Vec<ExternalToolRecord>> {
        Ok(self
            .external_tools
            .read()
            .await
            .get(org_id)
            .map(|tools| tools.iter().filter(|tool| tool.enabled).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_moderation_overrides(
        &self,
        org_id: &str,
    ) -> anyhow::Result<HashMap<ModerationCategory, ModerationAction>> {
        Ok(self
            .moderation_overrides
            .read()
            .await
            .get(org_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_moderation_incident(
        &self,
        incident: ModerationIncident,
    ) -> anyhow::Result<()> {
        self.incidents.write().await.push(incident);
        Ok(())
    }

    async fn list_moderation_incidents(
        &self,
        org_id: &str,
    ) -> anyhow::Result<Vec<ModerationIncident>> {
        Ok(self
            .incidents
            .read()
            .await
            .iter()
            .filter(|incident| incident.org_id.as_deref() == Some(org_id))
            .cloned()
            .collect())
    }

    async fn list_active_subscriptions(
        &self,
        org_id: &str,
    ) -> anyhow::Result<Vec<WebhookSubscription>> {
        let mut subscriptions = self
            .webhooks
            .read()
            .await
            .subscriptions
            .values()
            .filter(|subscription| subscription.org_id == org_id && subscription.active)
            .cloned()
            .collect::<Vec<_>>();
        subscriptions.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(subscriptions)
    }

    async fn insert_event_with_deliveries(
        &self,
        event: &WebhookEvent,
        deliveries: &[WebhookDelivery],
    ) -> anyhow::Result<()> {
        let mut webhooks = self.webhooks.write().await;
        webhooks
            .events_by_org
            .entry(event.org_id.clone())
            .or_default()
            .push(event.id.clone());
        webhooks.events.insert(event.id.clone(), event.clone());
        for delivery in deliveries {
            webhooks
                .deliveries_by_event
                .entry(delivery.event_id.clone())
                .or_default()
                .push(delivery.id.clone());
            if delivery.status == DeliveryStatus::Pending {
                webhooks.pending.push_back(delivery.id.clone());
            }
            webhooks
                .deliveries
                .insert(delivery.id.clone(), delivery.clone());
        }
        Ok(())
    }

    async fn claim_pending_deliveries(
        &self,
        limit: usize,
    ) -> anyhow::Result<Vec<ClaimedDelivery>> {
        let mut webhooks = self.webhooks.write().await;
        let WebhookState {
            subscriptions,
            events,
            deliveries,
            pending,
            in_flight,
            ..
        } = &mut *webhooks;

        let now = Utc::now();
        let mut claimed = Vec::new();
        while claimed.len() < limit {
            let Some(delivery_id) = pending.pop_front() else {
                break;
            };
            let Some(delivery) = deliveries.get_mut(&delivery_id) else {
                continue;
            };
            if delivery.status != DeliveryStatus::Pending {
                continue;
            }
            let event = events.get(&delivery.event_id);
            let subscription = subscriptions.get(&delivery.subscription_id);
            let (Some(event), Some(subscription)) = (event, subscription) else {
                delivery.status = DeliveryStatus::Failed;
                delivery.error = Some("event or subscription missing at drain time".to_owned());
                delivery.completed_at = Some(now);
                continue;
            };

            delivery.status = DeliveryStatus::InFlight;
            delivery.claimed_at = Some(now);
            in_flight.insert(delivery_id.clone());
            claimed.push(ClaimedDelivery {
                delivery_id,
                event: event.clone(),
                subscription: subscription.clone(),
            });
        }

        Ok(claimed)
    }

    async fn complete_delivery(
        &self,
        delivery_id: &str,
        outcome: DeliveryOutcome,
    ) -> anyhow::Result<()> {
        let mut webhooks = self.webhooks.write().await;
        let delivery = webhooks
            .deliveries
            .get_mut(delivery_id)
            .with_context(|| format!("delivery {delivery_id} does not exist"))?;
        if delivery.status != DeliveryStatus::InFlight {
            return Ok(());
        }
        delivery.status = outcome.status;
        delivery.status_code = outcome.status_code;
        delivery.latency_ms = Some(outcome.latency_ms);
        delivery.error = outcome.error;
        delivery.completed_at = Some(Utc::now());
        webhooks.in_flight.remove(delivery_id);
        Ok(())
    }

    async fn expire_stale_deliveries(
        &self,
        claimed_before: DateTime<Utc>,
        reason: &str,
    ) -> anyhow::Result<usize> {
        let mut webhooks = self.webhooks.write().await;
        let WebhookState {
            deliveries,
            in_flight,
            ..
        } = &mut *webhooks;

        let now = Utc::now();
        let mut expired = 0;
        in_flight.retain(|delivery_id| {
            let Some(delivery) = deliveries.get_mut(delivery_id) else {
                return false;
            };
            if delivery.status != DeliveryStatus::InFlight {
                return false;
            }
            if delivery.claimed_at.is_some_and(|at| at >= claimed_before) {
                return true;
            }
            delivery.status = DeliveryStatus::Failed;
            delivery.error = Some(reason.to_owned());
            delivery.completed_at = Some(now);
            expired += 1;
            false
        });
        Ok(expired)
    }

    async fn list_deliveries(&self, event_id: &str) -> anyhow::Result<Vec<WebhookDelivery>> {
        let webhooks = self.webhooks.read().await;
        Ok(webhooks
            .deliveries_by_event
            .get(event_id)
            .into_iter()
            .flatten()
            .filter_map(|delivery_id| webhooks.deliveries.get(delivery_id))
            .cloned()
            .collect())
    }

    async fn list_events(&self, org_id: &str) -> anyhow::Result<Vec<WebhookEvent>> {
        let webhooks = self.webhooks.read().await;
        Ok(webhooks
            .events_by_org
            .get(org_id)
            .into_iter()
            .flatten()
            .filter_map(|event_id| webhooks.events.get(event_id))
            .cloned()
            .collect())
    }

    async fn increment_usage(&self, increment: UsageIncrement) -> anyhow::Result<()> {
        let mut usage = self.usage.write().await;
        for user_id in [None, Some(increment.user_id.clone())] {
            let key = UsageKey {
                org_id: increment.org_id.clone(),
                user_id: user_id.clone(),
                date: increment.date,
                provider: increment.provider.clone(),
                model: increment.model.clone(),
                feature: increment.feature.clone(),
            };
            let row = usage.entry(key).or_insert_with(|| UsageAggregate {
                org_id: increment.org_id.clone(),
                user_id,
                date: increment.date,
                provider: increment.provider.clone(),
                model: increment.model.clone(),
                feature: increment.feature.clone(),
                request_count: 0,
                input_tokens: 0,
                output_tokens: 0,
                cost_usd: 0.0,
            });
            row.request_count += 1;
            row.input_tokens += increment.input_tokens;
            row.output_tokens += increment.output_tokens;
            row.cost_usd += increment.cost_usd;
        }
        Ok(())
    }

    async fn list_usage_aggregates(&self, org_id: &str) -> anyhow::Result<Vec<UsageAggregate>> {
        let mut rows = self
            .usage
            .read()
            .await
            .values()
            .filter(|row| row.org_id == org_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|left, right| {
            left.date
                .cmp(&right.date)
                .then_with(|| left.user_id.cmp(&right.user_id))
                .then_with(|| left.model.cmp(&right.model))
        });
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, NaiveDate, Utc};
    use serde_json::json;

    use crate::types::{
        Conversation, ConversationSettings, DeliveryOutcome, DeliveryStatus, MessageRole,
        NewMessage, UsageIncrement, WebhookDelivery, WebhookEvent, WebhookSubscription,
    };

    use super::{ChatStore, InMemoryChatStore};

    fn conversation(id: &str) -> Conversation {
        Conversation {
            id: id.to_owned(),
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
            last_activity_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn recent_messages_are_bounded_and_chronological() {
        let store = InMemoryChatStore::default();
        for index in 0..5 {
            store
                .insert_message(NewMessage {
                    conversation_id: "c1".into(),
                    user_id: Some("u1".into()),
                    role: MessageRole::User,
                    content: format!("message {index}"),
                    metadata: json!({}),
                })
                .await
                .expect("insert message");
        }

        let recent = store
            .list_recent_messages("c1", 3)
            .await
            .expect("list recent");
        let contents = recent
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["message 2", "message 3", "message 4"]);
    }

    #[tokio::test]
    async fn touch_never_moves_activity_backwards() {
        let store = InMemoryChatStore::default();
        let conversation = conversation("c1");
        let original = conversation.last_activity_at;
        store.put_conversation(conversation).await;

        store
            .touch_conversation("c1", original - Duration::minutes(5))
            .await
            .expect("touch");
        let loaded = store
            .get_conversation("c1")
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(loaded.last_activity_at, original);
    }

    #[tokio::test]
    async fn concurrent_usage_increments_are_not_lost() {
        let store = Arc::new(InMemoryChatStore::default());
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).expect("valid date");

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .increment_usage(UsageIncrement {
                        org_id: "org-1".into(),
                        user_id: "user-1".into(),
                        date,
                        provider: "openrouter".into(),
                        model: "m".into(),
                        feature: "chat".into(),
                        input_tokens: 10,
                        output_tokens: 5,
                        cost_usd: 0.001,
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("increment");
        }

        let rows = store
            .list_usage_aggregates("org-1")
            .await
            .expect("list usage");
        assert_eq!(rows.len(), 2);
        for row in rows {
            assert_eq!(row.request_count, 20);
            assert_eq!(row.input_tokens, 200);
            assert_eq!(row.output_tokens, 100);
        }
    }

    #[tokio::test]
    async fn claimed_deliveries_are_not_claimed_twice() {
        let store = InMemoryChatStore::default();
        store
            .put_subscription(WebhookSubscription {
                id: "sub-1".into(),
                org_id: "org-1".into(),
                url: "http://127.0.0.1:9/hook".into(),
                secret: "s".into(),
                event_types: Vec::new(),
                active: true,
            })
            .await;
        let event = WebhookEvent {
            id: "evt-1".into(),
            event_type: "chat.turn.completed".into(),
            org_id: "org-1".into(),
            conversation_id: None,
            message_id: None,
            metadata: json!({}),
            created_at: Utc::now(),
        };
        let delivery = WebhookDelivery {
            id: "del-1".into(),
            event_id: "evt-1".into(),
            subscription_id: "sub-1".into(),
            status: DeliveryStatus::Pending,
            status_code: None,
            latency_ms: None,
            error: None,
            created_at: Utc::now(),
            claimed_at: None,
            completed_at: None,
        };
        store
            .insert_event_with_deliveries(&event, &[delivery])
            .await
            .expect("insert");

        let first = store.claim_pending_deliveries(10).await.expect("claim");
        let second = store.claim_pending_deliveries(10).await.expect("claim");
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());

        store
            .complete_delivery(
                "del-1",
                DeliveryOutcome {
                    status: DeliveryStatus::Success,
                    status_code: Some(200),
                    latency_ms: 12,
                    error: None,
                },
            )
            .await
            .expect("complete");
        let rows = store.list_deliveries("evt-1").await.expect("list");
        assert_eq!(rows[0].status, DeliveryStatus::Success);
        assert_eq!(rows[0].status_code, Some(200));
    }

    #[tokio::test]
    async fn abandoned_claims_expire_to_failed_and_ignore_late_completion() {
        let store = InMemoryChatStore::default();
        store
            .put_subscription(WebhookSubscription {
                id: "sub-1".into(),
                org_id: "org-1".into(),
                url: "http://127.0.0.1:9/hook".into(),
                secret: "s".into(),
                event_types: Vec::new(),
                active: true,
            })
            .await;
        let event = WebhookEvent {
            id: "evt-1".into(),
            event_type: "chat.turn.completed".into(),
            org_id: "org-1".into(),
            conversation_id: None,
            message_id: None,
            metadata: json!({}),
            created_at: Utc::now(),
        };
        let deliveries = ["del-1", "del-2"].map(|id| WebhookDelivery {
            id: id.into(),
            event_id: "evt-1".into(),
            subscription_id: "sub-1".into(),
            status: DeliveryStatus::Pending,
            status_code: None,
            latency_ms: None,
            error: None,
            created_at: Utc::now(),
            claimed_at: None,
            completed_at: None,
        });
        store
            .insert_event_with_deliveries(&event, &deliveries)
            .await
            .expect("insert");

        let claimed = store.claim_pending_deliveries(1).await.expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].delivery_id, "del-1");

        let fresh = store
            .expire_stale_deliveries(Utc::now() - Duration::minutes(1), "abandoned")
            .await
            .expect("expire");
        assert_eq!(fresh, 0);

        let expired = store
            .expire_stale_deliveries(Utc::now() + Duration::seconds(1), "abandoned")
            .await
            .expect("expire");
        assert_eq!(expired, 1);

        store
            .complete_delivery(
                "del-1",
                DeliveryOutcome {
                    status: DeliveryStatus::Success,
                    status_code: Some(200),
                    latency_ms: 5,
                    error: None,
                },
            )
            .await
            .expect("late complete");

        let rows = store.list_deliveries("evt-1").await.expect("list");
        assert_eq!(rows[0].id, "del-1");
        assert_eq!(rows[0].status, DeliveryStatus::Failed);
        assert_eq!(rows[0].error.as_deref(), Some("abandoned"));
        assert!(rows[0].claimed_at.is_some());
        assert!(rows[0].completed_at.is_some());
        assert_eq!(rows[1].status, DeliveryStatus::Pending);

        let events = store.list_events("org-1").await.expect("events");
        assert_eq!(events.len(), 1);
    }
}
