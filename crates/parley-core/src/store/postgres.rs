use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row, postgres::PgPoolOptions, postgres::PgRow, types::Json};
use tracing::warn;
use uuid::Uuid;

use crate::{
    safety::{ModerationAction, ModerationCategory, ModerationSource},
    types::{
        ClaimedDelivery, Conversation, ConversationSettings, DeliveryOutcome, DeliveryStatus,
        ExternalToolRecord, GenerationProfile, MessageRecord, MessageRole, ModerationIncident,
        NewMessage, UsageAggregate, UsageIncrement, WebhookDelivery, WebhookEvent,
        WebhookSubscription,
    },
};

use super::ChatStore;

const SCHEMA_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Clone)]
pub struct PostgresChatStore {
    pool: PgPool,
}

impl PostgresChatStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("failed to apply database schema")?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for PostgresChatStore {
    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, org_id, owner_user_id, provider, model, system_prompt, temperature, top_p,
                    max_tokens, profile_id, preset_id, settings, last_activity_at, created_at
             FROM conversations
             WHERE id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| conversation_from_row(&row)).transpose()
    }

    async fn get_profile(&self, profile_id: &str) -> anyhow::Result<Option<GenerationProfile>> {
        let row = sqlx::query_as::<
            _,
            (
                String,
                Option<String>,
                Option<String>,
                Option<f32>,
                Option<f32>,
                Option<i32>,
                Option<String>,
            ),
        >(
            "SELECT id, provider, model, temperature, top_p, max_tokens, preset_id
             FROM generation_profiles
             WHERE id = $1",
        )
        .bind(profile_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(id, provider, model, temperature, top_p, max_tokens, preset_id)| GenerationProfile {
                id,
                provider,
                model,
                temperature,
                top_p,
                max_tokens: max_tokens.and_then(|value| u32::try_from(value).ok()),
                preset_id,
            },
        ))
    }

    async fn get_org_policy_prompt(&self, org_id: &str) -> anyhow::Result<Option<String>> {
        let prompt = sqlx::query_as::<_, (String,)>(
            "SELECT prompt FROM org_ai_policies WHERE org_id = $1",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.0);
        Ok(prompt)
    }

    async fn get_preset_prompt(&self, preset_id: &str) -> anyhow::Result<Option<String>> {
        let prompt =
            sqlx::query_as::<_, (String,)>("SELECT system_prompt FROM presets WHERE id = $1")
                .bind(preset_id)
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.0);
        Ok(prompt)
    }

    async fn insert_message(&self, message: NewMessage) -> anyhow::Result<MessageRecord> {
        let id = Uuid::new_v4().to_string();
        let (created_at,) = sqlx::query_as::<_, (DateTime<Utc>,)>(
            "INSERT INTO messages (id, conversation_id, user_id, role, content, metadata)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING created_at",
        )
        .bind(&id)
        .bind(&message.conversation_id)
        .bind(&message.user_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(Json(&message.metadata))
        .fetch_one(&self.pool)
        .await?;

        Ok(MessageRecord {
            id,
            conversation_id: message.conversation_id,
            user_id: message.user_id,
            role: message.role,
            content: message.content,
            metadata: message.metadata,
            created_at,
        })
    }

    async fn list_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<MessageRecord>> {
        let limit = limit as i64;
        let rows = sqlx::query(
            "SELECT id, conversation_id, user_id, role, content, metadata, created_at
             FROM messages
             WHERE conversation_id = $1
             ORDER BY seq DESC
             LIMIT $2",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn list_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, user_id, role, content, metadata, created_at
             FROM messages
             WHERE conversation_id = $1
             ORDER BY seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE conversations
             SET last_activity_at = GREATEST(last_activity_at, $2)
             WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_external_tools(&self, org_id: &str) -> anyhow::Result<Vec<ExternalToolRecord>> {
        let rows = sqlx::query_as::<
            _,
            (
                String,
                String,
                String,
                String,
                Json<Value>,
                String,
                String,
                Json<BTreeMap<String, String>>,
                bool,
            ),
        >(
            "SELECT id, org_id, name, description, parameters, method, url, headers, enabled
             FROM external_tools
             WHERE org_id = $1 AND enabled
             ORDER BY name",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, org_id, name, description, parameters, method, url, headers, enabled)| {
                    ExternalToolRecord {
                        id,
                        org_id,
                        name,
                        description,
                        parameters: parameters.0,
                        method,
                        url,
                        headers: headers.0,
                        enabled,
                    }
                },
            )
            .collect())
    }

    async fn get_moderation_overrides(
        &self,
        org_id: &str,
    ) -> anyhow::Result<HashMap<ModerationCategory, ModerationAction>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT category, action FROM moderation_policies WHERE org_id = $1",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        let mut overrides = HashMap::new();
        for (category, action) in rows {
            match (
                ModerationCategory::parse(&category),
                ModerationAction::parse(&action),
            ) {
                (Some(category), Some(action)) => {
                    overrides.insert(category, action);
                }
                _ => warn!(
                    org_id = %org_id,
                    category = %category,
                    action = %action,
                    "ignoring unrecognized moderation policy entry"
                ),
            }
        }
        Ok(overrides)
    }

    async fn insert_moderation_incident(
        &self,
        incident: ModerationIncident,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO moderation_incidents
             (id, org_id, conversation_id, user_id, source, scores, action, top_category, snippet, is_severe, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(incident.id)
        .bind(incident.org_id)
        .bind(incident.conversation_id)
        .bind(incident.user_id)
        .bind(incident.source.as_str())
        .bind(Json(&incident.scores))
        .bind(incident.action.as_str())
        .bind(incident.top_category.as_str())
        .bind(incident.snippet)
        .bind(incident.is_severe)
        .bind(incident.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_moderation_incidents(
        &self,
        org_id: &str,
    ) -> anyhow::Result<Vec<ModerationIncident>> {
        let rows = sqlx::query(
            "SELECT id, org_id, conversation_id, user_id, source, scores, action, top_category,
                    snippet, is_severe, created_at
             FROM moderation_incidents
             WHERE org_id = $1
             ORDER BY created_at",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(incident_from_row).collect()
    }

    async fn list_active_subscriptions(
        &self,
        org_id: &str,
    ) -> anyhow::Result<Vec<WebhookSubscription>> {
        let rows = sqlx::query_as::<_, (String, String, String, String, Vec<String>, bool)>(
            "SELECT id, org_id, url, secret, event_types, active
             FROM webhook_subscriptions
             WHERE org_id = $1 AND active
             ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, org_id, url, secret, event_types, active)| WebhookSubscription {
                    id,
                    org_id,
                    url,
                    secret,
                    event_types,
                    active,
                },
            )
            .collect())
    }

    async fn insert_event_with_deliveries(
        &self,
        event: &WebhookEvent,
        deliveries: &[WebhookDelivery],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO webhook_events (id, org_id, event_type, conversation_id, message_id, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&event.id)
        .bind(&event.org_id)
        .bind(&event.event_type)
        .bind(&event.conversation_id)
        .bind(&event.message_id)
        .bind(Json(&event.metadata))
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;

        for delivery in deliveries {
            sqlx::query(
                "INSERT INTO webhook_deliveries (id, event_id, subscription_id, status, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&delivery.id)
            .bind(&delivery.event_id)
            .bind(&delivery.subscription_id)
            .bind(delivery.status.as_str())
            .bind(delivery.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn claim_pending_deliveries(
        &self,
        limit: usize,
    ) -> anyhow::Result<Vec<ClaimedDelivery>> {
        let rows = sqlx::query(
            "WITH claimed AS (
                 UPDATE webhook_deliveries
                 SET status = 'in_flight', claimed_at = now()
                 WHERE id IN (
                     SELECT id FROM webhook_deliveries
                     WHERE status = 'pending'
                     ORDER BY created_at
                     LIMIT $1
                     FOR UPDATE SKIP LOCKED
                 )
                 RETURNING id, event_id, subscription_id
             )
             SELECT c.id AS delivery_id,
                    e.id AS event_id, e.org_id AS event_org_id, e.event_type, e.conversation_id,
                    e.message_id, e.metadata, e.created_at AS event_created_at,
                    s.id AS subscription_id, s.org_id AS subscription_org_id, s.url, s.secret,
                    s.event_types, s.active
             FROM claimed c
             JOIN webhook_events e ON e.id = c.event_id
             JOIN webhook_subscriptions s ON s.id = c.subscription_id",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ClaimedDelivery {
                    delivery_id: row.try_get("delivery_id")?,
                    event: WebhookEvent {
                        id: row.try_get("event_id")?,
                        event_type: row.try_get("event_type")?,
                        org_id: row.try_get("event_org_id")?,
                        conversation_id: row.try_get("conversation_id")?,
                        message_id: row.try_get("message_id")?,
                        metadata: row.try_get::<Json<Value>, _>("metadata")?.0,
                        created_at: row.try_get("event_created_at")?,
                    },
                    subscription: WebhookSubscription {
                        id: row.try_get("subscription_id")?,
                        org_id: row.try_get("subscription_org_id")?,
                        url: row.try_get("url")?,
                        secret: row.try_get("secret")?,
                        event_types: row.try_get("event_types")?,
                        active: row.try_get("active")?,
                    },
                })
            })
            .collect()
    }

    async fn complete_delivery(
        &self,
        delivery_id: &str,
        outcome: DeliveryOutcome,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE webhook_deliveries
             SET status = $2, status_code = $3, latency_ms = $4, error = $5, completed_at = now()
             WHERE id = $1 AND status = 'in_flight'",
        )
        .bind(delivery_id)
        .bind(outcome.status.as_str())
        .bind(outcome.status_code.map(i32::from))
        .bind(i64::try_from(outcome.latency_ms).unwrap_or(i64::MAX))
        .bind(outcome.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expire_stale_deliveries(
        &self,
        claimed_before: DateTime<Utc>,
        reason: &str,
    ) -> anyhow::Result<usize> {
        let result = sqlx::query(
            "UPDATE webhook_deliveries
             SET status = 'failed', error = $2, completed_at = now()
             WHERE status = 'in_flight' AND (claimed_at IS NULL OR claimed_at < $1)",
        )
        .bind(claimed_before)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn list_deliveries(&self, event_id: &str) -> anyhow::Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query(
            "SELECT id, event_id, subscription_id, status, status_code, latency_ms, error,
                    created_at, claimed_at, completed_at
             FROM webhook_deliveries
             WHERE event_id = $1
             ORDER BY created_at, id",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(delivery_from_row).collect()
    }

    async fn list_events(&self, org_id: &str) -> anyhow::Result<Vec<WebhookEvent>> {
        let rows = sqlx::query_as::<
            _,
            (
                String,
                String,
                String,
                Option<String>,
                Option<String>,
                Json<Value>,
                DateTime<Utc>,
            ),
        >(
            "SELECT id, event_type, org_id, conversation_id, message_id, metadata, created_at
             FROM webhook_events
             WHERE org_id = $1
             ORDER BY created_at",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, event_type, org_id, conversation_id, message_id, metadata, created_at)| {
                    WebhookEvent {
                        id,
                        event_type,
                        org_id,
                        conversation_id,
                        message_id,
                        metadata: metadata.0,
                        created_at,
                    }
                },
            )
            .collect())
    }

    async fn increment_usage(&self, increment: UsageIncrement) -> anyhow::Result<()> {
        let input_tokens = i64::try_from(increment.input_tokens).unwrap_or(i64::MAX);
        let output_tokens = i64::try_from(increment.output_tokens).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO usage_org_daily
             (org_id, usage_date, provider, model, feature, request_count, input_tokens, output_tokens, cost_usd)
             VALUES ($1, $2, $3, $4, $5, 1, $6, $7, $8)
             ON CONFLICT (org_id, usage_date, provider, model, feature)
             DO UPDATE SET request_count = usage_org_daily.request_count + 1,
                           input_tokens = usage_org_daily.input_tokens + EXCLUDED.input_tokens,
                           output_tokens = usage_org_daily.output_tokens + EXCLUDED.output_tokens,
                           cost_usd = usage_org_daily.cost_usd + EXCLUDED.cost_usd",
        )
        .bind(&increment.org_id)
        .bind(increment.date)
        .bind(&increment.provider)
        .bind(&increment.model)
        .bind(&increment.feature)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(increment.cost_usd)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO usage_org_user_daily
             (org_id, user_id, usage_date, provider, model, feature, request_count, input_tokens, output_tokens, cost_usd)
             VALUES ($1, $2, $3, $4, $5, $6, 1, $7, $8, $9)
             ON CONFLICT (org_id, user_id, usage_date, provider, model, feature)
             DO UPDATE SET request_count = usage_org_user_daily.request_count + 1,
                           input_tokens = usage_org_user_daily.input_tokens + EXCLUDED.input_tokens,
                           output_tokens = usage_org_user_daily.output_tokens + EXCLUDED.output_tokens,
                           cost_usd = usage_org_user_daily.cost_usd + EXCLUDED.cost_usd",
        )
        .bind(&increment.org_id)
        .bind(&increment.user_id)
        .bind(increment.date)
        .bind(&increment.provider)
        .bind(&increment.model)
        .bind(&increment.feature)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(increment.cost_usd)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_usage_aggregates(&self, org_id: &str) -> anyhow::Result<Vec<UsageAggregate>> {
        let rows = sqlx::query_as::<
            _,
            (
                String,
                Option<String>,
                NaiveDate,
                String,
                String,
                String,
                i64,
                i64,
                i64,
                f64,
            ),
        >(
            "SELECT org_id, NULL::text AS user_id, usage_date, provider, model, feature,
                    request_count, input_tokens, output_tokens, cost_usd
             FROM usage_org_daily
             WHERE org_id = $1
             UNION ALL
             SELECT org_id, user_id, usage_date, provider, model, feature,
                    request_count, input_tokens, output_tokens, cost_usd
             FROM usage_org_user_daily
             WHERE org_id = $1
             ORDER BY usage_date, user_id NULLS FIRST, model",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    org_id,
                    user_id,
                    date,
                    provider,
                    model,
                    feature,
                    request_count,
                    input_tokens,
                    output_tokens,
                    cost_usd,
                )| UsageAggregate {
                    org_id,
                    user_id,
                    date,
                    provider,
                    model,
                    feature,
                    request_count: request_count.max(0) as u64,
                    input_tokens: input_tokens.max(0) as u64,
                    output_tokens: output_tokens.max(0) as u64,
                    cost_usd,
                },
            )
            .collect())
    }
}

fn conversation_from_row(row: &PgRow) -> anyhow::Result<Conversation> {
    let max_tokens: Option<i32> = row.try_get("max_tokens")?;
    let settings: Json<ConversationSettings> = row.try_get("settings")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        owner_user_id: row.try_get("owner_user_id")?,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        system_prompt: row.try_get("system_prompt")?,
        temperature: row.try_get("temperature")?,
        top_p: row.try_get("top_p")?,
        max_tokens: max_tokens.and_then(|value| u32::try_from(value).ok()),
        profile_id: row.try_get("profile_id")?,
        preset_id: row.try_get("preset_id")?,
        settings: settings.0,
        last_activity_at: row.try_get("last_activity_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &PgRow) -> anyhow::Result<MessageRecord> {
    let role: String = row.try_get("role")?;
    let metadata: Json<Value> = row.try_get("metadata")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        user_id: row.try_get("user_id")?,
        role: MessageRole::parse(&role)
            .with_context(|| format!("unknown message role `{role}`"))?,
        content: row.try_get("content")?,
        metadata: metadata.0,
        created_at: row.try_get("created_at")?,
    })
}

fn incident_from_row(row: &PgRow) -> anyhow::Result<ModerationIncident> {
    let source: String = row.try_get("source")?;
    let action: String = row.try_get("action")?;
    let top_category: String = row.try_get("top_category")?;
    let scores: Json<BTreeMap<ModerationCategory, f32>> = row.try_get("scores")?;
    Ok(ModerationIncident {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        conversation_id: row.try_get("conversation_id")?,
        user_id: row.try_get("user_id")?,
        source: ModerationSource::parse(&source)
            .with_context(|| format!("unknown moderation source `{source}`"))?,
        scores: scores.0,
        action: ModerationAction::parse(&action)
            .with_context(|| format!("unknown moderation action `{action}`"))?,
        top_category: ModerationCategory::parse(&top_category)
            .with_context(|| format!("unknown moderation category `{top_category}`"))?,
        snippet: row.try_get("snippet")?,
        is_severe: row.try_get("is_severe")?,
        created_at: row.try_get("created_at")?,
    })
}

fn delivery_from_row(row: &PgRow) -> anyhow::Result<WebhookDelivery> {
    let status: String = row.try_get("status")?;
    let status_code: Option<i32> = row.try_get("status_code")?;
    let latency_ms: Option<i64> = row.try_get("latency_ms")?;
    Ok(WebhookDelivery {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        subscription_id: row.try_get("subscription_id")?,
        status: DeliveryStatus::parse(&status)
            .with_context(|| format!("unknown delivery status `{status}`"))?,
        status_code: status_code.and_then(|code| u16::try_from(code).ok()),
        latency_ms: latency_ms.and_then(|latency| u64::try_from(latency).ok()),
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        claimed_at: row.try_get("claimed_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
