mod signing;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use futures_util::future::join_all;
use reqwest::{Client, header::CONTENT_TYPE};
use serde_json::Value;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    store::ChatStore,
    types::{
        ClaimedDelivery, DeliveryOutcome, DeliveryStatus, WebhookDelivery, WebhookEvent,
    },
};

pub use signing::{
    EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER, sign_payload, verify_signature,
};

pub const EVENT_MESSAGE_SENT: &str = "message_sent";
pub const EVENT_TURN_COMPLETED: &str = "chat.turn.completed";
pub const EVENT_TOOL_ERROR: &str = "tool.exec.error";
pub const EVENT_MODERATION_FLAGGED: &str = "moderation.flagged";

const ABANDONED_DELIVERY_ERROR: &str = "delivery attempt abandoned before completion";

/// Event-type filter check. An empty filter or `*` matches everything;
/// otherwise an entry matches exactly or as a dot-separated prefix.
pub fn event_matches(filter: &[String], event_type: &str) -> bool {
    if filter.is_empty() {
        return true;
    }

    filter.iter().any(|entry| {
        let entry = entry.trim();
        if entry == "*" || entry == event_type {
            return true;
        }
        let prefix = entry.trim_end_matches('.');
        !prefix.is_empty()
            && event_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    pub event: WebhookEvent,
    pub deliveries: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DrainReport {
    pub expired: usize,
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Records events with their pending deliveries and drains them to
/// subscribers with signed requests.
pub struct WebhookDispatcher {
    store: Arc<dyn ChatStore>,
    client: Client,
    batch_size: usize,
    claim_lease: chrono::Duration,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn ChatStore>, batch_size: usize, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        // An attempt ends within one request timeout, so a claim twice that old was lost.
        let claim_lease = chrono::Duration::from_std(timeout.saturating_mul(2))?;
        Ok(Self {
            store,
            client,
            batch_size: batch_size.max(1),
            claim_lease,
        })
    }

    /// Writes the event and one pending delivery per matching active
    /// subscription. Nothing is sent here.
    pub async fn emit_event(
        &self,
        event_type: &str,
        org_id: &str,
        conversation_id: Option<&str>,
        message_id: Option<&str>,
        metadata: Value,
    ) -> anyhow::Result<EmittedEvent> {
        let subscriptions = self.store.list_active_subscriptions(org_id).await?;
        let now = Utc::now();

        let event = WebhookEvent {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_owned(),
            org_id: org_id.to_owned(),
            conversation_id: conversation_id.map(str::to_owned),
            message_id: message_id.map(str::to_owned),
            metadata,
            created_at: now,
        };

        let deliveries = subscriptions
            .iter()
            .filter(|subscription| subscription.active)
            .filter(|subscription| event_matches(&subscription.event_types, event_type))
            .map(|subscription| WebhookDelivery {
                id: Uuid::new_v4().to_string(),
                event_id: event.id.clone(),
                subscription_id: subscription.id.clone(),
                status: DeliveryStatus::Pending,
                status_code: None,
                latency_ms: None,
                error: None,
                created_at: now,
                claimed_at: None,
                completed_at: None,
            })
            .collect::<Vec<_>>();

        self.store
            .insert_event_with_deliveries(&event, &deliveries)
            .await?;

        debug!(
            event_id = %event.id,
            event_type = %event_type,
            org_id = %org_id,
            deliveries = deliveries.len(),
            "webhook event recorded"
        );

        Ok(EmittedEvent {
            event,
            deliveries: deliveries.len(),
        })
    }

    /// One drain cycle: fail claims whose attempt never recorded an
    /// outcome, then claim a batch of pending deliveries, attempt each and
    /// record the terminal status.
    pub async fn drain_once(&self) -> anyhow::Result<DrainReport> {
        let expired = self
            .store
            .expire_stale_deliveries(Utc::now() - self.claim_lease, ABANDONED_DELIVERY_ERROR)
            .await?;
        if expired > 0 {
            warn!(
                expired,
                lease_ms = self.claim_lease.num_milliseconds(),
                "expired webhook deliveries left in flight past their lease"
            );
        }

        let claimed = self.store.claim_pending_deliveries(self.batch_size).await?;
        if claimed.is_empty() {
            return Ok(DrainReport {
                expired,
                ..DrainReport::default()
            });
        }

        let outcomes = join_all(claimed.iter().map(|delivery| self.deliver(delivery))).await;

        let mut report = DrainReport {
            expired,
            claimed: claimed.len(),
            ..DrainReport::default()
        };
        for (delivery, outcome) in claimed.iter().zip(outcomes) {
            match outcome.status {
                DeliveryStatus::Success => report.succeeded += 1,
                _ => {
                    report.failed += 1;
                    warn!(
                        delivery_id = %delivery.delivery_id,
                        subscription_id = %delivery.subscription.id,
                        event_type = %delivery.event.event_type,
                        status_code = ?outcome.status_code,
                        error = outcome.error.as_deref().unwrap_or("-"),
                        "webhook delivery failed"
                    );
                }
            }

            if let Err(error) = self
                .store
                .complete_delivery(&delivery.delivery_id, outcome)
                .await
            {
                warn!(
                    delivery_id = %delivery.delivery_id,
                    ?error,
                    "failed to record webhook delivery outcome"
                );
            }
        }

        info!(
            expired = report.expired,
            claimed = report.claimed,
            succeeded = report.succeeded,
            failed = report.failed,
            "webhook drain cycle finished"
        );
        Ok(report)
    }

    async fn deliver(&self, delivery: &ClaimedDelivery) -> DeliveryOutcome {
        let started_at = Instant::now();
        let failed = |error: String, status_code: Option<u16>| DeliveryOutcome {
            status: DeliveryStatus::Failed,
            status_code,
            latency_ms: started_at.elapsed().as_millis() as u64,
            error: Some(error),
        };

        let body = match serde_json::to_string(&delivery.event) {
            Ok(body) => body,
            Err(error) => return failed(format!("failed to encode event: {error}"), None),
        };
        let timestamp = Utc::now().timestamp();
        let signature = match sign_payload(&delivery.subscription.secret, timestamp, &body) {
            Ok(signature) => signature,
            Err(error) => return failed(format!("{error:#}"), None),
        };

        let response = self
            .client
            .post(&delivery.subscription.url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(EVENT_HEADER, &delivery.event.event_type)
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => DeliveryOutcome {
                status: DeliveryStatus::Success,
                status_code: Some(response.status().as_u16()),
                latency_ms: started_at.elapsed().as_millis() as u64,
                error: None,
            },
            Ok(response) => {
                let status = response.status();
                failed(format!("HTTP {}", status.as_u16()), Some(status.as_u16()))
            }
            Err(error) => failed(error.to_string(), None),
        }
    }

    /// Runs [`Self::drain_once`] on a fixed interval until the task is aborted.
    pub fn spawn_drain_worker(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "webhook drain worker started");

            loop {
                ticker.tick().await;
                if let Err(error) = self.drain_once().await {
                    warn!(?error, "webhook drain cycle failed");
                }
            }
        })
    }
}
