use crate::traits::Storage;
use burrowmq_core::{
    valid_queue_name, Attributes, FilterCriteria, Message, MessageId, QueueConfig, QueueError,
    QueueStats, Result, TenantId, MAX_BODY_BYTES, MAX_DELAY_SECONDS, MAX_RECEIVE_BATCH,
    MAX_VISIBILITY_SECONDS, MAX_WAIT_SECONDS,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Instant;

const POLL_TICK_MS: u64 = 100;

/// Policy layer in front of the store: validates parameters, applies queue
/// defaults, computes visibility windows and runs the bounded long-poll
/// loop. Every caller, wire API and dashboard alike, goes through here.
#[derive(Clone)]
pub struct QueueEngine {
    store: Arc<dyn Storage>,
}

impl QueueEngine {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }

    pub async fn create_queue(
        &self,
        tenant: TenantId,
        name: &str,
        visibility_timeout: Option<u32>,
        delay_seconds: Option<u32>,
    ) -> Result<QueueConfig> {
        if !valid_queue_name(name) {
            return Err(QueueError::InvalidParameter(format!(
                "queue name {name:?} must match [A-Za-z0-9_-]{{1,80}}"
            )));
        }
        check_visibility(visibility_timeout)?;
        check_delay(delay_seconds)?;
        let cfg = QueueConfig::new(tenant, name.to_string(), visibility_timeout, delay_seconds);
        self.store.create_queue(cfg.clone()).await?;
        tracing::info!(tenant, queue = name, "queue created");
        Ok(cfg)
    }

    pub async fn delete_queue(&self, tenant: TenantId, queue: &str) -> Result<()> {
        self.store.delete_queue(tenant, queue).await?;
        tracing::info!(tenant, queue, "queue deleted");
        Ok(())
    }

    pub async fn purge_queue(&self, tenant: TenantId, queue: &str) -> Result<u64> {
        self.store.purge_queue(tenant, queue).await
    }

    pub async fn list_queues(&self, tenant: TenantId) -> Result<Vec<String>> {
        self.store.list_queues(tenant).await
    }

    pub async fn get_queue(&self, tenant: TenantId, queue: &str) -> Result<QueueConfig> {
        self.store.get_queue(tenant, queue).await
    }

    pub async fn enqueue(
        &self,
        tenant: TenantId,
        queue: &str,
        body: Vec<u8>,
        attrs: Attributes,
        delay_seconds: Option<u32>,
        visibility_timeout: Option<u32>,
    ) -> Result<MessageId> {
        if body.len() > MAX_BODY_BYTES {
            return Err(QueueError::InvalidParameter(format!(
                "message body exceeds {MAX_BODY_BYTES} bytes"
            )));
        }
        check_delay(delay_seconds)?;
        check_visibility(visibility_timeout)?;
        let cfg = self.store.get_queue(tenant, queue).await?;
        let delay = delay_seconds.unwrap_or(cfg.delay_seconds);
        let visibility = visibility_timeout.unwrap_or(cfg.visibility_timeout);
        let visible_at = Utc::now() + Duration::seconds(delay as i64);
        self.store
            .insert_message(tenant, queue, body, attrs, visible_at, visibility)
            .await
    }

    /// `max_n` outside [1, 10] is clamped rather than rejected; a wait of up
    /// to 20 s turns this into a sleep-poll long poll.
    pub async fn dequeue(
        &self,
        tenant: TenantId,
        queue: &str,
        max_n: Option<u32>,
        visibility_override: Option<u32>,
        wait_seconds: Option<u32>,
    ) -> Result<Vec<Message>> {
        check_visibility(visibility_override)?;
        let max_n = max_n.unwrap_or(1).clamp(1, MAX_RECEIVE_BATCH) as usize;
        let wait = wait_seconds.unwrap_or(0).min(MAX_WAIT_SECONDS);
        let deadline = Instant::now() + std::time::Duration::from_secs(wait as u64);
        loop {
            let msgs = self
                .store
                .claim_visible(tenant, queue, Utc::now(), visibility_override, max_n)
                .await?;
            if !msgs.is_empty() || Instant::now() >= deadline {
                return Ok(msgs);
            }
            tokio::time::sleep(std::time::Duration::from_millis(POLL_TICK_MS)).await;
        }
    }

    /// Duplicate deletes are fine: a receipt whose message is already gone
    /// (expired + deleted, purged) reports success.
    pub async fn delete(&self, tenant: TenantId, queue: &str, id: MessageId) -> Result<()> {
        match self.store.tombstone(tenant, queue, id).await {
            Err(QueueError::MessageNotFound) => Ok(()),
            r => r,
        }
    }

    pub async fn peek(&self, tenant: TenantId, queue: &str, id: MessageId) -> Result<Option<Message>> {
        self.store.peek(tenant, queue, id).await
    }

    pub async fn filter(
        &self,
        tenant: TenantId,
        queue: &str,
        criteria: &FilterCriteria,
    ) -> Result<Vec<MessageId>> {
        self.store.filter(tenant, queue, criteria).await
    }

    pub async fn stats(&self, tenant: TenantId, queue: &str) -> Result<QueueStats> {
        self.store.stats(tenant, queue).await
    }

    pub async fn snapshot(&self) -> Result<(String, u64)> {
        self.store.admin_snapshot().await
    }

    pub async fn manifest(&self) -> Result<serde_json::Value> {
        self.store.admin_manifest().await
    }

    pub async fn trim_wal(&self, snapshot_id: &str) -> Result<Vec<String>> {
        self.store.admin_trim_wal(snapshot_id).await
    }
}

fn check_delay(delay: Option<u32>) -> Result<()> {
    match delay {
        Some(d) if d > MAX_DELAY_SECONDS => Err(QueueError::InvalidParameter(format!(
            "DelaySeconds must be between 0 and {MAX_DELAY_SECONDS}"
        ))),
        _ => Ok(()),
    }
}

fn check_visibility(visibility: Option<u32>) -> Result<()> {
    match visibility {
        Some(v) if v > MAX_VISIBILITY_SECONDS => Err(QueueError::InvalidParameter(format!(
            "VisibilityTimeout must be between 0 and {MAX_VISIBILITY_SECONDS}"
        ))),
        _ => Ok(()),
    }
}
