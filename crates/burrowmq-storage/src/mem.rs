use crate::traits::Storage;
use burrowmq_core::{
    Attributes, FilterCriteria, Message, MessageId, MessageState, QueueConfig, QueueError,
    QueueStats, Result, TenantId, MAX_FILTER_RESULTS,
};
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus::{register_histogram, Histogram};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

static CLAIM_BATCH_SIZE: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "claim_batch_size",
        "Messages leased per claim",
        vec![0.0, 1.0, 2.0, 5.0, 10.0]
    )
    .unwrap()
});

type QueueKey = (TenantId, String);

#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<QueueKey, QueueConfig>,
    // id-ordered so iteration is enqueue-ordered for free
    messages: HashMap<QueueKey, BTreeMap<MessageId, Message>>,
    // survives queue delete/recreate so ids stay strictly increasing
    next_id: HashMap<QueueKey, MessageId>,
}

impl Inner {
    fn queue_key(tenant: TenantId, queue: &str) -> QueueKey {
        (tenant, queue.to_string())
    }

    fn require_queue(&self, tenant: TenantId, queue: &str) -> Result<()> {
        if self.queues.contains_key(&Self::queue_key(tenant, queue)) {
            Ok(())
        } else {
            Err(QueueError::QueueNotFound)
        }
    }

    /// Expired leases go back to Visible before any candidate selection;
    /// there is no background sweeper.
    fn release_expired(&mut self, tenant: TenantId, queue: &str, now: DateTime<Utc>) {
        if let Some(q) = self.messages.get_mut(&Self::queue_key(tenant, queue)) {
            for m in q.values_mut() {
                if m.state == MessageState::Leased && m.visible_at <= now {
                    m.state = MessageState::Visible;
                    m.deliveries += 1;
                }
            }
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    // Replay hooks used by WAL recovery. These bypass validation: the log
    // only contains transitions that were accepted when first applied.

    pub fn replay_create_queue(&self, cfg: QueueConfig) {
        let mut inner = self.inner.write();
        let key = (cfg.tenant_id, cfg.name.clone());
        inner.messages.entry(key.clone()).or_default();
        inner.queues.insert(key, cfg);
    }

    pub fn replay_delete_queue(&self, tenant: TenantId, queue: &str) {
        let mut inner = self.inner.write();
        let key = Inner::queue_key(tenant, queue);
        inner.queues.remove(&key);
        inner.messages.remove(&key);
    }

    pub fn replay_purge_queue(&self, tenant: TenantId, queue: &str) {
        let mut inner = self.inner.write();
        if let Some(q) = inner.messages.get_mut(&Inner::queue_key(tenant, queue)) {
            q.clear();
        }
    }

    pub fn replay_insert(&self, msg: Message) {
        let mut inner = self.inner.write();
        let key = (msg.tenant_id, msg.queue.clone());
        let next = inner.next_id.entry(key.clone()).or_insert(1);
        *next = (*next).max(msg.id + 1);
        inner.messages.entry(key).or_default().insert(msg.id, msg);
    }

    pub fn replay_claim(&self, tenant: TenantId, queue: &str, leases: &[(MessageId, i64)]) {
        let mut inner = self.inner.write();
        if let Some(q) = inner.messages.get_mut(&Inner::queue_key(tenant, queue)) {
            for (id, lease_until) in leases {
                if let Some(m) = q.get_mut(id) {
                    m.state = MessageState::Leased;
                    if let Some(ts) = DateTime::from_timestamp(*lease_until, 0) {
                        m.visible_at = ts;
                    }
                }
            }
        }
    }

    pub fn replay_tombstone(&self, tenant: TenantId, queue: &str, id: MessageId) {
        let mut inner = self.inner.write();
        if let Some(q) = inner.messages.get_mut(&Inner::queue_key(tenant, queue)) {
            if let Some(m) = q.get_mut(&id) {
                m.state = MessageState::Tombstoned;
            }
        }
    }

    pub fn all_queues(&self) -> Vec<QueueConfig> {
        self.inner.read().queues.values().cloned().collect()
    }

    pub fn all_messages(&self) -> Vec<Message> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for q in inner.messages.values() {
            out.extend(q.values().cloned());
        }
        out
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Storage for InMemoryStore {
    async fn create_queue(&self, cfg: QueueConfig) -> Result<()> {
        let mut inner = self.inner.write();
        let key = (cfg.tenant_id, cfg.name.clone());
        if inner.queues.contains_key(&key) {
            return Err(QueueError::QueueAlreadyExists);
        }
        inner.messages.entry(key.clone()).or_default();
        inner.queues.insert(key, cfg);
        Ok(())
    }

    async fn delete_queue(&self, tenant: TenantId, queue: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let key = Inner::queue_key(tenant, queue);
        if inner.queues.remove(&key).is_none() {
            return Err(QueueError::QueueNotFound);
        }
        // in-flight leases die with the queue
        inner.messages.remove(&key);
        Ok(())
    }

    async fn purge_queue(&self, tenant: TenantId, queue: &str) -> Result<u64> {
        let mut inner = self.inner.write();
        inner.require_queue(tenant, queue)?;
        let q = inner
            .messages
            .entry(Inner::queue_key(tenant, queue))
            .or_default();
        let removed = q
            .values()
            .filter(|m| m.state != MessageState::Tombstoned)
            .count() as u64;
        q.clear();
        Ok(removed)
    }

    async fn list_queues(&self, tenant: TenantId) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .queues
            .keys()
            .filter(|(t, _)| *t == tenant)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_queue(&self, tenant: TenantId, queue: &str) -> Result<QueueConfig> {
        self.inner
            .read()
            .queues
            .get(&Inner::queue_key(tenant, queue))
            .cloned()
            .ok_or(QueueError::QueueNotFound)
    }

    async fn insert_message(
        &self,
        tenant: TenantId,
        queue: &str,
        body: Vec<u8>,
        attrs: Attributes,
        visible_at: DateTime<Utc>,
        visibility_timeout: u32,
    ) -> Result<MessageId> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        inner.require_queue(tenant, queue)?;
        let key = Inner::queue_key(tenant, queue);
        let next = inner.next_id.entry(key.clone()).or_insert(1);
        let id = *next;
        *next += 1;
        let state = if visible_at > now {
            MessageState::Delayed
        } else {
            MessageState::Visible
        };
        let msg = Message {
            id,
            tenant_id: tenant,
            queue: queue.to_string(),
            body,
            attributes: attrs,
            state,
            visible_at,
            visibility_timeout,
            enqueued_at: now,
            deliveries: 0,
        };
        inner.messages.entry(key).or_default().insert(id, msg);
        Ok(id)
    }

    async fn claim_visible(
        &self,
        tenant: TenantId,
        queue: &str,
        now: DateTime<Utc>,
        visibility_override: Option<u32>,
        max_n: usize,
    ) -> Result<Vec<Message>> {
        // Single critical section: expiry sweep, candidate selection and the
        // Leased transition all happen under one write lock, so two callers
        // can never walk away with the same message.
        let mut inner = self.inner.write();
        inner.require_queue(tenant, queue)?;
        inner.release_expired(tenant, queue, now);

        let key = Inner::queue_key(tenant, queue);
        let q = inner.messages.entry(key).or_default();
        let mut candidates: Vec<(DateTime<Utc>, MessageId)> = q
            .values()
            .filter(|m| m.is_claimable(now))
            .map(|m| (m.visible_at, m.id))
            .collect();
        candidates.sort();
        candidates.truncate(max_n);

        let mut out = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(m) = q.get_mut(&id) {
                let lease = visibility_override.unwrap_or(m.visibility_timeout);
                m.state = MessageState::Leased;
                m.visible_at = now + Duration::seconds(lease as i64);
                out.push(m.clone());
            }
        }
        CLAIM_BATCH_SIZE.observe(out.len() as f64);
        Ok(out)
    }

    async fn tombstone(&self, tenant: TenantId, queue: &str, id: MessageId) -> Result<()> {
        let mut inner = self.inner.write();
        inner.require_queue(tenant, queue)?;
        let key = Inner::queue_key(tenant, queue);
        let issued = inner.next_id.get(&key).copied().unwrap_or(1);
        if let Some(m) = inner
            .messages
            .get_mut(&key)
            .and_then(|q| q.get_mut(&id))
        {
            m.state = MessageState::Tombstoned;
            return Ok(());
        }
        // purged or compacted rows are already logically deleted
        if id != 0 && id < issued {
            return Ok(());
        }
        Err(QueueError::MessageNotFound)
    }

    async fn peek(&self, tenant: TenantId, queue: &str, id: MessageId) -> Result<Option<Message>> {
        let inner = self.inner.read();
        inner.require_queue(tenant, queue)?;
        Ok(inner
            .messages
            .get(&Inner::queue_key(tenant, queue))
            .and_then(|q| q.get(&id))
            .cloned())
    }

    async fn filter(
        &self,
        tenant: TenantId,
        queue: &str,
        criteria: &FilterCriteria,
    ) -> Result<Vec<MessageId>> {
        let inner = self.inner.read();
        inner.require_queue(tenant, queue)?;
        let mut out = Vec::new();
        if let Some(q) = inner.messages.get(&Inner::queue_key(tenant, queue)) {
            for m in q.values() {
                if m.state == MessageState::Tombstoned {
                    continue;
                }
                if criteria.matches(m) {
                    out.push(m.id);
                    if out.len() >= MAX_FILTER_RESULTS {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    async fn stats(&self, tenant: TenantId, queue: &str) -> Result<QueueStats> {
        let now = Utc::now();
        let inner = self.inner.read();
        inner.require_queue(tenant, queue)?;
        let mut stats = QueueStats::default();
        if let Some(q) = inner.messages.get(&Inner::queue_key(tenant, queue)) {
            for m in q.values() {
                stats.total += 1;
                *stats.counts.entry(m.effective_state(now)).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    async fn admin_snapshot(&self) -> Result<(String, u64)> {
        Err(QueueError::InvalidParameter("not persistent".into()))
    }

    async fn admin_manifest(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({"mode": "memory"}))
    }

    async fn admin_trim_wal(&self, _snapshot_id: &str) -> Result<Vec<String>> {
        Err(QueueError::InvalidParameter("not persistent".into()))
    }
}
