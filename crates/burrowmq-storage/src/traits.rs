use burrowmq_core::{
    Attributes, FilterCriteria, Message, MessageId, QueueConfig, QueueStats, Result, TenantId,
};
use chrono::{DateTime, Utc};

/// Durable queue store. The engine is the only caller; every method is safe
/// under concurrent use and every mutation is durable before it returns on
/// persistent implementations.
#[async_trait::async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn create_queue(&self, cfg: QueueConfig) -> Result<()>;
    async fn delete_queue(&self, tenant: TenantId, queue: &str) -> Result<()>;
    /// Best effort: removes the messages present at call time and returns
    /// how many; sends racing the purge may survive.
    async fn purge_queue(&self, tenant: TenantId, queue: &str) -> Result<u64>;
    async fn list_queues(&self, tenant: TenantId) -> Result<Vec<String>>;
    async fn get_queue(&self, tenant: TenantId, queue: &str) -> Result<QueueConfig>;

    async fn insert_message(
        &self,
        tenant: TenantId,
        queue: &str,
        body: Vec<u8>,
        attrs: Attributes,
        visible_at: DateTime<Utc>,
        visibility_timeout: u32,
    ) -> Result<MessageId>;

    /// Atomically leases up to `max_n` claimable messages in
    /// (visible_at, id) order. Expired leases are returned to Visible (with
    /// `deliveries` bumped) in the same critical section. Concurrent callers
    /// never receive the same message.
    async fn claim_visible(
        &self,
        tenant: TenantId,
        queue: &str,
        now: DateTime<Utc>,
        visibility_override: Option<u32>,
        max_n: usize,
    ) -> Result<Vec<Message>>;

    /// Idempotent; `MessageNotFound` only for ids the queue never issued.
    async fn tombstone(&self, tenant: TenantId, queue: &str, id: MessageId) -> Result<()>;

    async fn peek(&self, tenant: TenantId, queue: &str, id: MessageId) -> Result<Option<Message>>;
    async fn filter(
        &self,
        tenant: TenantId,
        queue: &str,
        criteria: &FilterCriteria,
    ) -> Result<Vec<MessageId>>;
    async fn stats(&self, tenant: TenantId, queue: &str) -> Result<QueueStats>;

    // Ops surface; memory-only stores answer "not persistent".
    async fn admin_snapshot(&self) -> Result<(String, u64)>;
    async fn admin_manifest(&self) -> Result<serde_json::Value>;
    async fn admin_trim_wal(&self, snapshot_id: &str) -> Result<Vec<String>>;
}
