use base64::{engine::general_purpose::STANDARD as b64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

pub type TenantId = u64;
pub type MessageId = u64; // monotonic per (tenant, queue); doubles as the receipt handle

pub const MAX_BODY_BYTES: usize = 256 * 1024;
pub const MAX_DELAY_SECONDS: u32 = 900;
pub const MAX_VISIBILITY_SECONDS: u32 = 43_200;
pub const MAX_RECEIVE_BATCH: u32 = 10;
pub const MAX_WAIT_SECONDS: u32 = 20;
pub const MAX_FILTER_RESULTS: usize = 1000;
pub const DEFAULT_VISIBILITY_SECONDS: u32 = 30;
pub const MAX_QUEUE_NAME_LEN: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    String(String),
    Number(String),
    Binary(Vec<u8>),
}

impl AttrValue {
    pub fn data_type(&self) -> &'static str {
        match self {
            AttrValue::String(_) => "String",
            AttrValue::Number(_) => "Number",
            AttrValue::Binary(_) => "Binary",
        }
    }

    /// Transport discriminant used by the attribute digest: 1 for textual
    /// values, 2 for binary.
    pub fn transport_byte(&self) -> u8 {
        match self {
            AttrValue::String(_) | AttrValue::Number(_) => 1,
            AttrValue::Binary(_) => 2,
        }
    }

    pub fn raw_bytes(&self) -> &[u8] {
        match self {
            AttrValue::String(s) | AttrValue::Number(s) => s.as_bytes(),
            AttrValue::Binary(b) => b.as_slice(),
        }
    }

    /// String form used for attribute equality filters; binary values
    /// compare against their base64 encoding.
    pub fn filter_repr(&self) -> Cow<'_, str> {
        match self {
            AttrValue::String(s) | AttrValue::Number(s) => Cow::Borrowed(s),
            AttrValue::Binary(b) => Cow::Owned(b64.encode(b)),
        }
    }
}

/// Ordered attribute map. Lexicographic key order is load-bearing: the wire
/// digest walks attributes in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(pub BTreeMap<String, AttrValue>);

impl Attributes {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageState {
    Delayed,
    Visible,
    Leased,
    Tombstoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub queue: String,
    pub body: Vec<u8>,
    #[serde(default)]
    pub attributes: Attributes,
    pub state: MessageState,
    /// When the message becomes deliverable (Delayed) or re-deliverable
    /// (Leased).
    pub visible_at: DateTime<Utc>,
    /// Lease length applied at claim time unless the receive overrides it.
    pub visibility_timeout: u32,
    pub enqueued_at: DateTime<Utc>,
    pub deliveries: u32,
}

impl Message {
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, MessageState::Visible | MessageState::Delayed) && self.visible_at <= now
    }

    /// State as an observer should see it: an elapsed delay counts as
    /// Visible even before a claim pass flips it.
    pub fn effective_state(&self, now: DateTime<Utc>) -> MessageState {
        match self.state {
            MessageState::Delayed | MessageState::Leased if self.visible_at <= now => {
                MessageState::Visible
            }
            s => s,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub tenant_id: TenantId,
    pub name: String,
    pub visibility_timeout: u32,
    pub delay_seconds: u32,
    pub created_at: DateTime<Utc>,
}

impl QueueConfig {
    pub fn new(
        tenant_id: TenantId,
        name: String,
        visibility_timeout: Option<u32>,
        delay_seconds: Option<u32>,
    ) -> Self {
        Self {
            tenant_id,
            name,
            visibility_timeout: visibility_timeout.unwrap_or(DEFAULT_VISIBILITY_SECONDS),
            delay_seconds: delay_seconds.unwrap_or(0),
            created_at: Utc::now(),
        }
    }
}

pub fn valid_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub counts: BTreeMap<MessageState, u64>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterCriteria {
    /// All pairs must match; values compare against `AttrValue::filter_repr`.
    pub attributes: BTreeMap<String, String>,
    /// 0 means "any id".
    pub message_id: MessageId,
}

impl FilterCriteria {
    pub fn matches(&self, msg: &Message) -> bool {
        if self.message_id != 0 && msg.id != self.message_id {
            return false;
        }
        self.attributes.iter().all(|(k, v)| {
            msg.attributes
                .0
                .get(k)
                .map(|a| a.filter_repr() == v.as_str())
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_charset() {
        assert!(valid_queue_name("orders_2024-v1"));
        assert!(!valid_queue_name(""));
        assert!(!valid_queue_name("has space"));
        assert!(!valid_queue_name("dot.dot"));
        assert!(!valid_queue_name(&"x".repeat(81)));
        assert!(valid_queue_name(&"x".repeat(80)));
    }

    #[test]
    fn filter_matches_attributes_and_id() {
        let mut attrs = Attributes::default();
        attrs
            .0
            .insert("kind".into(), AttrValue::String("audit".into()));
        attrs.0.insert("n".into(), AttrValue::Number("42".into()));
        let msg = Message {
            id: 7,
            tenant_id: 1,
            queue: "q".into(),
            body: b"x".to_vec(),
            attributes: attrs,
            state: MessageState::Visible,
            visible_at: Utc::now(),
            visibility_timeout: 30,
            enqueued_at: Utc::now(),
            deliveries: 0,
        };

        let mut crit = FilterCriteria::default();
        crit.attributes.insert("kind".into(), "audit".into());
        crit.attributes.insert("n".into(), "42".into());
        assert!(crit.matches(&msg));

        crit.message_id = 7;
        assert!(crit.matches(&msg));
        crit.message_id = 8;
        assert!(!crit.matches(&msg));

        crit.message_id = 0;
        crit.attributes.insert("kind".into(), "other".into());
        assert!(!crit.matches(&msg));
    }

    #[test]
    fn binary_attribute_filters_as_base64() {
        let v = AttrValue::Binary(vec![1, 2, 3]);
        assert_eq!(v.filter_repr(), "AQID");
        assert_eq!(v.transport_byte(), 2);
        assert_eq!(AttrValue::Number("1".into()).transport_byte(), 1);
    }
}
