use std::cmp::{Ordering, Reverse};
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

pub use rjms_utils::{timestamp_millis, TimestampMillis};

use crate::topic::Topic;

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

pub type MessageId = ByteString;
pub type ConsumerId = u64;
pub type ConnectionId = u64;
pub type SubscriptionName = ByteString;
pub type Priority = u8;
pub type SequenceNumber = u64;
pub type Properties = HashMap<ByteString, PropertyValue>;

pub const DEFAULT_PRIORITY: Priority = 4;
pub const MAX_PRIORITY: Priority = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Queue => f.write_str("queue"),
            DestinationKind::Topic => f.write_str("topic"),
        }
    }
}

/// A named queue or topic. Identity is (kind, name).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Destination {
    pub kind: DestinationKind,
    pub name: ByteString,
    /// Administered destinations are written to the store and survive restarts.
    #[serde(default)]
    pub persistent: bool,
    /// Owning connection of a temporary destination.
    #[serde(default)]
    pub owner: Option<ConnectionId>,
}

impl Destination {
    #[inline]
    pub fn new<N: Into<ByteString>>(kind: DestinationKind, name: N) -> Self {
        Self { kind, name: name.into(), persistent: false, owner: None }
    }

    #[inline]
    pub fn queue<N: Into<ByteString>>(name: N) -> Self {
        Self::new(DestinationKind::Queue, name)
    }

    #[inline]
    pub fn topic<N: Into<ByteString>>(name: N) -> Self {
        Self::new(DestinationKind::Topic, name)
    }

    #[inline]
    pub fn temporary<N: Into<ByteString>>(kind: DestinationKind, name: N, owner: ConnectionId) -> Self {
        Self { kind, name: name.into(), persistent: false, owner: Some(owner) }
    }

    #[inline]
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    #[inline]
    pub fn is_queue(&self) -> bool {
        self.kind == DestinationKind::Queue
    }

    #[inline]
    pub fn is_topic(&self) -> bool {
        self.kind == DestinationKind::Topic
    }

    #[inline]
    pub fn is_temporary(&self) -> bool {
        self.owner.is_some()
    }

    /// Topic patterns such as `a.*` or `a.**`.
    #[inline]
    pub fn is_wildcard(&self) -> bool {
        self.is_topic() && self.name.contains('*')
    }

    /// Whether a consumer on `self` receives what is published to `other`.
    pub fn matches(&self, other: &Destination) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if !self.is_wildcard() {
            return self.name == other.name;
        }
        self.name.parse::<Topic>().map(|t| t.matches_str(&*other.name)).unwrap_or(false)
    }
}

impl PartialEq for Destination {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name
    }
}

impl Eq for Destination {}

impl Hash for Destination {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(ByteString),
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(ByteString::from(v))
    }
}

/// A message as accepted by the broker.
///
/// Once handed to [`crate::message_mgr::MessageMgr::add`] it is wrapped in an
/// `Arc` and never mutated again.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub destination: Destination,
    pub priority: Priority,
    /// Time the broker accepted the message.
    pub timestamp: TimestampMillis,
    /// Absolute expiry time, 0 means never.
    pub expiration: TimestampMillis,
    pub sequence: SequenceNumber,
    pub persistent: bool,
    pub connection_id: Option<ConnectionId>,
    #[serde(default)]
    pub properties: Properties,
    pub payload: Bytes,
}

impl Message {
    pub fn new<P: Into<Bytes>>(destination: Destination, payload: P) -> Self {
        Self {
            id: ByteString::default(),
            destination,
            priority: DEFAULT_PRIORITY,
            timestamp: 0,
            expiration: 0,
            sequence: 0,
            persistent: false,
            connection_id: None,
            properties: Properties::default(),
            payload: payload.into(),
        }
    }

    #[inline]
    pub fn with_id<I: Into<MessageId>>(mut self, id: I) -> Self {
        self.id = id.into();
        self
    }

    #[inline]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    #[inline]
    pub fn with_expiration(mut self, expiration: TimestampMillis) -> Self {
        self.expiration = expiration;
        self
    }

    #[inline]
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    #[inline]
    pub fn with_connection(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    #[inline]
    pub fn with_property<K: Into<ByteString>, V: Into<PropertyValue>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        self.expiration > 0 && self.expiration <= now
    }

    #[inline]
    pub fn order_key(&self) -> OrderKey {
        OrderKey::new(self.priority, self.timestamp, self.sequence, self.id.clone())
    }
}

/// Delivery order: priority descending, then accepted time, then sequence.
///
/// The message id is a final tie-breaker so that distinct messages never
/// compare equal inside ordered maps.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderKey {
    pub priority: Reverse<Priority>,
    pub timestamp: TimestampMillis,
    pub sequence: SequenceNumber,
    pub id: MessageId,
}

impl OrderKey {
    #[inline]
    pub fn new(
        priority: Priority,
        timestamp: TimestampMillis,
        sequence: SequenceNumber,
        id: MessageId,
    ) -> Self {
        Self { priority: Reverse(priority), timestamp, sequence, id }
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.timestamp.cmp(&other.timestamp))
            .then(self.sequence.cmp(&other.sequence))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
