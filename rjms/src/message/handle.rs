use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::message::MessageRef;
use crate::store::{MessageHandleRecord, MessageStore};
use crate::types::{
    ConnectionId, ConsumerId, Destination, Message, MessageId, OrderKey, Priority, SequenceNumber,
    SubscriptionName, TimestampMillis,
};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleKind {
    /// In memory only.
    Transient,
    /// Mirrored to the store.
    Persistent,
    /// Template passed to each subscriber during fan-out; holds no reference.
    Shared,
}

/// Where a released handle goes back to.
pub trait HandleOwner: Sync + Send {
    fn return_message_handle(&self, handle: MessageHandle) -> Result<()>;
}

/// A per-queue or per-consumer view of one message.
///
/// Every non-shared handle holds one reference on its [`MessageRef`]; it is
/// given back by [`MessageHandle::destroy`]. Handles compare equal when they
/// refer to the same message.
pub struct MessageHandle {
    msg_ref: Arc<MessageRef>,
    key: OrderKey,
    expiration: TimestampMillis,
    destination: Destination,
    delivered: bool,
    consumer_id: Option<ConsumerId>,
    connection_id: Option<ConnectionId>,
    consumer_persistent_id: Option<SubscriptionName>,
    kind: HandleKind,
    store: Option<Arc<dyn MessageStore>>,
    owner: Option<Weak<dyn HandleOwner>>,
}

impl MessageHandle {
    #[inline]
    fn build(msg_ref: Arc<MessageRef>, message: &Message, kind: HandleKind) -> Self {
        Self {
            key: message.order_key(),
            expiration: message.expiration,
            destination: message.destination.clone(),
            delivered: false,
            consumer_id: None,
            connection_id: message.connection_id,
            consumer_persistent_id: None,
            kind,
            store: None,
            owner: None,
            msg_ref,
        }
    }

    pub fn transient(msg_ref: Arc<MessageRef>, message: &Message) -> Result<Self> {
        msg_ref.reference()?;
        Ok(Self::build(msg_ref, message, HandleKind::Transient))
    }

    /// `consumer` is the durable subscription name, or `None` for a queue
    /// backlog handle, which is stored under the queue name.
    pub fn persistent(
        msg_ref: Arc<MessageRef>,
        message: &Message,
        consumer: Option<SubscriptionName>,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        msg_ref.reference()?;
        let mut h = Self::build(msg_ref, message, HandleKind::Persistent);
        h.consumer_persistent_id = consumer;
        h.store = Some(store);
        Ok(h)
    }

    #[inline]
    pub fn shared(msg_ref: Arc<MessageRef>, message: &Message) -> Self {
        Self::build(msg_ref, message, HandleKind::Shared)
    }

    /// Rebuilds a persistent handle from its stored record.
    pub fn from_record(
        msg_ref: Arc<MessageRef>,
        record: &MessageHandleRecord,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        msg_ref.reference()?;
        let consumer_persistent_id = if record.destination.is_topic() { Some(record.consumer.clone()) } else { None };
        Ok(Self {
            key: OrderKey::new(record.priority, record.timestamp, record.sequence, record.message_id.clone()),
            expiration: record.expiration,
            destination: record.destination.clone(),
            delivered: record.delivered,
            consumer_id: None,
            connection_id: None,
            consumer_persistent_id,
            kind: HandleKind::Persistent,
            store: Some(store),
            owner: None,
            msg_ref,
        })
    }

    /// A new transient handle on the same message with fresh delivery state.
    pub fn duplicate(&self) -> Result<Self> {
        self.msg_ref.reference()?;
        Ok(Self {
            key: self.key.clone(),
            expiration: self.expiration,
            destination: self.destination.clone(),
            delivered: false,
            consumer_id: None,
            connection_id: self.connection_id,
            consumer_persistent_id: None,
            kind: HandleKind::Transient,
            store: None,
            owner: None,
            msg_ref: self.msg_ref.clone(),
        })
    }

    /// Specializes a shared handle for one consumer.
    pub fn specialize(
        &self,
        consumer_id: ConsumerId,
        persistent_id: Option<SubscriptionName>,
        store: Option<Arc<dyn MessageStore>>,
    ) -> Result<Self> {
        let mut h = self.duplicate()?;
        h.consumer_id = Some(consumer_id);
        h.consumer_persistent_id = persistent_id;
        if store.is_some() {
            h.kind = HandleKind::Persistent;
            h.store = store;
        }
        Ok(h)
    }

    #[inline]
    pub fn with_owner(mut self, owner: Weak<dyn HandleOwner>) -> Self {
        self.owner = Some(owner);
        self
    }

    #[inline]
    pub fn set_owner(&mut self, owner: Weak<dyn HandleOwner>) {
        self.owner = Some(owner);
    }

    /// Durable handles are filed under the subscription's topic, which may
    /// be a pattern rather than the topic the message was published to.
    #[inline]
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    #[inline]
    pub fn id(&self) -> &MessageId {
        &self.key.id
    }

    #[inline]
    pub fn key(&self) -> OrderKey {
        self.key.clone()
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.key.priority.0
    }

    #[inline]
    pub fn timestamp(&self) -> TimestampMillis {
        self.key.timestamp
    }

    #[inline]
    pub fn sequence(&self) -> SequenceNumber {
        self.key.sequence
    }

    #[inline]
    pub fn expiration(&self) -> TimestampMillis {
        self.expiration
    }

    #[inline]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    #[inline]
    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    #[inline]
    pub fn set_delivered(&mut self, delivered: bool) {
        self.delivered = delivered;
    }

    #[inline]
    pub fn consumer_id(&self) -> Option<ConsumerId> {
        self.consumer_id
    }

    #[inline]
    pub fn set_consumer_id(&mut self, consumer_id: Option<ConsumerId>) {
        self.consumer_id = consumer_id;
    }

    #[inline]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    #[inline]
    pub fn consumer_persistent_id(&self) -> Option<&SubscriptionName> {
        self.consumer_persistent_id.as_ref()
    }

    #[inline]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.kind == HandleKind::Persistent
    }

    #[inline]
    pub fn message_ref(&self) -> &Arc<MessageRef> {
        &self.msg_ref
    }

    #[inline]
    pub fn message(&self) -> Result<Option<Arc<Message>>> {
        self.msg_ref.message()
    }

    pub fn to_record(&self) -> MessageHandleRecord {
        let consumer = self.consumer_persistent_id.clone().unwrap_or_else(|| self.destination.name.clone());
        MessageHandleRecord {
            message_id: self.key.id.clone(),
            destination: self.destination.clone(),
            consumer,
            priority: self.priority(),
            timestamp: self.timestamp(),
            sequence: self.sequence(),
            expiration: self.expiration,
            delivered: self.delivered,
        }
    }

    /// Writes a persistent handle to the store.
    #[inline]
    pub fn add(&self) -> Result<()> {
        match (self.kind, self.store.as_ref()) {
            (HandleKind::Persistent, Some(store)) => store.add_message_handle(&self.to_record()),
            _ => Ok(()),
        }
    }

    #[inline]
    pub fn update(&self) -> Result<()> {
        match (self.kind, self.store.as_ref()) {
            (HandleKind::Persistent, Some(store)) => store.update_message_handle(&self.to_record()),
            _ => Ok(()),
        }
    }

    /// Removes the handle, from the store too if persistent, and gives back its reference.
    ///
    /// The reference is given back even if the store removal fails; the
    /// store error is returned first.
    pub fn destroy(self) -> Result<()> {
        let removed = match (self.kind, self.store.as_ref()) {
            (HandleKind::Persistent, Some(store)) => store.remove_message_handle(&self.to_record()),
            _ => Ok(()),
        };
        let released = match self.kind {
            HandleKind::Shared => Ok(()),
            _ => self.msg_ref.dereference(),
        };
        removed.and(released)
    }

    /// Hands an unacknowledged handle back to its owner for redelivery.
    ///
    /// Without a live owner the handle is destroyed.
    pub fn release(mut self) -> Result<()> {
        self.delivered = true;
        self.consumer_id = None;
        self.update()?;
        match self.owner.as_ref().and_then(|o| o.upgrade()) {
            Some(owner) => owner.return_message_handle(self),
            None => self.destroy(),
        }
    }
}

impl PartialEq for MessageHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key.id == other.key.id
    }
}

impl fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandle")
            .field("id", &self.key.id)
            .field("priority", &self.priority())
            .field("timestamp", &self.timestamp())
            .field("sequence", &self.sequence())
            .field("destination", &self.destination.to_string())
            .field("delivered", &self.delivered)
            .field("consumer_id", &self.consumer_id)
            .field("consumer_persistent_id", &self.consumer_persistent_id)
            .field("kind", &self.kind)
            .finish()
    }
}
