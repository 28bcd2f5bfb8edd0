//! Persistence boundary
//!
//! [`MessageStore`] is everything the engine needs from a durable backend:
//! transaction brackets, message and handle CRUD, administered destinations
//! and durable subscriptions. [`DefaultMessageStore`] keeps all of it in
//! memory, encoding messages with serde_json the way an on-disk backend
//! would serialize them.
//!
//! Callers wrap store work in [`transact`], which commits on success and
//! rolls back on failure before returning.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::types::{
    DashMap, Destination, Message, MessageId, Priority, SequenceNumber, SubscriptionName, TimestampMillis,
};
use crate::{BrokerError, Result};

/// Stored form of a persistent message handle.
///
/// `consumer` is the durable subscription name, or the queue name for queue
/// backlog handles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageHandleRecord {
    pub message_id: MessageId,
    pub destination: Destination,
    pub consumer: ByteString,
    pub priority: Priority,
    pub timestamp: TimestampMillis,
    pub sequence: SequenceNumber,
    pub expiration: TimestampMillis,
    pub delivered: bool,
}

impl MessageHandleRecord {
    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        self.expiration > 0 && self.expiration <= now
    }
}

pub trait MessageStore: Sync + Send {
    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn add_message(&self, message: &Message) -> Result<()>;

    fn get_message(&self, id: &MessageId) -> Result<Option<Message>>;

    fn remove_message(&self, id: &MessageId) -> Result<()>;

    fn add_message_handle(&self, handle: &MessageHandleRecord) -> Result<()>;

    fn update_message_handle(&self, handle: &MessageHandleRecord) -> Result<()>;

    fn remove_message_handle(&self, handle: &MessageHandleRecord) -> Result<()>;

    ///Handles stored for a queue (`name` is the queue name) or a durable subscription.
    fn get_message_handles(&self, destination: &Destination, name: &str) -> Result<Vec<MessageHandleRecord>>;

    ///Drops handles of `destination` whose message expired, returning how many went.
    fn remove_expired_message_handles(&self, destination: &Destination, now: TimestampMillis) -> Result<usize>;

    fn add_destination(&self, destination: &Destination) -> Result<()>;

    fn remove_destination(&self, destination: &Destination) -> Result<()>;

    fn get_all_destinations(&self) -> Result<Vec<Destination>>;

    fn add_durable_consumer(&self, topic: &Destination, name: &str) -> Result<()>;

    fn remove_durable_consumer(&self, name: &str) -> Result<()>;

    fn get_all_durable_consumers(&self) -> Result<Vec<(SubscriptionName, Destination)>>;
}

/// Runs `f` inside a store transaction.
pub fn transact<T, F>(store: &dyn MessageStore, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    store.begin()?;
    match f() {
        Ok(v) => match store.commit() {
            Ok(()) => Ok(v),
            Err(e) => {
                log::warn!("transaction commit failed, {}", e);
                rollback_quietly(store);
                Err(e)
            }
        },
        Err(e) => {
            log::warn!("transaction rolled back, {}", e);
            rollback_quietly(store);
            Err(e)
        }
    }
}

#[inline]
fn rollback_quietly(store: &dyn MessageStore) {
    if let Err(e) = store.rollback() {
        log::error!("transaction rollback failed, {}", e);
    }
}

type HandleKey = (Destination, ByteString);

#[derive(Default)]
pub struct DefaultMessageStore {
    messages: DashMap<MessageId, Vec<u8>>,
    handles: DashMap<HandleKey, BTreeMap<MessageId, MessageHandleRecord>>,
    destinations: DashMap<Destination, Destination>,
    durables: DashMap<SubscriptionName, Destination>,
    active: AtomicIsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl DefaultMessageStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    #[inline]
    pub fn handle_count(&self) -> usize {
        self.handles.iter().map(|e| e.value().len()).sum()
    }

    #[inline]
    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    /// Transactions begun but not yet committed or rolled back.
    #[inline]
    pub fn active_transactions(&self) -> isize {
        self.active.load(Ordering::SeqCst)
    }

    /// (begins, commits, rollbacks)
    #[inline]
    pub fn transactions(&self) -> (usize, usize, usize) {
        (
            self.begins.load(Ordering::SeqCst),
            self.commits.load(Ordering::SeqCst),
            self.rollbacks.load(Ordering::SeqCst),
        )
    }

    #[inline]
    fn end(&self) -> Result<()> {
        let prev = self.active.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            self.active.fetch_add(1, Ordering::SeqCst);
            return Err(BrokerError::Persistence("no transaction in progress".into()));
        }
        Ok(())
    }
}

impl MessageStore for DefaultMessageStore {
    #[inline]
    fn begin(&self) -> Result<()> {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[inline]
    fn commit(&self) -> Result<()> {
        self.end()?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[inline]
    fn rollback(&self) -> Result<()> {
        self.end()?;
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn add_message(&self, message: &Message) -> Result<()> {
        let data = serde_json::to_vec(message)?;
        self.messages.insert(message.id.clone(), data);
        Ok(())
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        match self.messages.get(id) {
            Some(data) => Ok(Some(serde_json::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    #[inline]
    fn remove_message(&self, id: &MessageId) -> Result<()> {
        self.messages.remove(id);
        Ok(())
    }

    fn add_message_handle(&self, handle: &MessageHandleRecord) -> Result<()> {
        self.handles
            .entry((handle.destination.clone(), handle.consumer.clone()))
            .or_default()
            .insert(handle.message_id.clone(), handle.clone());
        Ok(())
    }

    fn update_message_handle(&self, handle: &MessageHandleRecord) -> Result<()> {
        let key = (handle.destination.clone(), handle.consumer.clone());
        match self.handles.get_mut(&key) {
            Some(mut handles) if handles.contains_key(&handle.message_id) => {
                handles.insert(handle.message_id.clone(), handle.clone());
                Ok(())
            }
            _ => Err(BrokerError::Persistence(format!(
                "no handle for message {} on {}/{}",
                handle.message_id, handle.destination, handle.consumer
            ))),
        }
    }

    fn remove_message_handle(&self, handle: &MessageHandleRecord) -> Result<()> {
        let key = (handle.destination.clone(), handle.consumer.clone());
        self.handles.remove_if_mut(&key, |_, handles| {
            handles.remove(&handle.message_id);
            handles.is_empty()
        });
        Ok(())
    }

    fn get_message_handles(&self, destination: &Destination, name: &str) -> Result<Vec<MessageHandleRecord>> {
        let key = (destination.clone(), ByteString::from(name));
        Ok(self.handles.get(&key).map(|handles| handles.values().cloned().collect()).unwrap_or_default())
    }

    fn remove_expired_message_handles(&self, destination: &Destination, now: TimestampMillis) -> Result<usize> {
        let mut removed = 0;
        for mut entry in self.handles.iter_mut() {
            let handles = entry.value_mut();
            let before = handles.len();
            handles.retain(|_, h| !(h.destination == *destination && h.is_expired(now)));
            removed += before - handles.len();
        }
        self.handles.retain(|_, handles| !handles.is_empty());
        Ok(removed)
    }

    fn add_destination(&self, destination: &Destination) -> Result<()> {
        self.destinations.insert(destination.clone(), destination.clone());
        Ok(())
    }

    fn remove_destination(&self, destination: &Destination) -> Result<()> {
        self.destinations.remove(destination);
        self.handles.retain(|(d, _), _| d != destination);
        Ok(())
    }

    fn get_all_destinations(&self) -> Result<Vec<Destination>> {
        Ok(self.destinations.iter().map(|e| e.value().clone()).collect())
    }

    fn add_durable_consumer(&self, topic: &Destination, name: &str) -> Result<()> {
        self.durables.insert(ByteString::from(name), topic.clone());
        Ok(())
    }

    fn remove_durable_consumer(&self, name: &str) -> Result<()> {
        self.durables.remove(name);
        Ok(())
    }

    fn get_all_durable_consumers(&self) -> Result<Vec<(SubscriptionName, Destination)>> {
        Ok(self.durables.iter().map(|e| (e.key().clone(), e.value().clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, consumer: &str, expiration: TimestampMillis) -> MessageHandleRecord {
        MessageHandleRecord {
            message_id: id.into(),
            destination: Destination::topic("t"),
            consumer: consumer.into(),
            priority: 4,
            timestamp: 1,
            sequence: 1,
            expiration,
            delivered: false,
        }
    }

    #[test]
    fn test_messages_round_trip_through_json() {
        let store = DefaultMessageStore::new();
        let m = Message::new(Destination::queue("q"), "hello").with_id("m1").with_property("color", "red");
        store.add_message(&m).unwrap();
        let back = store.get_message(&"m1".into()).unwrap().unwrap();
        assert_eq!(back.payload, m.payload);
        assert_eq!(back.property("color"), m.property("color"));
        store.remove_message(&"m1".into()).unwrap();
        assert!(store.get_message(&"m1".into()).unwrap().is_none());
    }

    #[test]
    fn test_handles() {
        let store = DefaultMessageStore::new();
        store.add_message_handle(&record("m1", "sub", 0)).unwrap();
        store.add_message_handle(&record("m2", "sub", 10)).unwrap();
        store.add_message_handle(&record("m3", "other", 10)).unwrap();

        let mut r = record("m1", "sub", 0);
        r.delivered = true;
        store.update_message_handle(&r).unwrap();
        assert!(store.update_message_handle(&record("zz", "sub", 0)).is_err());

        let handles = store.get_message_handles(&Destination::topic("t"), "sub").unwrap();
        assert_eq!(handles.len(), 2);
        assert!(handles[0].delivered);

        assert_eq!(store.remove_expired_message_handles(&Destination::topic("t"), 20).unwrap(), 2);
        assert_eq!(store.handle_count(), 1);

        store.remove_message_handle(&record("m1", "sub", 0)).unwrap();
        assert_eq!(store.handle_count(), 0);
    }

    #[test]
    fn test_transact() {
        let store = DefaultMessageStore::new();
        let v = transact(&store, || Ok(1)).unwrap();
        assert_eq!(v, 1);
        let r: Result<()> = transact(&store, || Err(BrokerError::Persistence("boom".into())));
        assert!(r.is_err());
        assert_eq!(store.transactions(), (2, 1, 1));
        assert_eq!(store.active_transactions(), 0);
        assert!(store.commit().is_err());
    }

    #[test]
    fn test_destinations_and_durables() {
        let store = DefaultMessageStore::new();
        let q = Destination::queue("q").with_persistent(true);
        store.add_destination(&q).unwrap();
        store.add_durable_consumer(&Destination::topic("t"), "sub").unwrap();
        assert_eq!(store.get_all_destinations().unwrap(), vec![q.clone()]);
        assert_eq!(store.get_all_durable_consumers().unwrap().len(), 1);
        store.remove_destination(&q).unwrap();
        store.remove_durable_consumer("sub").unwrap();
        assert!(store.get_all_destinations().unwrap().is_empty());
        assert!(store.get_all_durable_consumers().unwrap().is_empty());
    }
}
