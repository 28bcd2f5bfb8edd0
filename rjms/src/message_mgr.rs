use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::BrokerContext;
use crate::destination_mgr::DestinationManager;
use crate::store::transact;
use crate::types::{timestamp_millis, Message, MessageId, SequenceNumber};
use crate::{BrokerError, Result};

/// Ingress of accepted messages.
///
/// Stamps each message with the accept time and the next sequence number,
/// then hands it to the cache of its destination, through the store for
/// persistent messages.
pub struct MessageMgr {
    scx: BrokerContext,
    destinations: Arc<DestinationManager>,
    sequence: AtomicU64,
}

impl MessageMgr {
    pub fn new(scx: BrokerContext, destinations: Arc<DestinationManager>) -> Self {
        Self { scx, destinations, sequence: AtomicU64::new(1) }
    }

    #[inline]
    fn next_sequence(&self) -> SequenceNumber {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Stamps `message` and gives it an id if it has none.
    pub fn prepare(&self, mut message: Message) -> Result<Message> {
        if message.destination.is_wildcard() {
            return Err(BrokerError::InvalidDestination(format!("cannot publish to pattern {}", message.destination)));
        }
        message.timestamp = timestamp_millis();
        message.sequence = self.next_sequence();
        if message.id.is_empty() {
            message.id = format!("ID:{}-{}", message.timestamp, message.sequence).into();
        }
        Ok(message)
    }

    /// Accepts a message and routes it. Returns the message id.
    pub fn add(&self, message: Message) -> Result<MessageId> {
        let message = self.prepare(message)?;
        self.route(message)
    }

    /// Routes an already stamped message.
    ///
    /// A queue cache collected between lookup and delivery is looked up
    /// again; the message is delivered once.
    pub fn route(&self, message: Message) -> Result<MessageId> {
        let id = message.id.clone();
        let message = Arc::new(message);
        self.scx.stats.messages_received.inc();
        if message.persistent {
            self.scx.stats.messages_persistent.inc();
        }
        loop {
            let cache = self.destinations.get_destination_cache(&message.destination)?;
            let res = if message.persistent {
                let store = self.scx.store.as_ref();
                transact(store, || {
                    store.add_message(&message)?;
                    cache.as_cache().persistent_message_added(message.clone())
                })
            } else {
                cache.as_cache().message_added(message.clone())
            };
            match res {
                Err(e) if e.is_cache_closed() => {
                    log::debug!("{}, route message {} again", e, id);
                }
                res => {
                    res?;
                    break;
                }
            }
        }
        log::debug!("accepted message {}", id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Weak;

    use crate::cache::DestinationCache;
    use crate::conf::Settings;
    use crate::destination_mgr::{CacheEntry, DestinationEventListener};
    use crate::message::MessageCache;
    use crate::store::{DefaultMessageStore, MessageStore};
    use crate::types::Destination;

    fn mgr() -> (MessageMgr, Arc<DestinationManager>, Arc<DefaultMessageStore>) {
        let store = Arc::new(DefaultMessageStore::new());
        let scx = BrokerContext::builder(Settings::default()).store(store.clone()).build();
        let destinations = Arc::new(DestinationManager::new(scx.clone()));
        (MessageMgr::new(scx, destinations.clone()), destinations, store)
    }

    #[test]
    fn test_stamps_messages() {
        let (mgr, _d, _s) = mgr();
        let a = mgr.prepare(Message::new(Destination::queue("q"), "a")).unwrap();
        let b = mgr.prepare(Message::new(Destination::queue("q"), "b").with_id("given")).unwrap();
        assert!(b.sequence > a.sequence);
        assert!(a.timestamp > 0);
        assert!(!a.id.is_empty());
        assert_eq!(b.id, "given");
        assert!(mgr.prepare(Message::new(Destination::topic("a.*"), "x")).is_err());
    }

    #[test]
    fn test_persistent_queue_message_is_stored() {
        let (mgr, destinations, store) = mgr();
        let q = Destination::queue("q");
        let id = mgr.add(Message::new(q.clone(), "x").with_persistent(true)).unwrap();
        assert!(store.contains_message(&id));
        assert_eq!(store.get_message_handles(&q, "q").unwrap().len(), 1);
        assert_eq!(destinations.get_queue_cache(&q).unwrap().len(), 1);
        assert_eq!(store.active_transactions(), 0);
    }

    #[test]
    fn test_unsubscribed_topic_message_leaves_nothing() {
        let (mgr, destinations, store) = mgr();
        let t = Destination::topic("t");
        let id = mgr.add(Message::new(t.clone(), "x").with_persistent(true)).unwrap();
        assert!(!store.contains_message(&id));
        assert!(destinations.get_topic_cache(&t).unwrap().message_cache().is_empty());
    }

    /// Sweeps the destinations the first time a cache is created.
    struct CollectOnce {
        destinations: Weak<DestinationManager>,
        done: AtomicBool,
    }

    impl DestinationEventListener for CollectOnce {
        fn cache_added(&self, _destination: &Destination, _cache: &CacheEntry) {
            if self.done.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(destinations) = self.destinations.upgrade() {
                destinations.collect_garbage(false);
            }
        }
    }

    #[test]
    fn test_message_survives_cache_collected_before_delivery() {
        let (mgr, destinations, store) = mgr();
        let sweeper = Arc::new(CollectOnce { destinations: Arc::downgrade(&destinations), done: AtomicBool::new(false) });
        let weak: Weak<CollectOnce> = Arc::downgrade(&sweeper);
        destinations.add_listener(weak);

        let q = Destination::queue("q");
        let id = mgr.add(Message::new(q.clone(), "x").with_persistent(true)).unwrap();
        let cache = destinations.get_queue_cache(&q).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.message_cache().get_message_ref(&id).is_some());
        assert!(store.contains_message(&id));
        assert_eq!(store.get_message_handles(&q, "q").unwrap().len(), 1);
        assert_eq!(store.active_transactions(), 0);
    }
}
