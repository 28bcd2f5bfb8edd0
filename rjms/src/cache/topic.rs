use std::sync::{Arc, Weak};

use super::{destroy_quietly, CacheCore, DestinationCache};
use crate::consumer::ConsumerEndpoint;
use crate::context::BrokerContext;
use crate::lease::{Lease, LeaseListener};
use crate::message::{DefaultMessageCache, HandleOwner, MessageCache, MessageHandle, MessageRef};
use crate::types::{ConsumerId, Destination, Message, TimestampMillis};
use crate::Result;

/// Cache of a concrete topic.
///
/// Arrivals are handed to every registered subscriber, wildcard subscribers
/// included. Nothing is kept for subscribers that attach later.
pub struct TopicDestinationCache {
    me: Weak<TopicDestinationCache>,
    core: CacheCore<()>,
}

impl TopicDestinationCache {
    pub fn new(scx: BrokerContext, destination: Destination) -> Arc<Self> {
        Arc::new_cyclic(|me| Self { me: me.clone(), core: CacheCore::new(scx, destination) })
    }

    #[inline]
    fn lease_listener(&self) -> Weak<dyn LeaseListener> {
        self.me.clone()
    }

    #[inline]
    pub fn consumers(&self) -> Vec<Arc<ConsumerEndpoint>> {
        self.core.consumers()
    }

    /// Fans `message` out to the subscribers. On the persistent path a
    /// subscriber failing to store its handle aborts the delivery: handles
    /// already given out are taken back and the error is returned so the
    /// publisher's transaction rolls back.
    fn deliver(&self, message: Arc<Message>, persistent: bool) -> Result<bool> {
        let msg_ref = self.core.cache.add_message(message.clone());
        //held across the fan-out so an early acknowledge cannot destroy the message
        msg_ref.reference()?;
        let shared = MessageHandle::shared(msg_ref.clone(), &message);

        let mut accepted = Vec::new();
        let mut failed = None;
        for consumer in self.core.consumers() {
            match consumer.message_added(&shared, &message) {
                Ok(true) => accepted.push(consumer),
                Ok(false) => {}
                Err(e) if persistent => {
                    failed = Some(e);
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "{} failed to deliver message {} to consumer {}, {}",
                        self.core.destination,
                        message.id,
                        consumer.id(),
                        e
                    );
                }
            }
        }

        if let Some(e) = failed {
            log::warn!("{} failed to store message {} for subscribers, {}", self.core.destination, message.id, e);
            for consumer in accepted {
                consumer.message_removed(&message.id);
            }
            if let Err(de) = msg_ref.dereference() {
                log::debug!("{} failed to release message {}, {}", self.core.destination, message.id, de);
            }
            return Err(e);
        }

        let accepted = accepted.len();
        let expiry = if accepted > 0 { self.check_message_expiry(&msg_ref, message.expiration) } else { Ok(()) };
        msg_ref.dereference()?;
        if accepted == 0 {
            self.core.scx.stats.messages_dropped.inc();
            log::debug!("{} no subscriber for message {}", self.core.destination, message.id);
        }
        expiry?;
        Ok(accepted > 0)
    }
}

impl DestinationCache for TopicDestinationCache {
    #[inline]
    fn destination(&self) -> &Destination {
        &self.core.destination
    }

    #[inline]
    fn add_consumer(&self, consumer: Arc<ConsumerEndpoint>) -> bool {
        self.core.add_consumer(consumer)
    }

    #[inline]
    fn remove_consumer(&self, id: ConsumerId) -> Option<Arc<ConsumerEndpoint>> {
        self.core.remove_consumer(id)
    }

    #[inline]
    fn has_consumers(&self) -> bool {
        self.core.consumer_count() > 0
    }

    #[inline]
    fn consumer_count(&self) -> usize {
        self.core.consumer_count()
    }

    #[inline]
    fn message_added(&self, message: Arc<Message>) -> Result<bool> {
        self.deliver(message, false)
    }

    #[inline]
    fn persistent_message_added(&self, message: Arc<Message>) -> Result<bool> {
        self.deliver(message, true)
    }

    #[inline]
    fn can_destroy(&self) -> bool {
        !self.has_consumers()
    }

    fn destroy(&self) {
        self.core.clear();
        log::debug!("{} cache destroyed", self.core.destination);
    }

    #[inline]
    fn collect_garbage(&self, aggressive: bool) {
        self.core.collect_garbage(aggressive)
    }

    #[inline]
    fn message_cache(&self) -> &Arc<DefaultMessageCache> {
        &self.core.cache
    }

    #[inline]
    fn check_message_expiry(&self, msg_ref: &Arc<MessageRef>, expiration: TimestampMillis) -> Result<()> {
        self.core.check_message_expiry(self.lease_listener(), msg_ref, expiration)
    }

    #[inline]
    fn lease_count(&self) -> usize {
        self.core.lease_count()
    }
}

impl HandleOwner for TopicDestinationCache {
    //subscribers own their handles; anything handed back here has no reader left
    fn return_message_handle(&self, handle: MessageHandle) -> Result<()> {
        destroy_quietly(handle);
        Ok(())
    }
}

impl LeaseListener for TopicDestinationCache {
    fn on_lease_expired(&self, lease: &Lease) {
        self.core.expire(lease, |_| Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rjms_utils::timestamp_millis;

    use super::*;
    use crate::condition::Never;
    use crate::conf::Settings;
    use crate::consumer::TopicConsumer;
    use crate::lease::{DefaultLeaseManager, LeaseManager};

    fn message(id: &str) -> Arc<Message> {
        Arc::new(Message::new(Destination::topic("t"), "x").with_id(id))
    }

    #[test]
    fn test_no_subscriber_drops_message() {
        let scx = BrokerContext::default();
        let cache = TopicDestinationCache::new(scx.clone(), Destination::topic("t"));
        assert!(!cache.message_added(message("m")).unwrap());
        assert!(cache.message_cache().is_empty());
        assert_eq!(cache.lease_count(), 0);
        assert_eq!(scx.stats.messages_dropped.count(), 1);
        assert_eq!(scx.stats.messages_destroyed.count(), 1);
    }

    #[test]
    fn test_fan_out_gives_independent_handles() {
        let scx = BrokerContext::default();
        let cache = TopicDestinationCache::new(scx.clone(), Destination::topic("t"));
        let consumers = (1..=3)
            .map(|id| TopicConsumer::create(scx.clone(), id, Destination::topic("t"), vec![cache.clone()], None, false, None))
            .collect::<Vec<_>>();
        assert!(cache.message_added(message("m")).unwrap());

        let msg_ref = cache.message_cache().get_message_ref(&"m".into()).unwrap();
        assert_eq!(msg_ref.count(), 3);

        let mut handles = consumers.iter().map(|c| c.receive(&Never).unwrap().unwrap()).collect::<Vec<_>>();
        handles[0].set_delivered(true);
        assert!(!handles[1].is_delivered());
        assert_eq!(handles.iter().map(|h| h.consumer_id()).collect::<Vec<_>>(), vec![Some(1), Some(2), Some(3)]);

        handles.pop().unwrap().destroy().unwrap();
        assert!(!msg_ref.is_destroyed());
        for h in handles {
            h.destroy().unwrap();
        }
        assert!(msg_ref.is_destroyed());
        assert!(cache.message_cache().is_empty());
    }

    #[test]
    fn test_expiry_removes_undelivered_handles() {
        let leases = Arc::new(DefaultLeaseManager::new(Duration::from_secs(1)));
        let scx = BrokerContext::builder(Settings::default()).lease_manager(leases.clone()).build();
        let cache = TopicDestinationCache::new(scx.clone(), Destination::topic("t"));
        let c = TopicConsumer::create(scx.clone(), 1, Destination::topic("t"), vec![cache.clone()], None, false, None);
        let m = Message::new(Destination::topic("t"), "x").with_id("m").with_expiration(timestamp_millis() + 60_000);
        assert!(cache.message_added(Arc::new(m)).unwrap());
        assert_eq!(c.len(), 1);
        assert_eq!(cache.lease_count(), 1);

        assert_eq!(leases.expire(timestamp_millis() + 120_000), 1);
        assert_eq!(c.len(), 0);
        assert!(cache.message_cache().is_empty());
        assert_eq!(scx.stats.messages_expired.count(), 1);
    }

    #[test]
    fn test_acknowledged_message_cancels_its_lease() {
        let leases = Arc::new(DefaultLeaseManager::new(Duration::from_secs(1)));
        let scx = BrokerContext::builder(Settings::default()).lease_manager(leases.clone()).build();
        let cache = TopicDestinationCache::new(scx.clone(), Destination::topic("t"));
        let c = TopicConsumer::create(scx.clone(), 1, Destination::topic("t"), vec![cache.clone()], None, false, None);
        let m = Message::new(Destination::topic("t"), "x").with_id("m").with_expiration(timestamp_millis() + 60_000);
        assert!(cache.message_added(Arc::new(m)).unwrap());
        assert_eq!(leases.len(), 1);

        c.receive(&Never).unwrap().unwrap().destroy().unwrap();
        assert_eq!(cache.lease_count(), 0);
        assert!(leases.is_empty());
        assert_eq!(scx.stats.leases.count(), 0);

        assert!(cache.message_added(message("m")).unwrap());
        assert_eq!(leases.expire(timestamp_millis() + 120_000), 0);
        assert_eq!(c.len(), 1);
    }
}
