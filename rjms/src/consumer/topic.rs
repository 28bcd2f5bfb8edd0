use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{next_acceptable, ConsumerEndpoint, ConsumerKind};
use crate::cache::{destroy_quietly, handle_queue, DestinationCache, TopicDestinationCache};
use crate::condition::Condition;
use crate::context::BrokerContext;
use crate::message::MessageHandle;
use crate::queue::MessageQueue;
use crate::selector::Selector;
use crate::types::{ConnectionId, ConsumerId, Destination, Message};
use crate::Result;

/// Private queue of a subscriber plus the topic caches feeding it.
pub(crate) struct Subscriber {
    messages: MessageQueue,
    caches: Mutex<Vec<Weak<TopicDestinationCache>>>,
}

impl Subscriber {
    pub(crate) fn new(scx: &BrokerContext) -> Self {
        Self { messages: handle_queue(scx), caches: Mutex::new(Vec::new()) }
    }

    #[inline]
    pub(crate) fn messages(&self) -> &MessageQueue {
        &self.messages
    }

    /// Returns false if the cache is attached already.
    pub(crate) fn attach(&self, cache: &Arc<TopicDestinationCache>) -> bool {
        let mut caches = self.caches.lock();
        caches.retain(|c| c.strong_count() > 0);
        if caches.iter().any(|c| c.upgrade().map(|c| Arc::ptr_eq(&c, cache)).unwrap_or(false)) {
            return false;
        }
        caches.push(Arc::downgrade(cache));
        true
    }

    pub(crate) fn detach(&self, destination: &Destination) -> Option<Arc<TopicDestinationCache>> {
        let mut caches = self.caches.lock();
        let pos = caches.iter().position(|c| c.upgrade().map(|c| c.destination() == destination).unwrap_or(false))?;
        caches.remove(pos).upgrade()
    }

    pub(crate) fn destinations(&self) -> Vec<Destination> {
        self.caches.lock().iter().filter_map(|c| c.upgrade()).map(|c| c.destination().clone()).collect()
    }

    /// Detaches from every cache and drops every queued handle.
    pub(crate) fn clear(&self, id: ConsumerId) {
        let caches = std::mem::take(&mut *self.caches.lock());
        for cache in caches.iter().filter_map(|c| c.upgrade()) {
            cache.remove_consumer(id);
        }
        for handle in self.messages.drain() {
            destroy_quietly(handle);
        }
    }

    /// Queues a specialized handle. A handle that arrives after the
    /// endpoint closed is destroyed again.
    pub(crate) fn enqueue(&self, endpoint: &ConsumerEndpoint, handle: MessageHandle) -> bool {
        let id = handle.id().clone();
        if let Err(h) = self.messages.add(handle) {
            destroy_quietly(h);
            return false;
        }
        if endpoint.is_closed() {
            if let Some(h) = self.messages.remove(&id) {
                destroy_quietly(h);
            }
            return false;
        }
        true
    }
}

/// Non-durable topic subscriber, wildcard patterns included.
pub struct TopicConsumer {
    subscriber: Subscriber,
}

impl TopicConsumer {
    /// Creates the endpoint and attaches it to `caches`, the topic caches
    /// currently matching `destination`.
    pub fn create(
        scx: BrokerContext,
        id: ConsumerId,
        destination: Destination,
        caches: Vec<Arc<TopicDestinationCache>>,
        selector: Option<Arc<dyn Selector>>,
        no_local: bool,
        connection_id: Option<ConnectionId>,
    ) -> Arc<ConsumerEndpoint> {
        let subscriber = Subscriber::new(&scx);
        let endpoint = ConsumerEndpoint::new(
            scx,
            id,
            destination,
            selector,
            no_local,
            connection_id,
            ConsumerKind::Topic(TopicConsumer { subscriber }),
        );
        for cache in caches.iter() {
            endpoint.attach_cache(cache);
        }
        endpoint
    }

    #[inline]
    pub(crate) fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    #[inline]
    pub(crate) fn messages(&self) -> &MessageQueue {
        self.subscriber.messages()
    }

    pub(crate) fn message_added(
        &self,
        endpoint: &ConsumerEndpoint,
        shared: &MessageHandle,
        message: &Message,
    ) -> Result<bool> {
        if endpoint.is_local(message) || !endpoint.selects(message) {
            return Ok(false);
        }
        let handle = shared.specialize(endpoint.id(), None, None)?.with_owner(endpoint.owner());
        if !self.subscriber.enqueue(endpoint, handle) {
            return Ok(false);
        }
        endpoint.message_available();
        Ok(true)
    }

    #[inline]
    pub(crate) fn receive(
        &self,
        endpoint: &ConsumerEndpoint,
        cancel: &dyn Condition,
    ) -> Result<Option<MessageHandle>> {
        next_acceptable(endpoint, self.messages(), cancel)
    }

    #[inline]
    pub(crate) fn close(&self, endpoint: &ConsumerEndpoint) {
        self.subscriber.clear(endpoint.id());
    }
}
