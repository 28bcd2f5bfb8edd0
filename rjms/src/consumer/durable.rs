use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::topic::Subscriber;
use super::{next_acceptable, ConsumerEndpoint, ConsumerKind};
use crate::cache::{destroy_quietly, DestinationCache, TopicDestinationCache};
use crate::condition::Condition;
use crate::context::BrokerContext;
use crate::message::{MessageCache, MessageHandle};
use crate::queue::MessageQueue;
use crate::selector::Selector;
use crate::types::{timestamp_millis, ConnectionId, ConsumerId, Destination, Message, SubscriptionName};
use crate::{BrokerError, Result};

/// Looks up (or creates) the cache of a concrete topic.
pub type TopicCacheResolver<'a> = &'a dyn Fn(&Destination) -> Result<Arc<TopicDestinationCache>>;

/// Named topic subscription that outlives the sessions using it.
///
/// The endpoint stays attached to its topic caches whether or not a session
/// has it activated, so publishes made while inactive are kept. Handles of
/// persistent messages are written to the store under the subscription name
/// and reloaded when the subscription is recovered.
pub struct DurableConsumer {
    name: SubscriptionName,
    subscriber: Subscriber,
    active: AtomicBool,
}

impl DurableConsumer {
    /// Creates the endpoint, reloads its stored backlog and then attaches it
    /// to `caches`, the topic caches currently matching `topic`.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        scx: BrokerContext,
        id: ConsumerId,
        name: SubscriptionName,
        topic: Destination,
        caches: Vec<Arc<TopicDestinationCache>>,
        resolver: TopicCacheResolver<'_>,
        selector: Option<Arc<dyn Selector>>,
        no_local: bool,
        connection_id: Option<ConnectionId>,
    ) -> Result<Arc<ConsumerEndpoint>> {
        let durable = DurableConsumer { name, subscriber: Subscriber::new(&scx), active: AtomicBool::new(false) };
        let endpoint = ConsumerEndpoint::new(scx, id, topic, selector, no_local, connection_id, ConsumerKind::Durable(durable));
        let loaded = match &endpoint.kind {
            ConsumerKind::Durable(d) => d.load(&endpoint, resolver),
            _ => Ok(0),
        };
        if let Err(e) = loaded {
            endpoint.abandon();
            return Err(e);
        }
        for cache in caches.iter() {
            endpoint.attach_cache(cache);
        }
        Ok(endpoint)
    }

    /// Reloads the undelivered handles of this subscription.
    fn load(&self, endpoint: &ConsumerEndpoint, resolver: TopicCacheResolver<'_>) -> Result<usize> {
        let store = endpoint.scx().store.clone();
        let now = timestamp_millis();
        let mut n = 0;
        for record in store.get_message_handles(endpoint.destination(), &self.name)? {
            let message = match store.get_message(&record.message_id)? {
                Some(m) if !record.is_expired(now) => m,
                _ => {
                    log::debug!("durable subscription {} drop stale handle {}", self.name, record.message_id);
                    store.remove_message_handle(&record)?;
                    continue;
                }
            };
            let cache = resolver(&message.destination)?;
            let msg_ref = cache.message_cache().add_message(Arc::new(message));
            let mut handle = MessageHandle::from_record(msg_ref.clone(), &record, store.clone())?;
            handle.set_consumer_id(Some(endpoint.id()));
            handle.set_owner(endpoint.owner());
            if self.subscriber.enqueue(endpoint, handle) {
                n += 1;
            }
            cache.check_message_expiry(&msg_ref, record.expiration)?;
        }
        if n > 0 {
            log::info!("durable subscription {} recovered {} messages", self.name, n);
        }
        Ok(n)
    }

    #[inline]
    pub fn name(&self) -> &SubscriptionName {
        &self.name
    }

    #[inline]
    pub(crate) fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    #[inline]
    pub(crate) fn messages(&self) -> &MessageQueue {
        self.subscriber.messages()
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn activate(&self) -> Result<()> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| BrokerError::DurableSubscriptionActive(self.name.to_string()))
    }

    pub(crate) fn deactivate(&self) -> Result<()> {
        self.active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| BrokerError::InvalidState(format!("durable subscription {} is not active", self.name)))
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
        let store = if message.persistent { Some(endpoint.scx().store.clone()) } else { None };
        let handle = shared
            .specialize(endpoint.id(), Some(self.name.clone()), store)?
            .with_destination(endpoint.destination().clone())
            .with_owner(endpoint.owner());
        if let Err(e) = handle.add() {
            destroy_quietly(handle);
            return Err(e);
        }
        if !self.subscriber.enqueue(endpoint, handle) {
            return Ok(false);
        }
        if self.is_active() {
            endpoint.message_available();
        }
        Ok(true)
    }

    pub(crate) fn receive(
        &self,
        endpoint: &ConsumerEndpoint,
        cancel: &dyn Condition,
    ) -> Result<Option<MessageHandle>> {
        if !self.is_active() {
            return Ok(None);
        }
        next_acceptable(endpoint, self.messages(), cancel)
    }

    /// Unsubscribe: detaches and destroys every handle, stored ones included.
    #[inline]
    pub(crate) fn close(&self, endpoint: &ConsumerEndpoint) {
        self.subscriber.clear(endpoint.id());
    }
}
