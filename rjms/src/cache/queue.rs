use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rjms_utils::timestamp_millis;

use super::{destroy_quietly, handle_queue, CacheCore, DestinationCache};
use crate::condition::Condition;
use crate::consumer::ConsumerEndpoint;
use crate::context::BrokerContext;
use crate::lease::{Lease, LeaseListener};
use crate::message::{DefaultMessageCache, HandleOwner, MessageCache, MessageHandle, MessageRef};
use crate::queue::MessageQueue;
use crate::selector::Selector;
use crate::types::{ConsumerId, Destination, Message, TimestampMillis};
use crate::{BrokerError, Result};

#[derive(Default)]
pub(crate) struct QueueState {
    last_index: usize,
    browsers: Vec<Arc<ConsumerEndpoint>>,
}

/// Cache of a queue: one backlog shared by competing consumers.
pub struct QueueDestinationCache {
    me: Weak<QueueDestinationCache>,
    core: CacheCore<QueueState>,
    messages: MessageQueue,
    //false once destroyed; arrivals hold it shared while enqueuing
    open: RwLock<bool>,
}

impl QueueDestinationCache {
    pub fn new(scx: BrokerContext, destination: Destination) -> Arc<Self> {
        let messages = handle_queue(&scx);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            core: CacheCore::new(scx, destination),
            messages,
            open: RwLock::new(true),
        })
    }

    /// Loads the persistent backlog of this queue from the store.
    pub fn init(&self) -> Result<usize> {
        let store = self.core.scx.store.clone();
        let records = store.get_message_handles(&self.core.destination, &self.core.destination.name)?;
        let mut n = 0;
        for record in records {
            let msg_ref = match self.core.cache.get_or_fault_ref(&record.message_id)? {
                Some(r) => r,
                None => {
                    log::warn!("{} drop handle of missing message {}", self.core.destination, record.message_id);
                    store.remove_message_handle(&record)?;
                    continue;
                }
            };
            let handle = MessageHandle::from_record(msg_ref.clone(), &record, store.clone())?.with_owner(self.owner());
            match self.messages.add(handle) {
                Ok(()) => n += 1,
                Err(h) => destroy_quietly(h),
            }
            self.check_message_expiry(&msg_ref, record.expiration)?;
        }
        if n > 0 {
            log::info!("{} recovered {} messages", self.core.destination, n);
        }
        Ok(n)
    }

    #[inline]
    fn owner(&self) -> Weak<dyn HandleOwner> {
        self.me.clone()
    }

    #[inline]
    fn lease_listener(&self) -> Weak<dyn LeaseListener> {
        self.me.clone()
    }

    /// Backlog size.
    #[inline]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Queues an arriving handle. Fails with `CacheClosed` once the cache
    /// has been destroyed so the caller can retry on its replacement.
    fn add_handle(&self, handle: MessageHandle, message: &Message) -> Result<bool> {
        let msg_ref = handle.message_ref().clone();
        let handle = handle.with_owner(self.owner());

        let queued = {
            let open = self.open.read();
            if *open {
                self.messages.add(handle).map_err(|h| (h, false))
            } else {
                Err((handle, true))
            }
        };
        match queued {
            Ok(()) => {}
            Err((h, true)) => {
                destroy_quietly(h);
                return Err(BrokerError::CacheClosed(self.core.destination.to_string()));
            }
            Err((h, false)) => {
                log::debug!("{} message {} already queued", self.core.destination, h.id());
                destroy_quietly(h);
                return Ok(false);
            }
        }

        let browsers = self.core.state().ext.browsers.clone();
        for browser in browsers {
            browser.browse(&msg_ref, message);
        }
        if let Some(consumer) = self.endpoint_for_message(message) {
            consumer.message_available();
        }
        self.check_message_expiry(&msg_ref, message.expiration)?;
        Ok(true)
    }

    /// Picks at most one consumer able to take `message` right now.
    ///
    /// Scans round-robin from the remembered index for an endpoint that is
    /// asynchronous or blocked in receive and whose selector accepts the
    /// message, then remembers the slot after it.
    pub fn endpoint_for_message(&self, message: &Message) -> Option<Arc<ConsumerEndpoint>> {
        let mut state = self.core.state();
        let size = state.consumers.len();
        if size == 0 {
            return None;
        }
        if state.ext.last_index + 1 > size {
            state.ext.last_index = 0;
        }
        let mut index = state.ext.last_index;
        loop {
            let endpoint = &state.consumers[index];
            if (endpoint.is_asynchronous() || endpoint.is_waiting()) && endpoint.selects(message) {
                let endpoint = endpoint.clone();
                state.ext.last_index = index + 1;
                return Some(endpoint);
            }
            index += 1;
            if index >= size {
                index = 0;
            }
            if index == state.ext.last_index {
                return None;
            }
        }
    }

    /// Takes the next message for a consumer.
    ///
    /// Without a selector this is the backlog head. With one, the backlog is
    /// scanned in delivery order for the first match, checking `cancel`
    /// between messages.
    pub fn get_message(
        &self,
        selector: Option<&dyn Selector>,
        cancel: &dyn Condition,
    ) -> Result<Option<MessageHandle>> {
        let now = timestamp_millis();
        match selector {
            None => {
                while let Some(handle) = self.messages.remove_first() {
                    match handle.message() {
                        Ok(Some(m)) if !m.is_expired(now) => return Ok(Some(handle)),
                        Ok(_) => self.discard(handle),
                        Err(e) => {
                            self.restore(handle);
                            return Err(e);
                        }
                    }
                    if cancel.is_met() {
                        break;
                    }
                }
                Ok(None)
            }
            Some(selector) => {
                for (id, msg_ref) in self.messages.snapshot() {
                    if cancel.is_met() {
                        break;
                    }
                    let message = match msg_ref.message()? {
                        Some(m) => m,
                        None => continue,
                    };
                    if message.is_expired(now) || !selector.selects(&message) {
                        continue;
                    }
                    if let Some(handle) = self.messages.remove(&id) {
                        return Ok(Some(handle));
                    }
                }
                Ok(None)
            }
        }
    }

    #[inline]
    fn discard(&self, handle: MessageHandle) {
        log::debug!("{} discard stale handle of message {}", self.core.destination, handle.id());
        destroy_quietly(handle);
    }

    #[inline]
    fn restore(&self, handle: MessageHandle) {
        if let Err(h) = self.messages.add(handle) {
            destroy_quietly(h);
        }
    }

    /// Registers a browser and replays the current backlog to it.
    pub fn add_browser(&self, browser: Arc<ConsumerEndpoint>) -> bool {
        {
            let mut state = self.core.state();
            if state.ext.browsers.iter().any(|b| b.id() == browser.id()) {
                return false;
            }
            state.ext.browsers.push(browser.clone());
        }
        self.playback_messages(&browser);
        true
    }

    pub fn remove_browser(&self, id: ConsumerId) -> Option<Arc<ConsumerEndpoint>> {
        let mut state = self.core.state();
        let pos = state.ext.browsers.iter().position(|b| b.id() == id)?;
        Some(state.ext.browsers.remove(pos))
    }

    #[inline]
    pub fn browser_count(&self) -> usize {
        self.core.state().ext.browsers.len()
    }

    fn playback_messages(&self, browser: &ConsumerEndpoint) {
        for (id, msg_ref) in self.messages.snapshot() {
            match msg_ref.message() {
                Ok(Some(message)) => browser.browse(&msg_ref, &message),
                Ok(None) => {}
                Err(e) => log::warn!("{} failed to replay message {} to browser, {}", self.core.destination, id, e),
            }
        }
    }

    fn message_expired(&self, msg_ref: &Arc<MessageRef>) -> Result<()> {
        if let Some(handle) = self.messages.remove(msg_ref.id()) {
            handle.destroy()?;
        }
        let browsers = self.core.state().ext.browsers.clone();
        for browser in browsers {
            browser.message_removed(msg_ref.id());
        }
        Ok(())
    }
}

impl DestinationCache for QueueDestinationCache {
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

    fn message_added(&self, message: Arc<Message>) -> Result<bool> {
        let msg_ref = self.core.cache.add_message(message.clone());
        let handle = MessageHandle::transient(msg_ref, &message)?;
        self.add_handle(handle, &message)
    }

    fn persistent_message_added(&self, message: Arc<Message>) -> Result<bool> {
        let msg_ref = self.core.cache.add_message(message.clone());
        let handle = MessageHandle::persistent(msg_ref, &message, None, self.core.scx.store.clone())?;
        if let Err(e) = handle.add() {
            destroy_quietly(handle);
            return Err(e);
        }
        self.add_handle(handle, &message)
    }

    fn can_destroy(&self) -> bool {
        {
            let state = self.core.state();
            if !state.consumers.is_empty() || !state.ext.browsers.is_empty() {
                return false;
            }
        }
        match self.core.destination.owner {
            Some(conn) => !self.core.scx.connections.is_alive(conn),
            None => self.messages.is_empty(),
        }
    }

    fn try_close(&self) -> bool {
        let mut open = self.open.write();
        if *open && !self.can_destroy() {
            return false;
        }
        *open = false;
        true
    }

    fn destroy(&self) {
        *self.open.write() = false;
        for handle in self.messages.drain() {
            destroy_quietly(handle);
        }
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

impl HandleOwner for QueueDestinationCache {
    fn return_message_handle(&self, mut handle: MessageHandle) -> Result<()> {
        handle.set_consumer_id(None);
        let message = match handle.message()? {
            Some(m) => m,
            None => {
                destroy_quietly(handle);
                return Ok(());
            }
        };
        if let Err(h) = self.messages.add(handle) {
            destroy_quietly(h);
            return Ok(());
        }
        if let Some(consumer) = self.endpoint_for_message(&message) {
            consumer.message_available();
        }
        Ok(())
    }
}

impl LeaseListener for QueueDestinationCache {
    fn on_lease_expired(&self, lease: &Lease) {
        self.core.expire(lease, |msg_ref| self.message_expired(msg_ref));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use std::time::Duration;

    use super::*;
    use crate::condition::{Flag, Never};
    use crate::conf::Settings;
    use crate::lease::{DefaultLeaseManager, LeaseManager};
    use crate::consumer::{ConsumerEndpoint, QueueConsumer};
    use crate::selector::{DefaultSelectorFactory, SelectorFactory};
    use crate::types::Destination;

    fn message(id: &str, priority: u8, seq: u64) -> Arc<Message> {
        let mut m = Message::new(Destination::queue("q"), "x").with_id(id).with_priority(priority);
        m.timestamp = 1000;
        m.sequence = seq;
        Arc::new(m)
    }

    fn consumer(scx: &BrokerContext, cache: &Arc<QueueDestinationCache>, id: u64) -> Arc<ConsumerEndpoint> {
        let c = QueueConsumer::create(scx.clone(), id, cache.clone(), None, None);
        c.set_waiting(true);
        c
    }

    #[test]
    fn test_backlog_priority_and_selector_scan() {
        let scx = BrokerContext::default();
        let cache = QueueDestinationCache::new(scx, Destination::queue("q"));
        cache.message_added(message("low", 1, 1)).unwrap();
        cache.message_added(message("high", 9, 2)).unwrap();
        cache.message_added(message("mid", 5, 3)).unwrap();
        assert_eq!(cache.len(), 3);

        let selector = DefaultSelectorFactory.create("JMSPriority < 6").unwrap();
        let h = cache.get_message(Some(selector.as_ref()), &Never).unwrap().unwrap();
        assert_eq!(h.id(), "mid");
        let h2 = cache.get_message(None, &Never).unwrap().unwrap();
        assert_eq!(h2.id(), "high");

        let cancel = Flag::new();
        cancel.set();
        assert!(cache.get_message(Some(selector.as_ref()), &cancel).unwrap().is_none());
        assert_eq!(cache.len(), 1);
        h.destroy().unwrap();
        h2.destroy().unwrap();
    }

    #[test]
    fn test_round_robin_skips_idle_consumers() {
        let scx = BrokerContext::default();
        let cache = QueueDestinationCache::new(scx.clone(), Destination::queue("q"));
        let a = consumer(&scx, &cache, 1);
        let b = consumer(&scx, &cache, 2);
        let c = consumer(&scx, &cache, 3);
        b.set_waiting(false);

        let m = message("m", 4, 1);
        let picks = (0..4).filter_map(|_| cache.endpoint_for_message(&m)).map(|e| e.id()).collect::<Vec<_>>();
        assert_eq!(picks, vec![1, 3, 1, 3]);

        a.set_waiting(false);
        c.set_waiting(false);
        assert!(cache.endpoint_for_message(&m).is_none());
    }

    #[test]
    fn test_release_requeues_as_delivered() {
        let scx = BrokerContext::default();
        let cache = QueueDestinationCache::new(scx, Destination::queue("q"));
        cache.message_added(message("m", 4, 1)).unwrap();
        let mut h = cache.get_message(None, &Never).unwrap().unwrap();
        h.set_consumer_id(Some(9));
        assert!(cache.is_empty());
        h.release().unwrap();
        let h = cache.get_message(None, &Never).unwrap().unwrap();
        assert!(h.is_delivered());
        assert_eq!(h.consumer_id(), None);
        h.destroy().unwrap();
        assert!(cache.message_cache().is_empty());
    }

    #[test]
    fn test_can_destroy() {
        let scx = BrokerContext::default();
        let cache = QueueDestinationCache::new(scx.clone(), Destination::queue("q"));
        assert!(cache.can_destroy());
        cache.message_added(message("m", 4, 1)).unwrap();
        assert!(!cache.can_destroy());
        let h = cache.get_message(None, &Never).unwrap().unwrap();
        h.destroy().unwrap();
        let c = consumer(&scx, &cache, 1);
        assert!(!cache.can_destroy());
        c.close();
        assert!(cache.can_destroy());
    }

    #[test]
    fn test_expired_message_is_removed() {
        let leases = Arc::new(DefaultLeaseManager::new(Duration::from_secs(1)));
        let scx = BrokerContext::builder(Settings::default()).lease_manager(leases.clone()).build();
        let cache = QueueDestinationCache::new(scx.clone(), Destination::queue("q"));
        let m = Message::new(Destination::queue("q"), "x").with_id("old").with_expiration(timestamp_millis() - 1000);
        cache.message_added(Arc::new(m)).unwrap();
        assert_eq!(cache.lease_count(), 1);
        assert_eq!(leases.len(), 1);

        assert_eq!(leases.expire(timestamp_millis() + 10), 1);
        assert_eq!(cache.lease_count(), 0);
        assert!(cache.is_empty());
        assert!(cache.message_cache().is_empty());
        assert_eq!(scx.stats.messages_expired.count(), 1);
        assert_eq!(scx.stats.leases.count(), 0);
    }

    #[test]
    fn test_consumed_message_cancels_its_lease() {
        let leases = Arc::new(DefaultLeaseManager::new(Duration::from_secs(1)));
        let scx = BrokerContext::builder(Settings::default()).lease_manager(leases.clone()).build();
        let cache = QueueDestinationCache::new(scx.clone(), Destination::queue("q"));
        let m = Message::new(Destination::queue("q"), "x").with_id("m").with_expiration(timestamp_millis() + 60_000);
        cache.message_added(Arc::new(m)).unwrap();
        assert_eq!(cache.lease_count(), 1);

        cache.get_message(None, &Never).unwrap().unwrap().destroy().unwrap();
        assert_eq!(cache.lease_count(), 0);
        assert!(leases.is_empty());
        assert_eq!(scx.stats.leases.count(), 0);

        let again = Message::new(Destination::queue("q"), "x").with_id("m");
        cache.message_added(Arc::new(again)).unwrap();
        assert_eq!(leases.expire(timestamp_millis() + 120_000), 0);
        assert_eq!(cache.len(), 1);
        assert_eq!(scx.stats.messages_expired.count(), 0);
    }

    #[test]
    fn test_destroyed_cache_refuses_arrivals() {
        let scx = BrokerContext::default();
        let cache = QueueDestinationCache::new(scx.clone(), Destination::queue("q"));
        cache.destroy();
        let e = cache.message_added(message("m", 4, 1)).unwrap_err();
        assert!(e.is_cache_closed());
        assert!(cache.is_empty());
        assert!(cache.message_cache().is_empty());
        assert_eq!(scx.stats.handles.count(), 0);
    }

    #[test]
    fn test_try_close_keeps_pending_messages() {
        let scx = BrokerContext::default();
        let cache = QueueDestinationCache::new(scx, Destination::queue("q"));
        cache.message_added(message("m", 4, 1)).unwrap();
        assert!(!cache.try_close());
        assert_eq!(cache.len(), 1);

        let h = cache.get_message(None, &Never).unwrap().unwrap();
        h.destroy().unwrap();
        assert!(cache.try_close());
        assert!(cache.message_added(message("n", 4, 2)).unwrap_err().is_cache_closed());
        assert!(cache.is_empty());
    }
}
