//! Per-destination caches
//!
//! A destination cache owns the [`DefaultMessageCache`] of one destination,
//! the endpoints consuming from it and the expiry leases of its messages.
//! [`QueueDestinationCache`] keeps a shared backlog that competing consumers
//! pull from; [`TopicDestinationCache`] fans every arrival out to its
//! subscribers and keeps nothing for late ones.
//!
//! Lock order: cache state, then the lease manager, then the message cache.
//! Endpoints are notified only after the cache state lock is released.
//! Destroying a message reference cancels its lease.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use rjms_utils::{remaining_millis, timestamp_millis};

use crate::consumer::ConsumerEndpoint;
use crate::context::BrokerContext;
use crate::lease::{Lease, LeaseListener};
use crate::message::{DefaultMessageCache, HandleOwner, MessageCache, MessageHandle, MessageRef};
use crate::queue::MessageQueue;
use crate::store::transact;
use crate::types::{ConsumerId, Destination, HashMap, Message, MessageId, TimestampMillis};
use crate::Result;

mod queue;
mod topic;

pub use queue::QueueDestinationCache;
pub use topic::TopicDestinationCache;

pub trait DestinationCache: HandleOwner + LeaseListener {
    fn destination(&self) -> &Destination;

    ///Returns false if an endpoint with the same id is already registered.
    fn add_consumer(&self, consumer: Arc<ConsumerEndpoint>) -> bool;

    fn remove_consumer(&self, id: ConsumerId) -> Option<Arc<ConsumerEndpoint>>;

    fn has_consumers(&self) -> bool;

    fn consumer_count(&self) -> usize;

    ///Non-persistent arrival. Returns whether anyone took the message.
    fn message_added(&self, message: Arc<Message>) -> Result<bool>;

    ///Persistent arrival, called inside the publisher's store transaction.
    fn persistent_message_added(&self, message: Arc<Message>) -> Result<bool>;

    fn can_destroy(&self) -> bool;

    ///Like `can_destroy`, but a cache answering true also stops taking arrivals.
    #[inline]
    fn try_close(&self) -> bool {
        self.can_destroy()
    }

    fn destroy(&self);

    ///An aggressive pass evicts persistent messages from memory; the store keeps them.
    fn collect_garbage(&self, aggressive: bool);

    fn message_cache(&self) -> &Arc<DefaultMessageCache>;

    ///Registers an expiry lease for the message unless one exists already.
    fn check_message_expiry(&self, msg_ref: &Arc<MessageRef>, expiration: TimestampMillis) -> Result<()>;

    fn lease_count(&self) -> usize;
}

pub(crate) struct CacheState<S> {
    pub(crate) consumers: Vec<Arc<ConsumerEndpoint>>,
    pub(crate) ext: S,
}

struct LeaseEntry {
    lease: Arc<Lease>,
    msg_ref: Weak<MessageRef>,
}

impl LeaseEntry {
    #[inline]
    fn is_for(&self, msg_ref: &MessageRef) -> bool {
        std::ptr::eq(self.msg_ref.as_ptr(), msg_ref)
    }
}

/// Expiry leases of one cache, at most one per live message reference.
///
/// The entry lock is never held while calling into the lease manager.
#[derive(Clone)]
pub(crate) struct LeaseRegistry {
    scx: BrokerContext,
    entries: Arc<Mutex<HashMap<MessageId, LeaseEntry>>>,
}

impl LeaseRegistry {
    fn new(scx: BrokerContext) -> Self {
        Self { scx, entries: Arc::new(Mutex::new(HashMap::default())) }
    }

    /// Returns false if `msg_ref` is leased already. A lease left behind by
    /// an earlier message with the same id is replaced.
    fn insert(&self, msg_ref: &Arc<MessageRef>, lease: Arc<Lease>) -> bool {
        let stale = {
            let mut entries = self.entries.lock();
            if entries.get(msg_ref.id()).map(|e| e.is_for(msg_ref)).unwrap_or(false) {
                return false;
            }
            entries.insert(msg_ref.id().clone(), LeaseEntry { lease, msg_ref: Arc::downgrade(msg_ref) })
        };
        self.scx.stats.leases.inc();
        if let Some(stale) = stale {
            self.scx.stats.leases.dec();
            self.scx.lease_mgr.remove_lease(&stale.lease);
        }
        true
    }

    /// Removes the entry if it still belongs to `lease` and returns the
    /// reference it was taken for.
    fn take(&self, lease: &Lease) -> Option<Weak<MessageRef>> {
        let mut entries = self.entries.lock();
        let owned = entries.get(lease.message_id()).map(|e| e.lease.id() == lease.id()).unwrap_or(false);
        if !owned {
            return None;
        }
        let entry = entries.remove(lease.message_id())?;
        drop(entries);
        self.scx.stats.leases.dec();
        Some(entry.msg_ref)
    }

    /// Cancels the lease of a destroyed reference.
    fn remove(&self, msg_ref: &MessageRef) {
        let entry = {
            let mut entries = self.entries.lock();
            if !entries.get(msg_ref.id()).map(|e| e.is_for(msg_ref)).unwrap_or(false) {
                return;
            }
            entries.remove(msg_ref.id())
        };
        if let Some(entry) = entry {
            self.scx.stats.leases.dec();
            self.scx.lease_mgr.remove_lease(&entry.lease);
        }
    }

    fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        self.scx.stats.leases.decs(entries.len() as isize);
        for entry in entries.values() {
            self.scx.lease_mgr.remove_lease(&entry.lease);
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// State and behaviour common to queue and topic caches.
pub(crate) struct CacheCore<S> {
    pub(crate) destination: Destination,
    pub(crate) scx: BrokerContext,
    pub(crate) cache: Arc<DefaultMessageCache>,
    leases: LeaseRegistry,
    state: Mutex<CacheState<S>>,
}

impl<S: Default> CacheCore<S> {
    pub(crate) fn new(scx: BrokerContext, destination: Destination) -> Self {
        let leases = LeaseRegistry::new(scx.clone());
        let registry = leases.clone();
        Self {
            cache: DefaultMessageCache::with_destroy_listener(scx.clone(), move |msg_ref| registry.remove(msg_ref)),
            leases,
            destination,
            scx,
            state: Mutex::new(CacheState { consumers: Vec::new(), ext: S::default() }),
        }
    }
}

impl<S> CacheCore<S> {
    #[inline]
    pub(crate) fn state(&self) -> MutexGuard<'_, CacheState<S>> {
        self.state.lock()
    }

    pub(crate) fn add_consumer(&self, consumer: Arc<ConsumerEndpoint>) -> bool {
        let mut state = self.state.lock();
        if state.consumers.iter().any(|c| c.id() == consumer.id()) {
            return false;
        }
        log::debug!("{} add consumer {}", self.destination, consumer.id());
        state.consumers.push(consumer);
        true
    }

    pub(crate) fn remove_consumer(&self, id: ConsumerId) -> Option<Arc<ConsumerEndpoint>> {
        let mut state = self.state.lock();
        let pos = state.consumers.iter().position(|c| c.id() == id)?;
        log::debug!("{} remove consumer {}", self.destination, id);
        Some(state.consumers.remove(pos))
    }

    #[inline]
    pub(crate) fn consumers(&self) -> Vec<Arc<ConsumerEndpoint>> {
        self.state.lock().consumers.clone()
    }

    #[inline]
    pub(crate) fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    pub(crate) fn check_message_expiry(
        &self,
        listener: Weak<dyn LeaseListener>,
        msg_ref: &Arc<MessageRef>,
        expiration: TimestampMillis,
    ) -> Result<()> {
        if expiration <= 0 || msg_ref.is_destroyed() {
            return Ok(());
        }
        let duration = remaining_millis(expiration, timestamp_millis());
        let lease = Arc::new(Lease::new(msg_ref.id().clone(), duration, listener));
        if !self.leases.insert(msg_ref, lease.clone()) {
            return Ok(());
        }
        if let Err(e) = self.scx.lease_mgr.add_lease(lease.clone()) {
            self.leases.take(&lease);
            return Err(e);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn lease_count(&self) -> usize {
        self.leases.len()
    }

    /// Expires the leased message inside a store transaction.
    ///
    /// `notify` removes the message from whatever holds handles to it; the
    /// reference is then destroyed. Failures are logged and swallowed.
    pub(crate) fn expire<F>(&self, lease: &Lease, notify: F)
    where
        F: FnOnce(&Arc<MessageRef>) -> Result<()>,
    {
        let msg_ref = match self.leases.take(lease).and_then(|r| r.upgrade()) {
            Some(r) => r,
            None => return,
        };
        match self.cache.get_message_ref(msg_ref.id()) {
            Some(current) if Arc::ptr_eq(&current, &msg_ref) => {}
            _ => {
                log::debug!("{} ignore stale lease of message {}", self.destination, msg_ref.id());
                return;
            }
        }
        let store = self.scx.store.as_ref();
        let res = transact(store, || {
            notify(&msg_ref)?;
            for c in self.consumers() {
                c.message_removed(msg_ref.id());
            }
            if msg_ref.is_persistent() {
                store.remove_expired_message_handles(&self.destination, timestamp_millis())?;
            }
            msg_ref.destroy()
        });
        match res {
            Ok(()) => {
                self.scx.stats.messages_expired.inc();
                log::debug!("{} message {} expired", self.destination, msg_ref.id());
            }
            Err(e) => {
                log::warn!("{} failed to expire message {}, {}", self.destination, msg_ref.id(), e);
            }
        }
    }

    pub(crate) fn collect_garbage(&self, aggressive: bool) {
        if aggressive {
            let n = self.cache.clear_persistent_messages();
            if n > 0 {
                log::debug!("{} evicted {} persistent messages", self.destination, n);
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.leases.clear();
        self.cache.clear();
    }
}

/// A handle queue whose size is tracked by `stats.handles`.
pub(crate) fn handle_queue(scx: &BrokerContext) -> MessageQueue {
    let mut messages = MessageQueue::new();
    let c = scx.clone();
    messages.on_push(move || c.stats.handles.inc());
    let c = scx.clone();
    messages.on_pop(move || c.stats.handles.dec());
    messages
}

/// Destroys a handle, logging instead of failing.
#[inline]
pub(crate) fn destroy_quietly(handle: MessageHandle) {
    let id = handle.id().clone();
    if let Err(e) = handle.destroy() {
        log::debug!("failed to destroy handle of message {}, {}", id, e);
    }
}
