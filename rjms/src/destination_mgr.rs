//! Destination and cache lifecycle
//!
//! The [`DestinationManager`] is the registry of destinations and of the
//! caches instantiated for them. Caches are created on first use and swept
//! by [`DestinationManager::collect_garbage`] once nothing needs them.
//! Lifecycle events are delivered to [`DestinationEventListener`]s after the
//! registry lock is released.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::cache::{DestinationCache, QueueDestinationCache, TopicDestinationCache};
use crate::context::BrokerContext;
use crate::store::transact;
use crate::topic::Topic;
use crate::types::{ConnectionId, Destination, DestinationKind, HashMap};
use crate::{BrokerError, Result};

#[derive(Clone)]
pub enum CacheEntry {
    Queue(Arc<QueueDestinationCache>),
    Topic(Arc<TopicDestinationCache>),
}

impl CacheEntry {
    #[inline]
    pub fn as_cache(&self) -> &dyn DestinationCache {
        match self {
            CacheEntry::Queue(c) => c.as_ref(),
            CacheEntry::Topic(c) => c.as_ref(),
        }
    }

    #[inline]
    pub fn destination(&self) -> &Destination {
        self.as_cache().destination()
    }

    #[inline]
    pub fn queue(&self) -> Option<&Arc<QueueDestinationCache>> {
        match self {
            CacheEntry::Queue(c) => Some(c),
            CacheEntry::Topic(_) => None,
        }
    }

    #[inline]
    pub fn topic(&self) -> Option<&Arc<TopicDestinationCache>> {
        match self {
            CacheEntry::Topic(c) => Some(c),
            CacheEntry::Queue(_) => None,
        }
    }

    #[inline]
    fn same(&self, other: &CacheEntry) -> bool {
        match (self, other) {
            (CacheEntry::Queue(a), CacheEntry::Queue(b)) => Arc::ptr_eq(a, b),
            (CacheEntry::Topic(a), CacheEntry::Topic(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Destination and cache lifecycle events.
pub trait DestinationEventListener: Sync + Send {
    #[inline]
    fn destination_added(&self, _destination: &Destination) {}

    #[inline]
    fn destination_removed(&self, _destination: &Destination) {}

    #[inline]
    fn cache_added(&self, _destination: &Destination, _cache: &CacheEntry) {}

    #[inline]
    fn cache_removed(&self, _destination: &Destination) {}
}

enum Event {
    DestinationAdded(Destination),
    DestinationRemoved(Destination),
    CacheAdded(CacheEntry),
    CacheRemoved(Destination),
}

#[derive(Default)]
struct Registry {
    destinations: HashMap<Destination, Destination>,
    caches: HashMap<Destination, CacheEntry>,
}

pub struct DestinationManager {
    scx: BrokerContext,
    registry: Mutex<Registry>,
    listeners: RwLock<Vec<Weak<dyn DestinationEventListener>>>,
    temp_seq: AtomicU64,
}

impl DestinationManager {
    pub fn new(scx: BrokerContext) -> Self {
        Self {
            scx,
            registry: Mutex::new(Registry::default()),
            listeners: RwLock::new(Vec::new()),
            temp_seq: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn add_listener(&self, listener: Weak<dyn DestinationEventListener>) {
        self.listeners.write().push(listener);
    }

    fn fire(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let listeners = {
            let mut listeners = self.listeners.write();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(|l| l.upgrade()).collect::<Vec<_>>()
        };
        for event in events.iter() {
            for l in listeners.iter() {
                match event {
                    Event::DestinationAdded(d) => l.destination_added(d),
                    Event::DestinationRemoved(d) => l.destination_removed(d),
                    Event::CacheAdded(c) => l.cache_added(c.destination(), c),
                    Event::CacheRemoved(d) => l.cache_removed(d),
                }
            }
        }
    }

    /// Loads the administered destinations from the store and instantiates
    /// the queue caches so their backlog is available.
    pub fn init(&self) -> Result<usize> {
        let destinations = self.scx.store.get_all_destinations()?;
        let mut events = Vec::new();
        {
            let mut registry = self.registry.lock();
            for d in destinations.iter() {
                if registry.destinations.insert(d.clone(), d.clone()).is_none() {
                    self.scx.stats.destinations.inc();
                    events.push(Event::DestinationAdded(d.clone()));
                }
            }
        }
        self.fire(events);
        for d in destinations.iter().filter(|d| d.is_queue()) {
            self.get_destination_cache(d)?;
        }
        log::info!("loaded {} destinations", destinations.len());
        Ok(destinations.len())
    }

    fn validate(destination: &Destination) -> Result<()> {
        if destination.name.trim().is_empty() {
            return Err(BrokerError::InvalidDestination("empty destination name".into()));
        }
        if destination.is_topic() {
            let topic = Topic::from_str(&destination.name)?;
            if topic.has_wildcard() {
                return Err(BrokerError::InvalidDestination(format!("{} is a pattern", destination)));
            }
        }
        Ok(())
    }

    /// The registered destination with the same identity, carrying its
    /// persistence and ownership attributes.
    #[inline]
    pub fn get_destination(&self, destination: &Destination) -> Option<Destination> {
        self.registry.lock().destinations.get(destination).cloned()
    }

    #[inline]
    pub fn exists(&self, destination: &Destination) -> bool {
        self.registry.lock().destinations.contains_key(destination)
    }

    #[inline]
    pub fn destinations(&self) -> Vec<Destination> {
        self.registry.lock().destinations.values().cloned().collect()
    }

    /// Registers a destination. Persistent destinations are written to the
    /// store first.
    pub fn create_destination(&self, destination: Destination) -> Result<Destination> {
        Self::validate(&destination)?;
        if self.exists(&destination) {
            return Err(BrokerError::DestinationExists(destination.to_string()));
        }
        if destination.persistent {
            transact(self.scx.store.as_ref(), || self.scx.store.add_destination(&destination))?;
        }
        {
            let mut registry = self.registry.lock();
            if registry.destinations.contains_key(&destination) {
                return Err(BrokerError::DestinationExists(destination.to_string()));
            }
            registry.destinations.insert(destination.clone(), destination.clone());
        }
        self.scx.stats.destinations.inc();
        log::info!("create destination {}", destination);
        self.fire(vec![Event::DestinationAdded(destination.clone())]);
        Ok(destination)
    }

    /// Returns the registered destination, creating a non-persistent one
    /// when auto creation is enabled.
    pub fn ensure_destination(&self, destination: &Destination) -> Result<Destination> {
        if let Some(d) = self.get_destination(destination) {
            return Ok(d);
        }
        if destination.is_temporary() || !self.scx.settings.broker.auto_create_destinations {
            return Err(BrokerError::InvalidDestination(format!("{} does not exist", destination)));
        }
        match self.create_destination(destination.clone()) {
            Err(BrokerError::DestinationExists(_)) => self
                .get_destination(destination)
                .ok_or_else(|| BrokerError::InvalidDestination(format!("{} does not exist", destination))),
            res => res,
        }
    }

    /// Unregisters a destination, destroying its cache. Fails while the
    /// destination still has consumers.
    pub fn remove_destination(&self, destination: &Destination) -> Result<()> {
        let (registered, cache) = {
            let registry = self.registry.lock();
            let registered = registry
                .destinations
                .get(destination)
                .cloned()
                .ok_or_else(|| BrokerError::InvalidDestination(format!("{} does not exist", destination)))?;
            (registered, registry.caches.get(destination).cloned())
        };
        if let Some(cache) = cache.as_ref() {
            if cache.as_cache().has_consumers() {
                return Err(BrokerError::DestinationInUse(destination.to_string()));
            }
        }
        if registered.persistent {
            transact(self.scx.store.as_ref(), || self.scx.store.remove_destination(&registered))?;
        }
        let mut events = Vec::new();
        {
            let mut registry = self.registry.lock();
            if let Some(cache) = registry.caches.remove(destination) {
                cache.as_cache().destroy();
                self.scx.stats.caches.dec();
                events.push(Event::CacheRemoved(destination.clone()));
            }
            if registry.destinations.remove(destination).is_some() {
                self.scx.stats.destinations.dec();
                events.push(Event::DestinationRemoved(registered.clone()));
            }
        }
        log::info!("remove destination {}", registered);
        self.fire(events);
        Ok(())
    }

    /// Creates a temporary destination owned by `connection_id`.
    pub fn create_temporary_destination(
        &self,
        kind: DestinationKind,
        connection_id: ConnectionId,
    ) -> Result<Destination> {
        let seq = self.temp_seq.fetch_add(1, Ordering::SeqCst);
        let name = format!("temp.{}.{}.{}", kind, connection_id, seq);
        self.create_destination(Destination::temporary(kind, name, connection_id))
    }

    /// Drops the temporary destinations of a closed connection. Those still
    /// in use are kept and returned.
    pub fn remove_temporary_destinations(&self, connection_id: ConnectionId) -> Vec<Destination> {
        let owned = self
            .registry
            .lock()
            .destinations
            .values()
            .filter(|d| d.owner == Some(connection_id))
            .cloned()
            .collect::<Vec<_>>();
        let mut in_use = Vec::new();
        for d in owned {
            match self.remove_destination(&d) {
                Ok(()) => {}
                Err(BrokerError::DestinationInUse(_)) => {
                    log::warn!("temporary destination {} of connection {} is still in use", d, connection_id);
                    in_use.push(d);
                }
                Err(e) => log::warn!("failed to remove temporary destination {}, {}", d, e),
            }
        }
        in_use
    }

    #[inline]
    pub fn get_cache(&self, destination: &Destination) -> Option<CacheEntry> {
        self.registry.lock().caches.get(destination).cloned()
    }

    /// Returns the cache of a destination, creating it on first use.
    pub fn get_destination_cache(&self, destination: &Destination) -> Result<CacheEntry> {
        if let Some(cache) = self.get_cache(destination) {
            return Ok(cache);
        }
        let destination = self.ensure_destination(destination)?;
        let created = match destination.kind {
            DestinationKind::Queue => {
                let cache = QueueDestinationCache::new(self.scx.clone(), destination.clone());
                cache.init()?;
                CacheEntry::Queue(cache)
            }
            DestinationKind::Topic => CacheEntry::Topic(TopicDestinationCache::new(self.scx.clone(), destination.clone())),
        };
        let cache = {
            let mut registry = self.registry.lock();
            registry.caches.entry(destination.clone()).or_insert_with(|| created.clone()).clone()
        };
        if !cache.same(&created) {
            return Ok(cache);
        }
        self.scx.stats.caches.inc();
        log::debug!("create cache for {}", destination);
        self.fire(vec![Event::CacheAdded(cache.clone())]);
        Ok(cache)
    }

    pub fn get_queue_cache(&self, destination: &Destination) -> Result<Arc<QueueDestinationCache>> {
        if !destination.is_queue() {
            return Err(BrokerError::InvalidDestination(format!("{} is not a queue", destination)));
        }
        self.get_destination_cache(destination)?
            .queue()
            .cloned()
            .ok_or_else(|| BrokerError::InvalidDestination(destination.to_string()))
    }

    pub fn get_topic_cache(&self, destination: &Destination) -> Result<Arc<TopicDestinationCache>> {
        if !destination.is_topic() || destination.is_wildcard() {
            return Err(BrokerError::InvalidDestination(format!("{} is not a topic", destination)));
        }
        self.get_destination_cache(destination)?
            .topic()
            .cloned()
            .ok_or_else(|| BrokerError::InvalidDestination(destination.to_string()))
    }

    /// The instantiated topic caches a subscriber of `topic` listens to.
    pub fn get_topic_destination_caches(&self, topic: &Destination) -> Vec<Arc<TopicDestinationCache>> {
        self.registry
            .lock()
            .caches
            .iter()
            .filter(|(d, _)| topic.matches(d))
            .filter_map(|(_, c)| c.topic().cloned())
            .collect()
    }

    /// Whether `cache` is still the registered cache of its destination.
    #[inline]
    pub fn is_current(&self, cache: &CacheEntry) -> bool {
        self.registry.lock().caches.get(cache.destination()).map(|c| c.same(cache)).unwrap_or(false)
    }

    pub fn caches(&self) -> Vec<CacheEntry> {
        self.registry.lock().caches.values().cloned().collect()
    }

    /// Destroys the caches nobody needs and unregisters the transient
    /// destinations left without a cache. Errors are logged, never returned.
    pub fn collect_garbage(&self, aggressive: bool) {
        let aggressive = aggressive || self.over_cache_limit();
        let mut events = Vec::new();
        for cache in self.caches() {
            let c = cache.as_cache();
            if !c.can_destroy() {
                c.collect_garbage(aggressive);
                continue;
            }
            let removed = {
                let mut registry = self.registry.lock();
                match registry.caches.get(c.destination()) {
                    Some(current) if current.same(&cache) && c.try_close() => {
                        registry.caches.remove(c.destination());
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                c.destroy();
                self.scx.stats.caches.dec();
                log::debug!("collect cache of {}", c.destination());
                events.push(Event::CacheRemoved(c.destination().clone()));
            }
        }

        {
            let mut registry = self.registry.lock();
            let Registry { destinations, caches } = &mut *registry;
            let connections = self.scx.connections.as_ref();
            destinations.retain(|d, _| {
                let keep = d.persistent
                    || caches.contains_key(d)
                    || d.owner.map(|owner| connections.is_alive(owner)).unwrap_or(false);
                if !keep {
                    self.scx.stats.destinations.dec();
                    events.push(Event::DestinationRemoved(d.clone()));
                }
                keep
            });
        }
        self.fire(events);
    }

    #[inline]
    fn over_cache_limit(&self) -> bool {
        let max = self.scx.settings.broker.message_cache_max;
        max > 0 && self.scx.stats.messages_cached.count() > max as isize
    }

    /// Destroys every cache. Stored state is left alone.
    pub fn close(&self) {
        let caches = std::mem::take(&mut self.registry.lock().caches);
        self.scx.stats.caches.decs(caches.len() as isize);
        for cache in caches.values() {
            cache.as_cache().destroy();
        }
    }
}
