//! Consumer and durable subscription bookkeeping

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytestring::ByteString;
use itertools::Itertools;
use parking_lot::Mutex;

use crate::cache::QueueDestinationCache;
use crate::consumer::{ConsumerEndpoint, DurableConsumer, QueueBrowser, QueueConsumer, TopicConsumer};
use crate::context::BrokerContext;
use crate::destination_mgr::{CacheEntry, DestinationEventListener, DestinationManager};
use crate::selector::parse_selector;
use crate::store::transact;
use crate::topic::Topic;
use crate::types::{ConnectionId, ConsumerId, Destination, HashMap, SubscriptionName};
use crate::{BrokerError, Result};

/// Registry key of an endpoint: the subscription name for durable
/// consumers, the numeric id otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConsumerKey {
    Id(ConsumerId),
    Durable(SubscriptionName),
}

impl ConsumerKey {
    #[inline]
    fn of(endpoint: &ConsumerEndpoint) -> Self {
        match endpoint.persistent_id() {
            Some(name) => ConsumerKey::Durable(name.clone()),
            None => ConsumerKey::Id(endpoint.id()),
        }
    }
}

#[derive(Default)]
struct Registry {
    consumers: HashMap<ConsumerKey, Arc<ConsumerEndpoint>>,
    ids: HashMap<ConsumerId, ConsumerKey>,
    by_destination: HashMap<Destination, Vec<ConsumerKey>>,
    wildcards: HashMap<ConsumerKey, Destination>,
}

impl Registry {
    fn insert(&mut self, endpoint: Arc<ConsumerEndpoint>) {
        let key = ConsumerKey::of(&endpoint);
        let destination = endpoint.destination().clone();
        if destination.is_wildcard() {
            self.wildcards.insert(key.clone(), destination.clone());
        }
        self.by_destination.entry(destination).or_default().push(key.clone());
        self.ids.insert(endpoint.id(), key.clone());
        self.consumers.insert(key, endpoint);
    }

    fn remove(&mut self, key: &ConsumerKey) -> Option<Arc<ConsumerEndpoint>> {
        let endpoint = self.consumers.remove(key)?;
        self.ids.remove(&endpoint.id());
        self.wildcards.remove(key);
        let destination = endpoint.destination();
        let empty = match self.by_destination.get_mut(destination) {
            Some(keys) => {
                keys.retain(|k| k != key);
                keys.is_empty()
            }
            None => false,
        };
        if empty {
            self.by_destination.remove(destination);
        }
        Some(endpoint)
    }
}

pub struct ConsumerManager {
    me: Weak<ConsumerManager>,
    scx: BrokerContext,
    destinations: Arc<DestinationManager>,
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

impl ConsumerManager {
    /// Creates the manager and subscribes it to cache lifecycle events so
    /// that subscribers follow topic caches as they come and go.
    pub fn new(scx: BrokerContext, destinations: Arc<DestinationManager>) -> Arc<Self> {
        let mgr = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            scx,
            destinations: destinations.clone(),
            next_id: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
        });
        let listener: Weak<dyn DestinationEventListener> = mgr.me.clone();
        destinations.add_listener(listener);
        mgr
    }

    #[inline]
    fn next_id(&self) -> ConsumerId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Recreates the stored durable subscriptions, inactive.
    pub fn init(&self) -> Result<usize> {
        let subscriptions = self.scx.store.get_all_durable_consumers()?;
        for (name, topic) in subscriptions.iter() {
            let endpoint = self.create_durable_endpoint(name.clone(), topic.clone())?;
            self.register(endpoint);
            self.scx.stats.durable_subscriptions.inc();
        }
        if !subscriptions.is_empty() {
            log::info!(
                "loaded {} durable subscriptions, {}",
                subscriptions.len(),
                subscriptions.iter().map(|(name, topic)| format!("{}@{}", name, topic)).join(", ")
            );
        }
        Ok(subscriptions.len())
    }

    fn register(&self, endpoint: Arc<ConsumerEndpoint>) {
        self.registry.lock().insert(endpoint.clone());
        //a topic cache created while the endpoint was being built would otherwise be missed
        if endpoint.is_subscriber() {
            for cache in self.destinations.get_topic_destination_caches(endpoint.destination()) {
                endpoint.attach_cache(&cache);
            }
        }
    }

    /// Creates an endpoint on the queue cache of `destination`. If garbage
    /// collection drops that cache before the endpoint is attached, the
    /// endpoint is closed and created again on the new cache.
    fn attach_to_queue<F>(&self, destination: &Destination, create: F) -> Result<Arc<ConsumerEndpoint>>
    where
        F: Fn(Arc<QueueDestinationCache>) -> Arc<ConsumerEndpoint>,
    {
        loop {
            let cache = self.destinations.get_queue_cache(destination)?;
            let endpoint = create(cache.clone());
            if self.destinations.is_current(&CacheEntry::Queue(cache)) {
                return Ok(endpoint);
            }
            log::debug!("cache of {} collected while attaching consumer {}, retry", destination, endpoint.id());
            endpoint.close();
        }
    }

    fn validate_topic(topic: &Destination) -> Result<()> {
        if !topic.is_topic() {
            return Err(BrokerError::InvalidDestination(format!("{} is not a topic", topic)));
        }
        Topic::from_str(&topic.name)?;
        Ok(())
    }

    /// Creates a queue or topic consumer. Topic consumers may use a pattern.
    pub fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        no_local: bool,
        connection_id: Option<ConnectionId>,
    ) -> Result<Arc<ConsumerEndpoint>> {
        let selector = parse_selector(self.scx.selectors.as_ref(), selector)?;
        let store = self.scx.store.as_ref();
        let endpoint = transact(store, || {
            if destination.is_queue() {
                return self.attach_to_queue(destination, |cache| {
                    QueueConsumer::create(self.scx.clone(), self.next_id(), cache, selector.clone(), connection_id)
                });
            }
            Self::validate_topic(destination)?;
            let caches = if destination.is_wildcard() {
                self.destinations.get_topic_destination_caches(destination)
            } else {
                vec![self.destinations.get_topic_cache(destination)?]
            };
            Ok(TopicConsumer::create(
                self.scx.clone(),
                self.next_id(),
                destination.clone(),
                caches,
                selector.clone(),
                no_local,
                connection_id,
            ))
        })?;
        self.register(endpoint.clone());
        Ok(endpoint)
    }

    pub fn create_browser(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        connection_id: Option<ConnectionId>,
    ) -> Result<Arc<ConsumerEndpoint>> {
        if !destination.is_queue() {
            return Err(BrokerError::InvalidDestination(format!("cannot browse {}", destination)));
        }
        let selector = parse_selector(self.scx.selectors.as_ref(), selector)?;
        let endpoint = self.attach_to_queue(destination, |cache| {
            QueueBrowser::create(self.scx.clone(), self.next_id(), cache, selector.clone(), connection_id)
        })?;
        self.register(endpoint.clone());
        Ok(endpoint)
    }

    fn create_durable_endpoint(&self, name: SubscriptionName, topic: Destination) -> Result<Arc<ConsumerEndpoint>> {
        let caches = self.destinations.get_topic_destination_caches(&topic);
        let resolver = |d: &Destination| self.destinations.get_topic_cache(d);
        DurableConsumer::create(self.scx.clone(), self.next_id(), name, topic, caches, &resolver, None, false, None)
    }

    /// Creates the durable subscription `name` on `topic`, inactive.
    ///
    /// An existing subscription on the same topic is returned as is; one on
    /// another topic is replaced, which fails while it is active.
    pub fn subscribe(&self, name: &str, topic: &Destination) -> Result<Arc<ConsumerEndpoint>> {
        Self::validate_topic(topic)?;
        let name = ByteString::from(name);
        if let Some(existing) = self.get_durable(&name) {
            if existing.destination() == topic {
                return Ok(existing);
            }
            log::info!("durable subscription {} moves from {} to {}", name, existing.destination(), topic);
            self.unsubscribe(&name)?;
        }
        let store = self.scx.store.as_ref();
        let endpoint = transact(store, || {
            store.add_durable_consumer(topic, &name)?;
            self.create_durable_endpoint(name.clone(), topic.clone())
        })?;
        {
            let mut registry = self.registry.lock();
            let key = ConsumerKey::Durable(name.clone());
            if let Some(raced) = registry.consumers.get(&key).cloned() {
                drop(registry);
                endpoint.abandon();
                return Ok(raced);
            }
            registry.insert(endpoint.clone());
        }
        self.register_late_caches(&endpoint);
        self.scx.stats.durable_subscriptions.inc();
        log::info!("durable subscription {} on {} created", name, topic);
        Ok(endpoint)
    }

    #[inline]
    fn register_late_caches(&self, endpoint: &ConsumerEndpoint) {
        for cache in self.destinations.get_topic_destination_caches(endpoint.destination()) {
            endpoint.attach_cache(&cache);
        }
    }

    /// Subscribes if needed and activates the subscription for a session.
    pub fn create_durable_consumer(
        &self,
        name: &str,
        topic: &Destination,
        selector: Option<&str>,
        no_local: bool,
        connection_id: Option<ConnectionId>,
    ) -> Result<Arc<ConsumerEndpoint>> {
        let selector = parse_selector(self.scx.selectors.as_ref(), selector)?;
        if let Some(existing) = self.get_durable(name) {
            if existing.is_active() {
                return Err(BrokerError::DurableSubscriptionActive(name.into()));
            }
        }
        let endpoint = self.subscribe(name, topic)?;
        endpoint.activate(connection_id, selector, no_local)?;
        Ok(endpoint)
    }

    /// Removes an inactive durable subscription with everything it holds.
    pub fn unsubscribe(&self, name: &str) -> Result<()> {
        let endpoint =
            self.get_durable(name).ok_or_else(|| BrokerError::DurableSubscriptionNotFound(name.into()))?;
        if endpoint.is_active() {
            return Err(BrokerError::DurableSubscriptionActive(name.into()));
        }
        let store = self.scx.store.as_ref();
        transact(store, || {
            store.remove_durable_consumer(name)?;
            endpoint.close();
            Ok(())
        })?;
        self.registry.lock().remove(&ConsumerKey::Durable(name.into()));
        self.scx.stats.durable_subscriptions.dec();
        log::info!("durable subscription {} removed", name);
        Ok(())
    }

    /// Closes a consumer for its session.
    ///
    /// An active durable subscription is deactivated and kept; an inactive
    /// one is left alone. Every other endpoint is closed and forgotten.
    /// Failures are logged, not returned.
    pub fn close_consumer(&self, id: ConsumerId) -> Result<()> {
        let endpoint = self.get_consumer(id).ok_or_else(|| BrokerError::ConsumerNotFound(id.to_string()))?;
        if endpoint.is_durable() {
            if endpoint.is_active() {
                if let Err(e) = endpoint.deactivate() {
                    log::warn!("failed to deactivate consumer {}, {}", id, e);
                }
            }
            return Ok(());
        }
        let key = ConsumerKey::of(&endpoint);
        let res = transact(self.scx.store.as_ref(), || {
            self.registry.lock().remove(&key);
            endpoint.close();
            Ok(())
        });
        if let Err(e) = res {
            log::warn!("failed to close consumer {}, {}", id, e);
        }
        Ok(())
    }

    /// Closes every consumer opened by a connection.
    pub fn close_connection(&self, connection_id: ConnectionId) -> usize {
        let ids = self
            .registry
            .lock()
            .consumers
            .values()
            .filter(|c| c.connection_id() == Some(connection_id) && c.is_active())
            .map(|c| c.id())
            .collect::<Vec<_>>();
        for id in ids.iter() {
            if let Err(e) = self.close_consumer(*id) {
                log::debug!("consumer {} went away while closing connection {}, {}", id, connection_id, e);
            }
        }
        ids.len()
    }

    #[inline]
    pub fn get_consumer(&self, id: ConsumerId) -> Option<Arc<ConsumerEndpoint>> {
        let registry = self.registry.lock();
        registry.ids.get(&id).and_then(|key| registry.consumers.get(key)).cloned()
    }

    #[inline]
    pub fn get_durable(&self, name: &str) -> Option<Arc<ConsumerEndpoint>> {
        self.registry.lock().consumers.get(&ConsumerKey::Durable(name.into())).cloned()
    }

    pub fn durable_subscriptions(&self) -> Vec<(SubscriptionName, Destination)> {
        self.registry
            .lock()
            .consumers
            .iter()
            .filter_map(|(key, c)| match key {
                ConsumerKey::Durable(name) => Some((name.clone(), c.destination().clone())),
                ConsumerKey::Id(_) => None,
            })
            .collect()
    }

    /// Endpoints registered directly on `destination`.
    pub fn consumers_of(&self, destination: &Destination) -> Vec<Arc<ConsumerEndpoint>> {
        let registry = self.registry.lock();
        registry
            .by_destination
            .get(destination)
            .map(|keys| keys.iter().filter_map(|k| registry.consumers.get(k)).cloned().collect())
            .unwrap_or_default()
    }

    /// Endpoints subscribed with a topic pattern.
    pub fn wildcard_subscribers(&self) -> Vec<Arc<ConsumerEndpoint>> {
        let registry = self.registry.lock();
        registry.wildcards.keys().filter_map(|k| registry.consumers.get(k)).cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.registry.lock().consumers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every non-durable endpoint and deactivates the durable ones.
    pub fn close(&self) {
        let endpoints = self.registry.lock().consumers.values().cloned().collect::<Vec<_>>();
        for endpoint in endpoints {
            if let Err(e) = self.close_consumer(endpoint.id()) {
                log::debug!("close consumer {}, {}", endpoint.id(), e);
            }
        }
    }
}

impl DestinationEventListener for ConsumerManager {
    fn cache_added(&self, destination: &Destination, cache: &CacheEntry) {
        let topic_cache = match cache.topic() {
            Some(c) => c,
            None => return,
        };
        let subscribers = {
            let registry = self.registry.lock();
            let mut subscribers = registry.by_destination.get(destination).cloned().unwrap_or_default();
            subscribers.extend(
                registry.wildcards.iter().filter(|(_, pattern)| pattern.matches(destination)).map(|(k, _)| k.clone()),
            );
            subscribers.into_iter().filter_map(|k| registry.consumers.get(&k).cloned()).collect::<Vec<_>>()
        };
        for s in subscribers.iter().filter(|s| s.is_subscriber()) {
            if s.attach_cache(topic_cache) {
                log::debug!("consumer {} follows {}", s.id(), destination);
            }
        }
    }
}
