//! Broker facade
//!
//! [`Broker`] wires a [`BrokerContext`] to the destination, consumer and
//! message managers and owns the background drivers:
//!
//! ```text
//!   publish ──> MessageMgr ──> DestinationManager ──> queue / topic cache
//!                                                       │
//!   receive <── ConsumerEndpoint <── ConsumerManager <──┘
//!
//!   start(): lease timer task + periodic garbage collection task
//! ```

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytestring::ByteString;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::conf::Settings;
use crate::connection::{Connection, ConnectionManager, DefaultConnectionManager};
use crate::consumer::ConsumerEndpoint;
use crate::consumer_mgr::ConsumerManager;
use crate::context::BrokerContext;
use crate::destination_mgr::DestinationManager;
use crate::lease::LeaseManager;
use crate::message::MessageHandle;
use crate::message_mgr::MessageMgr;
use crate::selector::SelectorFactory;
use crate::stats::Stats;
use crate::store::{transact, MessageStore};
use crate::types::{ConnectionId, ConsumerId, Destination, DestinationKind, Message, MessageId};
use crate::xa::DefaultTransactionLog;
use crate::{BrokerError, Result};

#[cfg(test)]
mod tests;

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

pub struct BrokerInner {
    pub scx: BrokerContext,
    pub connections: Arc<DefaultConnectionManager>,
    pub destinations: Arc<DestinationManager>,
    pub consumers: Arc<ConsumerManager>,
    pub messages: Arc<MessageMgr>,
    pub xa: Arc<DefaultTransactionLog>,
    initialized: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Deref for Broker {
    type Target = BrokerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl Broker {
    #[inline]
    pub fn new(settings: Settings) -> Self {
        Self::builder(settings).build()
    }

    #[inline]
    pub fn builder(settings: Settings) -> BrokerBuilder {
        BrokerBuilder { settings, store: None, lease_mgr: None, selectors: None }
    }

    /// Recovers stored destinations and durable subscriptions. Runs once.
    pub fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let destinations = self.destinations.init()?;
        let durables = self.consumers.init()?;
        log::info!("broker recovered {} destinations and {} durable subscriptions", destinations, durables);
        Ok(())
    }

    /// Initializes the broker and spawns the lease timer and the garbage
    /// collection sweep. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.init()?;
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        if let Some(timer) = self.scx.lease_mgr.clone().start() {
            tasks.push(timer);
        }
        let broker = &self.scx.settings.broker;
        if broker.gc_interval > Duration::ZERO {
            tasks.push(Self::spawn_gc(Arc::downgrade(&self.inner), broker.gc_interval, broker.gc_aggressive));
        }
        log::info!("broker started");
        Ok(())
    }

    fn spawn_gc(inner: Weak<BrokerInner>, interval: Duration, aggressive: bool) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match inner.upgrade() {
                    Some(inner) => inner.destinations.collect_garbage(aggressive),
                    None => break,
                }
            }
            log::debug!("garbage collection stopped");
        })
    }

    /// Stops the background tasks, closes all consumers and drops every cache.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.consumers.close();
        self.destinations.close();
        log::info!("broker shut down");
    }

    #[inline]
    pub fn stats(&self) -> &Stats {
        &self.scx.stats
    }

    #[inline]
    pub fn publish(&self, message: Message) -> Result<MessageId> {
        self.messages.add(message)
    }

    #[inline]
    pub fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        no_local: bool,
        connection_id: Option<ConnectionId>,
    ) -> Result<Arc<ConsumerEndpoint>> {
        self.consumers.create_consumer(destination, selector, no_local, connection_id)
    }

    #[inline]
    pub fn create_durable_consumer(
        &self,
        name: &str,
        topic: &Destination,
        selector: Option<&str>,
        no_local: bool,
        connection_id: Option<ConnectionId>,
    ) -> Result<Arc<ConsumerEndpoint>> {
        self.consumers.create_durable_consumer(name, topic, selector, no_local, connection_id)
    }

    #[inline]
    pub fn create_browser(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        connection_id: Option<ConnectionId>,
    ) -> Result<Arc<ConsumerEndpoint>> {
        self.consumers.create_browser(destination, selector, connection_id)
    }

    #[inline]
    pub fn close_consumer(&self, id: ConsumerId) -> Result<()> {
        self.consumers.close_consumer(id)
    }

    #[inline]
    pub fn subscribe(&self, name: &str, topic: &Destination) -> Result<Arc<ConsumerEndpoint>> {
        self.consumers.subscribe(name, topic)
    }

    #[inline]
    pub fn unsubscribe(&self, name: &str) -> Result<()> {
        self.consumers.unsubscribe(name)
    }

    /// Acknowledges a received message.
    pub fn acknowledge(&self, handle: MessageHandle) -> Result<()> {
        let id = handle.id().clone();
        transact(self.scx.store.as_ref(), || handle.destroy())?;
        log::debug!("acknowledged message {}", id);
        Ok(())
    }

    /// Gives an unacknowledged message back for redelivery.
    pub fn recover(&self, handle: MessageHandle) -> Result<()> {
        transact(self.scx.store.as_ref(), || handle.release())
    }

    #[inline]
    pub fn create_destination(&self, destination: Destination) -> Result<Destination> {
        self.destinations.create_destination(destination)
    }

    #[inline]
    pub fn remove_destination(&self, destination: &Destination) -> Result<()> {
        self.destinations.remove_destination(destination)
    }

    #[inline]
    pub fn collect_garbage(&self, aggressive: bool) {
        self.destinations.collect_garbage(aggressive)
    }

    #[inline]
    pub fn open_connection(&self, client_id: Option<ByteString>) -> Connection {
        self.connections.open(client_id)
    }

    /// Closes the consumers of a connection and drops its temporary
    /// destinations. Returns the temporary destinations still in use.
    pub fn close_connection(&self, connection_id: ConnectionId) -> Vec<Destination> {
        let closed = self.consumers.close_connection(connection_id);
        self.connections.close(connection_id);
        let in_use = self.destinations.remove_temporary_destinations(connection_id);
        log::debug!("connection {} closed with {} consumers", connection_id, closed);
        in_use
    }

    pub fn create_temporary_destination(
        &self,
        kind: DestinationKind,
        connection_id: ConnectionId,
    ) -> Result<Destination> {
        if !self.connections.is_alive(connection_id) {
            return Err(BrokerError::InvalidState(format!("connection {} is not open", connection_id)));
        }
        self.destinations.create_temporary_destination(kind, connection_id)
    }
}

pub struct BrokerBuilder {
    settings: Settings,
    store: Option<Arc<dyn MessageStore>>,
    lease_mgr: Option<Arc<dyn LeaseManager>>,
    selectors: Option<Arc<dyn SelectorFactory>>,
}

impl BrokerBuilder {
    #[inline]
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[inline]
    pub fn lease_manager(mut self, lease_mgr: Arc<dyn LeaseManager>) -> Self {
        self.lease_mgr = Some(lease_mgr);
        self
    }

    #[inline]
    pub fn selectors(mut self, selectors: Arc<dyn SelectorFactory>) -> Self {
        self.selectors = Some(selectors);
        self
    }

    pub fn build(self) -> Broker {
        let connections = Arc::new(DefaultConnectionManager::new());
        let mut builder = BrokerContext::builder(self.settings).connections(connections.clone());
        if let Some(store) = self.store {
            builder = builder.store(store);
        }
        if let Some(lease_mgr) = self.lease_mgr {
            builder = builder.lease_manager(lease_mgr);
        }
        if let Some(selectors) = self.selectors {
            builder = builder.selectors(selectors);
        }
        let scx = builder.build();
        let destinations = Arc::new(DestinationManager::new(scx.clone()));
        let consumers = ConsumerManager::new(scx.clone(), destinations.clone());
        let messages = Arc::new(MessageMgr::new(scx.clone(), destinations.clone()));
        let xa = Arc::new(DefaultTransactionLog::new(messages.clone(), scx.store.clone()));
        Broker {
            inner: Arc::new(BrokerInner {
                scx,
                connections,
                destinations,
                consumers,
                messages,
                xa,
                initialized: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}
