use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::conf::Settings;
use crate::connection::{ConnectionManager, DefaultConnectionManager};
use crate::lease::{DefaultLeaseManager, LeaseManager};
use crate::selector::{DefaultSelectorFactory, SelectorFactory};
use crate::stats::Stats;
use crate::store::{DefaultMessageStore, MessageStore};

/// Collaborators shared by every cache, endpoint and manager.
#[derive(Clone)]
pub struct BrokerContext {
    inner: Arc<BrokerContextInner>,
}

pub struct BrokerContextInner {
    pub settings: Settings,
    pub stats: Stats,
    pub store: Arc<dyn MessageStore>,
    pub lease_mgr: Arc<dyn LeaseManager>,
    pub connections: Arc<dyn ConnectionManager>,
    pub selectors: Arc<dyn SelectorFactory>,
}

impl Deref for BrokerContext {
    type Target = BrokerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Default for BrokerContext {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl BrokerContext {
    #[inline]
    pub fn new(settings: Settings) -> Self {
        Self::builder(settings).build()
    }

    #[inline]
    pub fn builder(settings: Settings) -> BrokerContextBuilder {
        BrokerContextBuilder { settings, store: None, lease_mgr: None, connections: None, selectors: None }
    }
}

impl fmt::Debug for BrokerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BrokerContext ...")?;
        Ok(())
    }
}

pub struct BrokerContextBuilder {
    settings: Settings,
    store: Option<Arc<dyn MessageStore>>,
    lease_mgr: Option<Arc<dyn LeaseManager>>,
    connections: Option<Arc<dyn ConnectionManager>>,
    selectors: Option<Arc<dyn SelectorFactory>>,
}

impl BrokerContextBuilder {
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
    pub fn connections(mut self, connections: Arc<dyn ConnectionManager>) -> Self {
        self.connections = Some(connections);
        self
    }

    #[inline]
    pub fn selectors(mut self, selectors: Arc<dyn SelectorFactory>) -> Self {
        self.selectors = Some(selectors);
        self
    }

    pub fn build(self) -> BrokerContext {
        let lease_check_interval = self.settings.broker.lease_check_interval;
        BrokerContext {
            inner: Arc::new(BrokerContextInner {
                store: self.store.unwrap_or_else(|| Arc::new(DefaultMessageStore::new())),
                lease_mgr: self
                    .lease_mgr
                    .unwrap_or_else(|| Arc::new(DefaultLeaseManager::new(lease_check_interval))),
                connections: self.connections.unwrap_or_else(|| Arc::new(DefaultConnectionManager::new())),
                selectors: self.selectors.unwrap_or_else(|| Arc::new(DefaultSelectorFactory)),
                stats: Stats::new(),
                settings: self.settings,
            }),
        }
    }
}
