use std::sync::Arc;

use super::{ConsumerEndpoint, ConsumerKind};
use crate::cache::{DestinationCache, QueueDestinationCache};
use crate::condition::Condition;
use crate::context::BrokerContext;
use crate::message::MessageHandle;
use crate::selector::Selector;
use crate::types::{ConnectionId, ConsumerId};
use crate::Result;

/// Competing consumer on a queue's shared backlog.
pub struct QueueConsumer {
    cache: Arc<QueueDestinationCache>,
}

impl QueueConsumer {
    /// Creates the endpoint and registers it with the cache.
    pub fn create(
        scx: BrokerContext,
        id: ConsumerId,
        cache: Arc<QueueDestinationCache>,
        selector: Option<Arc<dyn Selector>>,
        connection_id: Option<ConnectionId>,
    ) -> Arc<ConsumerEndpoint> {
        let destination = cache.destination().clone();
        let endpoint = ConsumerEndpoint::new(
            scx,
            id,
            destination,
            selector,
            false,
            connection_id,
            ConsumerKind::Queue(QueueConsumer { cache: cache.clone() }),
        );
        cache.add_consumer(endpoint.clone());
        endpoint
    }

    #[inline]
    pub(crate) fn cache(&self) -> &Arc<QueueDestinationCache> {
        &self.cache
    }

    pub(crate) fn receive(
        &self,
        endpoint: &ConsumerEndpoint,
        cancel: &dyn Condition,
    ) -> Result<Option<MessageHandle>> {
        let selector = endpoint.selector();
        let handle = self.cache.get_message(selector.as_deref(), cancel)?;
        Ok(handle.map(|mut h| {
            h.set_consumer_id(Some(endpoint.id()));
            h
        }))
    }

    #[inline]
    pub(crate) fn close(&self, endpoint: &ConsumerEndpoint) {
        self.cache.remove_consumer(endpoint.id());
    }
}
