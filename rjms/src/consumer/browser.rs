use std::sync::Arc;

use super::{next_acceptable, ConsumerEndpoint, ConsumerKind};
use crate::cache::{destroy_quietly, handle_queue, DestinationCache, QueueDestinationCache};
use crate::condition::Condition;
use crate::context::BrokerContext;
use crate::message::{MessageHandle, MessageRef};
use crate::queue::MessageQueue;
use crate::selector::Selector;
use crate::types::{ConnectionId, ConsumerId, Message};
use crate::Result;

/// Read-only view of a queue.
///
/// Every queued and arriving message is copied into a private queue; the
/// shared backlog is never touched.
pub struct QueueBrowser {
    cache: Arc<QueueDestinationCache>,
    messages: MessageQueue,
}

impl QueueBrowser {
    /// Creates the browser and replays the current backlog into it.
    pub fn create(
        scx: BrokerContext,
        id: ConsumerId,
        cache: Arc<QueueDestinationCache>,
        selector: Option<Arc<dyn Selector>>,
        connection_id: Option<ConnectionId>,
    ) -> Arc<ConsumerEndpoint> {
        let destination = cache.destination().clone();
        let messages = handle_queue(&scx);
        let endpoint = ConsumerEndpoint::new(
            scx,
            id,
            destination,
            selector,
            false,
            connection_id,
            ConsumerKind::Browser(QueueBrowser { cache: cache.clone(), messages }),
        );
        cache.add_browser(endpoint.clone());
        endpoint
    }

    #[inline]
    pub(crate) fn messages(&self) -> &MessageQueue {
        &self.messages
    }

    pub(crate) fn browse(&self, endpoint: &ConsumerEndpoint, msg_ref: &Arc<MessageRef>, message: &Message) {
        if !endpoint.selects(message) {
            return;
        }
        let mut handle = match MessageHandle::transient(msg_ref.clone(), message) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("browser {} skip message {}, {}", endpoint.id(), message.id, e);
                return;
            }
        };
        handle.set_consumer_id(Some(endpoint.id()));
        if let Err(h) = self.messages.add(handle) {
            destroy_quietly(h);
            return;
        }
        if endpoint.is_closed() {
            if let Some(h) = self.messages.remove(&message.id) {
                destroy_quietly(h);
            }
            return;
        }
        endpoint.message_available();
    }

    #[inline]
    pub(crate) fn receive(
        &self,
        endpoint: &ConsumerEndpoint,
        cancel: &dyn Condition,
    ) -> Result<Option<MessageHandle>> {
        next_acceptable(endpoint, &self.messages, cancel)
    }

    pub(crate) fn close(&self, endpoint: &ConsumerEndpoint) {
        self.cache.remove_browser(endpoint.id());
        for handle in self.messages.drain() {
            destroy_quietly(handle);
        }
    }
}
