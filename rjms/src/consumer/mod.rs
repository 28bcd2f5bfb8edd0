//! Consumer endpoints
//!
//! A [`ConsumerEndpoint`] is the delivery surface of one client consumer. The
//! closed flag, the cancellable receive and the arrival notification live
//! here; what a receive actually pulls from depends on the kind:
//!
//! - [`QueueConsumer`] competes for the shared backlog of a queue cache;
//! - [`TopicConsumer`] keeps a private queue fed by topic fan-out;
//! - [`DurableConsumer`] is a named, stored subscription that survives
//!   deactivation;
//! - [`QueueBrowser`] mirrors a queue without taking anything from it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use rjms_utils::timestamp_millis;

use crate::cache::{destroy_quietly, DestinationCache, TopicDestinationCache};
use crate::condition::{Condition, Deadline, Flag, Or};
use crate::context::BrokerContext;
use crate::message::{HandleOwner, MessageHandle, MessageRef};
use crate::queue::MessageQueue;
use crate::selector::Selector;
use crate::types::{ConnectionId, ConsumerId, Destination, Message, MessageId, SubscriptionName};
use crate::{BrokerError, Result};

mod browser;
mod durable;
mod queue;
mod topic;

pub use browser::QueueBrowser;
pub use durable::DurableConsumer;
pub use queue::QueueConsumer;
pub use topic::TopicConsumer;

/// Told when a message may be ready for an asynchronous consumer.
pub trait ConsumerListener: Sync + Send {
    fn message_available(&self, consumer: &ConsumerEndpoint);
}

pub(crate) enum ConsumerKind {
    Queue(QueueConsumer),
    Topic(TopicConsumer),
    Durable(DurableConsumer),
    Browser(QueueBrowser),
}

impl ConsumerKind {
    #[inline]
    fn name(&self) -> &'static str {
        match self {
            ConsumerKind::Queue(_) => "queue consumer",
            ConsumerKind::Topic(_) => "topic consumer",
            ConsumerKind::Durable(_) => "durable consumer",
            ConsumerKind::Browser(_) => "queue browser",
        }
    }
}

pub struct ConsumerEndpoint {
    me: Weak<ConsumerEndpoint>,
    id: ConsumerId,
    destination: Destination,
    scx: BrokerContext,
    selector: RwLock<Option<Arc<dyn Selector>>>,
    no_local: AtomicBool,
    connection_id: RwLock<Option<ConnectionId>>,
    asynchronous: AtomicBool,
    waiting: AtomicBool,
    closed: Flag,
    listener: RwLock<Option<Arc<dyn ConsumerListener>>>,
    lock: Mutex<()>,
    arrivals: Mutex<u64>,
    arrived: Condvar,
    kind: ConsumerKind,
}

impl ConsumerEndpoint {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        scx: BrokerContext,
        id: ConsumerId,
        destination: Destination,
        selector: Option<Arc<dyn Selector>>,
        no_local: bool,
        connection_id: Option<ConnectionId>,
        kind: ConsumerKind,
    ) -> Arc<Self> {
        match kind {
            ConsumerKind::Browser(_) => scx.stats.browsers.inc(),
            _ => scx.stats.consumers.inc(),
        }
        log::debug!("create {} {} on {}", kind.name(), id, destination);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id,
            destination,
            scx,
            selector: RwLock::new(selector),
            no_local: AtomicBool::new(no_local),
            connection_id: RwLock::new(connection_id),
            asynchronous: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            closed: Flag::new(),
            listener: RwLock::new(None),
            lock: Mutex::new(()),
            arrivals: Mutex::new(0),
            arrived: Condvar::new(),
            kind,
        })
    }

    #[inline]
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// The subscription name of a durable consumer.
    #[inline]
    pub fn persistent_id(&self) -> Option<&SubscriptionName> {
        match &self.kind {
            ConsumerKind::Durable(d) => Some(d.name()),
            _ => None,
        }
    }

    #[inline]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    #[inline]
    pub fn scx(&self) -> &BrokerContext {
        &self.scx
    }

    #[inline]
    pub fn is_queue(&self) -> bool {
        matches!(self.kind, ConsumerKind::Queue(_))
    }

    #[inline]
    pub fn is_durable(&self) -> bool {
        matches!(self.kind, ConsumerKind::Durable(_))
    }

    #[inline]
    pub fn is_browser(&self) -> bool {
        matches!(self.kind, ConsumerKind::Browser(_))
    }

    /// Topic and durable consumers are fed by topic caches.
    #[inline]
    pub fn is_subscriber(&self) -> bool {
        matches!(self.kind, ConsumerKind::Topic(_) | ConsumerKind::Durable(_))
    }

    #[inline]
    pub fn selector(&self) -> Option<Arc<dyn Selector>> {
        self.selector.read().clone()
    }

    #[inline]
    pub fn set_selector(&self, selector: Option<Arc<dyn Selector>>) {
        *self.selector.write() = selector;
    }

    /// True without a selector, otherwise whatever the selector says.
    #[inline]
    pub fn selects(&self, message: &Message) -> bool {
        match self.selector.read().as_ref() {
            Some(s) => s.selects(message),
            None => true,
        }
    }

    #[inline]
    pub fn no_local(&self) -> bool {
        self.no_local.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        *self.connection_id.read()
    }

    #[inline]
    pub(crate) fn is_local(&self, message: &Message) -> bool {
        self.no_local() && message.connection_id.is_some() && message.connection_id == self.connection_id()
    }

    #[inline]
    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous.load(Ordering::SeqCst)
    }

    /// Installing a listener makes the endpoint asynchronous; removing it
    /// makes it synchronous again.
    pub fn set_listener(&self, listener: Option<Arc<dyn ConsumerListener>>) -> Result<()> {
        if self.is_closed() {
            return Err(BrokerError::ConsumerClosed(self.id));
        }
        let asynchronous = listener.is_some();
        *self.listener.write() = listener;
        self.asynchronous.store(asynchronous, Ordering::SeqCst);
        if asynchronous && self.len() > 0 {
            self.message_available();
        }
        Ok(())
    }

    /// Whether a synchronous receive is currently blocked on this endpoint.
    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.is_set()
    }

    /// Takes the next deliverable message, if any.
    ///
    /// `cancel` and the closed flag are checked between delivery attempts,
    /// so a concurrent [`ConsumerEndpoint::close`] ends the call promptly.
    /// A closed endpoint yields `None`.
    pub fn receive(&self, cancel: &dyn Condition) -> Result<Option<MessageHandle>> {
        if self.is_closed() {
            return Ok(None);
        }
        let _guard = self.lock.lock();
        let cancel = Or(&self.closed, cancel);
        match &self.kind {
            ConsumerKind::Queue(q) => q.receive(self, &cancel),
            ConsumerKind::Topic(t) => t.receive(self, &cancel),
            ConsumerKind::Durable(d) => d.receive(self, &cancel),
            ConsumerKind::Browser(b) => b.receive(self, &cancel),
        }
    }

    /// Blocks up to `timeout` for a message.
    ///
    /// The endpoint is marked waiting while it sleeps so the queue
    /// round-robin considers it, and is woken by every arrival notification
    /// and by close.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<MessageHandle>> {
        let deadline = Deadline::after(timeout);
        let res = self.wait_for_message(&deadline);
        self.set_waiting(false);
        res
    }

    fn wait_for_message(&self, deadline: &Deadline) -> Result<Option<MessageHandle>> {
        loop {
            if self.is_closed() {
                return Ok(None);
            }
            let generation = *self.arrivals.lock();
            self.set_waiting(true);
            if let Some(handle) = self.receive(deadline)? {
                return Ok(Some(handle));
            }
            let mut arrivals = self.arrivals.lock();
            if *arrivals == generation && !self.is_closed() {
                if self.arrived.wait_until(&mut arrivals, deadline.instant()).timed_out() {
                    return Ok(None);
                }
            } else if deadline.is_met() {
                return Ok(None);
            }
        }
    }

    /// Wakes blocked receivers and the listener, if any.
    pub fn message_available(&self) {
        self.wake();
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.message_available(self);
        }
    }

    #[inline]
    fn wake(&self) {
        *self.arrivals.lock() += 1;
        self.arrived.notify_all();
    }

    /// Closes the endpoint for good, detaching it from its caches and
    /// dropping whatever it still holds. Durable subscriptions are removed
    /// from their caches too; deactivation is [`ConsumerEndpoint::deactivate`].
    pub fn close(&self) {
        if self.closed.set() {
            return;
        }
        self.listener.write().take();
        self.asynchronous.store(false, Ordering::SeqCst);
        {
            let _guard = self.lock.lock();
            match &self.kind {
                ConsumerKind::Queue(q) => q.close(self),
                ConsumerKind::Topic(t) => t.close(self),
                ConsumerKind::Durable(d) => d.close(self),
                ConsumerKind::Browser(b) => b.close(self),
            }
        }
        self.wake();
        match self.kind {
            ConsumerKind::Browser(_) => self.scx.stats.browsers.dec(),
            _ => self.scx.stats.consumers.dec(),
        }
        log::debug!("close {} {} on {}", self.kind.name(), self.id, self.destination);
    }

    /// Marks the endpoint closed without giving back anything it holds, so
    /// that stored handles survive a failed recovery.
    pub(crate) fn abandon(&self) {
        if !self.closed.set() {
            self.scx.stats.consumers.dec();
        }
    }

    /// Fan-out entry point of topic caches. Returns whether the endpoint
    /// kept a handle on the message.
    pub fn message_added(&self, shared: &MessageHandle, message: &Message) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        match &self.kind {
            ConsumerKind::Topic(t) => t.message_added(self, shared, message),
            ConsumerKind::Durable(d) => d.message_added(self, shared, message),
            ConsumerKind::Queue(_) | ConsumerKind::Browser(_) => Ok(false),
        }
    }

    /// The message went away, usually by expiry. Drops any handle kept for it.
    pub fn message_removed(&self, id: &MessageId) {
        let messages = match &self.kind {
            ConsumerKind::Topic(t) => t.messages(),
            ConsumerKind::Durable(d) => d.messages(),
            ConsumerKind::Browser(b) => b.messages(),
            ConsumerKind::Queue(_) => return,
        };
        if let Some(handle) = messages.remove(id) {
            destroy_quietly(handle);
        }
    }

    /// Non-destructive copy of a queue arrival, for browsers only.
    pub fn browse(&self, msg_ref: &Arc<MessageRef>, message: &Message) {
        if self.is_closed() {
            return;
        }
        if let ConsumerKind::Browser(b) = &self.kind {
            b.browse(self, msg_ref, message);
        }
    }

    /// Subscribes a topic or durable endpoint to one more topic cache.
    pub fn attach_cache(&self, cache: &Arc<TopicDestinationCache>) -> bool {
        if self.is_closed() {
            return false;
        }
        let attached = match &self.kind {
            ConsumerKind::Topic(t) => t.subscriber().attach(cache),
            ConsumerKind::Durable(d) => d.subscriber().attach(cache),
            _ => return false,
        };
        if attached {
            if let Some(me) = self.me.upgrade() {
                cache.add_consumer(me);
            }
        }
        attached
    }

    pub fn detach_cache(&self, destination: &Destination) {
        let cache = match &self.kind {
            ConsumerKind::Topic(t) => t.subscriber().detach(destination),
            ConsumerKind::Durable(d) => d.subscriber().detach(destination),
            _ => None,
        };
        if let Some(cache) = cache {
            cache.remove_consumer(self.id);
        }
    }

    /// Destinations of the topic caches this endpoint is attached to.
    pub fn attached_destinations(&self) -> Vec<Destination> {
        match &self.kind {
            ConsumerKind::Topic(t) => t.subscriber().destinations(),
            ConsumerKind::Durable(d) => d.subscriber().destinations(),
            _ => Vec::new(),
        }
    }

    /// Reactivates a durable subscription for a new session.
    pub fn activate(
        &self,
        connection_id: Option<ConnectionId>,
        selector: Option<Arc<dyn Selector>>,
        no_local: bool,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(BrokerError::ConsumerClosed(self.id));
        }
        match &self.kind {
            ConsumerKind::Durable(d) => {
                d.activate()?;
                *self.connection_id.write() = connection_id;
                self.set_selector(selector);
                self.no_local.store(no_local, Ordering::SeqCst);
                log::debug!("activate durable subscription {}", d.name());
                if self.len() > 0 {
                    self.message_available();
                }
                Ok(())
            }
            _ => Err(BrokerError::InvalidState(format!("{} {} cannot be activated", self.kind.name(), self.id))),
        }
    }

    /// Detaches a durable subscription from its session. Messages keep
    /// accumulating until the next activation.
    pub fn deactivate(&self) -> Result<()> {
        match &self.kind {
            ConsumerKind::Durable(d) => {
                d.deactivate()?;
                *self.connection_id.write() = None;
                self.listener.write().take();
                self.asynchronous.store(false, Ordering::SeqCst);
                self.wake();
                log::debug!("deactivate durable subscription {}", d.name());
                Ok(())
            }
            _ => Err(BrokerError::InvalidState(format!("{} {} cannot be deactivated", self.kind.name(), self.id))),
        }
    }

    /// Durable endpoints are active between activate and deactivate; the
    /// others are active until closed.
    #[inline]
    pub fn is_active(&self) -> bool {
        match &self.kind {
            ConsumerKind::Durable(d) => !self.is_closed() && d.is_active(),
            _ => !self.is_closed(),
        }
    }

    /// Messages waiting for this endpoint.
    #[inline]
    pub fn len(&self) -> usize {
        match &self.kind {
            ConsumerKind::Queue(q) => q.cache().len(),
            ConsumerKind::Topic(t) => t.messages().len(),
            ConsumerKind::Durable(d) => d.messages().len(),
            ConsumerKind::Browser(b) => b.messages().len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub(crate) fn owner(&self) -> Weak<dyn HandleOwner> {
        self.me.clone()
    }
}

impl HandleOwner for ConsumerEndpoint {
    /// Released topic and durable handles go back on the private queue.
    fn return_message_handle(&self, mut handle: MessageHandle) -> Result<()> {
        let messages = match &self.kind {
            ConsumerKind::Topic(t) => t.messages(),
            ConsumerKind::Durable(d) => d.messages(),
            _ => {
                destroy_quietly(handle);
                return Ok(());
            }
        };
        if self.is_closed() {
            return handle.destroy();
        }
        handle.set_consumer_id(Some(self.id));
        if let Err(h) = messages.add(handle) {
            destroy_quietly(h);
            return Ok(());
        }
        if self.is_active() {
            self.message_available();
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConsumerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerEndpoint")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("destination", &self.destination.to_string())
            .field("persistent_id", &self.persistent_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Pops handles until one is still live, unexpired and selected.
///
/// Handles that fail the checks are destroyed on the way.
pub(crate) fn next_acceptable(
    endpoint: &ConsumerEndpoint,
    messages: &MessageQueue,
    cancel: &dyn Condition,
) -> Result<Option<MessageHandle>> {
    let now = timestamp_millis();
    while !cancel.is_met() {
        let handle = match messages.remove_first() {
            Some(h) => h,
            None => break,
        };
        match handle.message() {
            Ok(Some(m)) if !m.is_expired(now) && endpoint.selects(&m) => return Ok(Some(handle)),
            Ok(_) => {
                log::debug!("consumer {} drop handle of message {}", endpoint.id(), handle.id());
                destroy_quietly(handle);
            }
            Err(e) => {
                if let Err(h) = messages.add(handle) {
                    destroy_quietly(h);
                }
                return Err(e);
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::cache::QueueDestinationCache;
    use crate::condition::Never;

    fn queue(scx: &BrokerContext) -> Arc<QueueDestinationCache> {
        QueueDestinationCache::new(scx.clone(), Destination::queue("q"))
    }

    fn message(id: &str) -> Arc<Message> {
        Arc::new(Message::new(Destination::queue("q"), "x").with_id(id))
    }

    #[test]
    fn test_receive_timeout_expires() {
        let scx = BrokerContext::default();
        let c = QueueConsumer::create(scx.clone(), 1, queue(&scx), None, None);
        let start = Instant::now();
        assert!(c.receive_timeout(Duration::from_millis(50)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!c.is_waiting());
    }

    #[test]
    fn test_receive_timeout_woken_by_arrival() {
        let scx = BrokerContext::default();
        let cache = queue(&scx);
        let c = QueueConsumer::create(scx.clone(), 1, cache.clone(), None, None);
        let receiver = {
            let c = c.clone();
            thread::spawn(move || c.receive_timeout(Duration::from_secs(10)))
        };
        while !c.is_waiting() {
            thread::sleep(Duration::from_millis(1));
        }
        cache.message_added(message("m")).unwrap();
        let h = receiver.join().unwrap().unwrap().unwrap();
        assert_eq!(h.id(), "m");
        assert_eq!(h.consumer_id(), Some(1));
    }

    #[test]
    fn test_close_unblocks_receive() {
        let scx = BrokerContext::default();
        let c = QueueConsumer::create(scx.clone(), 1, queue(&scx), None, None);
        let receiver = {
            let c = c.clone();
            thread::spawn(move || c.receive_timeout(Duration::from_secs(30)))
        };
        while !c.is_waiting() {
            thread::sleep(Duration::from_millis(1));
        }
        let start = Instant::now();
        c.close();
        assert!(receiver.join().unwrap().unwrap().is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(c.receive(&Never).unwrap().is_none());
        assert!(matches!(c.set_listener(None), Err(BrokerError::ConsumerClosed(1))));
        assert_eq!(scx.stats.consumers.count(), 0);
    }

    struct Counting(Mutex<usize>);

    impl ConsumerListener for Counting {
        fn message_available(&self, _consumer: &ConsumerEndpoint) {
            *self.0.lock() += 1;
        }
    }

    #[test]
    fn test_listener_makes_consumer_asynchronous() {
        let scx = BrokerContext::default();
        let cache = queue(&scx);
        let c = QueueConsumer::create(scx.clone(), 1, cache.clone(), None, None);
        assert!(cache.endpoint_for_message(&message("a")).is_none());

        let listener = Arc::new(Counting(Mutex::new(0)));
        c.set_listener(Some(listener.clone())).unwrap();
        assert!(c.is_asynchronous());
        cache.message_added(message("a")).unwrap();
        cache.message_added(message("b")).unwrap();
        assert_eq!(*listener.0.lock(), 2);

        c.set_listener(None).unwrap();
        assert!(!c.is_asynchronous());
        cache.message_added(message("c")).unwrap();
        assert_eq!(*listener.0.lock(), 2);
        assert_eq!(c.len(), 3);
    }
}
