use std::sync::Arc;

use bytestring::ByteString;
use parking_lot::Mutex;

use crate::message::MessageHandle;
use crate::message_mgr::MessageMgr;
use crate::store::{transact, MessageStore};
use crate::types::{ConsumerId, HashMap, Message};
use crate::{BrokerError, Result};

pub type Xid = ByteString;

/// Work done under a global transaction, applied only when it commits.
pub trait TransactionLog: Sync + Send {
    fn log_published_message(&self, xid: &Xid, message: Message) -> Result<()>;

    fn log_received_message(&self, xid: &Xid, consumer_id: ConsumerId, handle: MessageHandle) -> Result<()>;

    ///Replays logged publishes and acknowledges logged receives.
    fn commit(&self, xid: &Xid) -> Result<()>;

    ///Returns logged receives to their owners for redelivery.
    fn rollback(&self, xid: &Xid) -> Result<()>;

    #[inline]
    fn is_pending(&self, _xid: &Xid) -> bool {
        false
    }
}

enum Entry {
    Published(Message),
    Received(ConsumerId, MessageHandle),
}

/// In-memory transaction log feeding commits back through `MessageMgr`.
pub struct DefaultTransactionLog {
    messages: Arc<MessageMgr>,
    store: Arc<dyn MessageStore>,
    entries: Mutex<HashMap<Xid, Vec<Entry>>>,
}

impl DefaultTransactionLog {
    pub fn new(messages: Arc<MessageMgr>, store: Arc<dyn MessageStore>) -> Self {
        Self { messages, store, entries: Mutex::new(HashMap::default()) }
    }

    #[inline]
    fn push(&self, xid: &Xid, entry: Entry) {
        self.entries.lock().entry(xid.clone()).or_default().push(entry);
    }

    #[inline]
    fn take(&self, xid: &Xid) -> Result<Vec<Entry>> {
        self.entries.lock().remove(xid).ok_or_else(|| BrokerError::InvalidState(format!("unknown xid {}", xid)))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransactionLog for DefaultTransactionLog {
    fn log_published_message(&self, xid: &Xid, message: Message) -> Result<()> {
        let message = self.messages.prepare(message)?;
        log::debug!("xid {} logs publish of {}", xid, message.id);
        self.push(xid, Entry::Published(message));
        Ok(())
    }

    fn log_received_message(&self, xid: &Xid, consumer_id: ConsumerId, handle: MessageHandle) -> Result<()> {
        log::debug!("xid {} logs receive of {} by consumer {}", xid, handle.id(), consumer_id);
        self.push(xid, Entry::Received(consumer_id, handle));
        Ok(())
    }

    fn commit(&self, xid: &Xid) -> Result<()> {
        let entries = self.take(xid)?;
        let mut published = Vec::new();
        let mut received = Vec::new();
        for entry in entries {
            match entry {
                Entry::Published(m) => published.push(m),
                Entry::Received(_, h) => received.push(h),
            }
        }
        transact(self.store.as_ref(), || {
            for handle in received {
                handle.destroy()?;
            }
            Ok(())
        })?;
        for message in published {
            self.messages.route(message)?;
        }
        log::debug!("xid {} committed", xid);
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<()> {
        let mut first_err = None;
        for entry in self.take(xid)? {
            if let Entry::Received(consumer_id, handle) = entry {
                let id = handle.id().clone();
                if let Err(e) = handle.release() {
                    log::warn!("xid {} failed to return {} of consumer {}, {}", xid, id, consumer_id, e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        log::debug!("xid {} rolled back", xid);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[inline]
    fn is_pending(&self, xid: &Xid) -> bool {
        self.entries.lock().contains_key(xid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DestinationCache;
    use crate::condition::Never;
    use crate::consumer_mgr::ConsumerManager;
    use crate::message::MessageCache;
    use crate::context::BrokerContext;
    use crate::destination_mgr::DestinationManager;
    use crate::types::Destination;

    struct Fixture {
        log: DefaultTransactionLog,
        consumers: Arc<ConsumerManager>,
        destinations: Arc<DestinationManager>,
    }

    fn fixture() -> Fixture {
        let scx = BrokerContext::default();
        let destinations = Arc::new(DestinationManager::new(scx.clone()));
        let consumers = ConsumerManager::new(scx.clone(), destinations.clone());
        let messages = Arc::new(MessageMgr::new(scx.clone(), destinations.clone()));
        Fixture { log: DefaultTransactionLog::new(messages, scx.store.clone()), consumers, destinations }
    }

    #[test]
    fn test_publish_waits_for_commit() {
        let f = fixture();
        let q = Destination::queue("q");
        let xid: Xid = "x1".into();
        f.log.log_published_message(&xid, Message::new(q.clone(), "a")).unwrap();
        assert!(f.log.is_pending(&xid));
        assert!(f.destinations.get_cache(&q).is_none());

        f.log.commit(&xid).unwrap();
        assert!(!f.log.is_pending(&xid));
        assert_eq!(f.destinations.get_queue_cache(&q).unwrap().len(), 1);
        assert!(f.log.commit(&xid).is_err());
    }

    #[test]
    fn test_rollback_returns_received() {
        let f = fixture();
        let q = Destination::queue("q");
        let cache = f.destinations.get_queue_cache(&q).unwrap();
        let c = f.consumers.create_consumer(&q, None, false, None).unwrap();
        let xid: Xid = "x2".into();
        f.log.log_published_message(&xid, Message::new(q.clone(), "a")).unwrap();
        f.log.commit(&xid).unwrap();

        let h = c.receive(&Never).unwrap().unwrap();
        f.log.log_received_message(&xid, c.id(), h).unwrap();
        assert_eq!(cache.len(), 0);
        f.log.rollback(&xid).unwrap();
        assert_eq!(cache.len(), 1);

        let h = c.receive(&Never).unwrap().unwrap();
        assert!(h.is_delivered());
        let id = h.id().clone();
        f.log.log_received_message(&xid, c.id(), h).unwrap();
        f.log.commit(&xid).unwrap();
        assert_eq!(cache.len(), 0);
        assert!(cache.message_cache().get_message_ref(&id).is_none());
        assert!(f.log.is_empty());
    }
}
