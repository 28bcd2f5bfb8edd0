use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context::BrokerContext;
use crate::message::MessageRef;
use crate::types::{HashMap, Message, MessageId};
use crate::Result;

/// Pool of live messages and their references, keyed by message id.
pub trait MessageCache: Sync + Send {
    ///Pools `message` and returns its reference, reusing an existing one for the same id.
    fn add_message(&self, message: Arc<Message>) -> Arc<MessageRef>;

    ///Persistent messages missing from memory are faulted in from the store.
    fn get_message(&self, msg_ref: &MessageRef) -> Result<Option<Arc<Message>>>;

    fn get_message_ref(&self, id: &MessageId) -> Option<Arc<MessageRef>>;

    ///Like `get_message_ref`, but rebuilds the reference of a stored message.
    fn get_or_fault_ref(&self, id: &MessageId) -> Result<Option<Arc<MessageRef>>>;

    ///Drops the reference and the message; persistent messages are deleted from the store first.
    fn destroy(&self, msg_ref: &MessageRef) -> Result<()>;

    ///Evicts persistent messages from memory only. Returns how many went.
    fn clear_persistent_messages(&self) -> usize;

    fn clear(&self);

    fn len(&self) -> usize;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Called with each reference as it is destroyed.
pub type DestroyListener = Box<dyn Fn(&MessageRef) + Send + Sync>;

pub struct DefaultMessageCache {
    me: Weak<DefaultMessageCache>,
    scx: BrokerContext,
    on_destroy: Option<DestroyListener>,
    transient: Mutex<HashMap<MessageId, Arc<Message>>>,
    persistent: Mutex<HashMap<MessageId, Arc<Message>>>,
    refs: Mutex<HashMap<MessageId, Arc<MessageRef>>>,
}

impl DefaultMessageCache {
    #[inline]
    pub fn new(scx: BrokerContext) -> Arc<Self> {
        Self::build(scx, None)
    }

    #[inline]
    pub fn with_destroy_listener<F>(scx: BrokerContext, f: F) -> Arc<Self>
    where
        F: Fn(&MessageRef) + Send + Sync + 'static,
    {
        Self::build(scx, Some(Box::new(f)))
    }

    fn build(scx: BrokerContext, on_destroy: Option<DestroyListener>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            scx,
            on_destroy,
            transient: Mutex::new(HashMap::default()),
            persistent: Mutex::new(HashMap::default()),
            refs: Mutex::new(HashMap::default()),
        })
    }

    #[inline]
    fn new_ref(&self, id: MessageId, persistent: bool) -> Arc<MessageRef> {
        let cache: Weak<dyn MessageCache> = self.me.clone();
        Arc::new(MessageRef::new(id, persistent, cache))
    }

    #[inline]
    fn pool_persistent(&self, message: Arc<Message>) -> Arc<Message> {
        let mut persistent = self.persistent.lock();
        persistent
            .entry(message.id.clone())
            .or_insert_with(|| {
                self.scx.stats.messages_cached.inc();
                message
            })
            .clone()
    }

    #[inline]
    pub fn scx(&self) -> &BrokerContext {
        &self.scx
    }

    /// Persistent messages currently held in memory.
    #[inline]
    pub fn persistent_len(&self) -> usize {
        self.persistent.lock().len()
    }
}

impl MessageCache for DefaultMessageCache {
    fn add_message(&self, message: Arc<Message>) -> Arc<MessageRef> {
        let msg_ref = {
            let mut refs = self.refs.lock();
            if let Some(r) = refs.get(&message.id).filter(|r| !r.is_destroyed()) {
                return r.clone();
            }
            let r = self.new_ref(message.id.clone(), message.persistent);
            refs.insert(message.id.clone(), r.clone());
            r
        };
        if message.persistent {
            self.pool_persistent(message);
        } else {
            self.transient.lock().insert(message.id.clone(), message);
        }
        msg_ref
    }

    fn get_message(&self, msg_ref: &MessageRef) -> Result<Option<Arc<Message>>> {
        if !msg_ref.is_persistent() {
            return Ok(self.transient.lock().get(msg_ref.id()).cloned());
        }
        if let Some(m) = self.persistent.lock().get(msg_ref.id()) {
            return Ok(Some(m.clone()));
        }
        match self.scx.store.get_message(msg_ref.id())? {
            Some(m) => {
                log::debug!("fault in message {}", msg_ref.id());
                Ok(Some(self.pool_persistent(Arc::new(m))))
            }
            None => Ok(None),
        }
    }

    #[inline]
    fn get_message_ref(&self, id: &MessageId) -> Option<Arc<MessageRef>> {
        self.refs.lock().get(id).cloned()
    }

    fn get_or_fault_ref(&self, id: &MessageId) -> Result<Option<Arc<MessageRef>>> {
        if let Some(r) = self.get_message_ref(id) {
            return Ok(Some(r));
        }
        match self.scx.store.get_message(id)? {
            Some(m) => Ok(Some(self.add_message(Arc::new(m)))),
            None => Ok(None),
        }
    }

    fn destroy(&self, msg_ref: &MessageRef) -> Result<()> {
        if let Some(f) = self.on_destroy.as_ref() {
            f(msg_ref);
        }
        {
            let mut refs = self.refs.lock();
            if refs.get(msg_ref.id()).map(|r| std::ptr::eq(r.as_ref(), msg_ref)).unwrap_or(false) {
                refs.remove(msg_ref.id());
            }
        }
        if msg_ref.is_persistent() {
            self.scx.store.remove_message(msg_ref.id())?;
            if self.persistent.lock().remove(msg_ref.id()).is_some() {
                self.scx.stats.messages_cached.dec();
            }
        } else {
            self.transient.lock().remove(msg_ref.id());
        }
        self.scx.stats.messages_destroyed.inc();
        Ok(())
    }

    fn clear_persistent_messages(&self) -> usize {
        let n = {
            let mut persistent = self.persistent.lock();
            let n = persistent.len();
            persistent.clear();
            n
        };
        self.scx.stats.messages_cached.decs(n as isize);
        n
    }

    fn clear(&self) {
        self.clear_persistent_messages();
        self.transient.lock().clear();
        self.refs.lock().clear();
    }

    #[inline]
    fn len(&self) -> usize {
        self.refs.lock().len()
    }
}
