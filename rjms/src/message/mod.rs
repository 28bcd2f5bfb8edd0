mod cache;
mod handle;
mod reference;

pub use cache::{DefaultMessageCache, DestroyListener, MessageCache};
pub use handle::{HandleKind, HandleOwner, MessageHandle};
pub use reference::{MessageRef, DESTROYED};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use super::{DefaultMessageCache, MessageCache, MessageHandle, MessageRef};
    use crate::context::BrokerContext;
    use crate::conf::Settings;
    use crate::store::{DefaultMessageStore, MessageStore};
    use crate::types::{Destination, Message, Priority, TimestampMillis};

    pub struct TestCache;

    impl TestCache {
        #[allow(clippy::new_ret_no_self)]
        pub fn new() -> Arc<DefaultMessageCache> {
            Self::with_store().0
        }

        pub fn with_store() -> (Arc<DefaultMessageCache>, Arc<DefaultMessageStore>) {
            let store = Arc::new(DefaultMessageStore::new());
            let scx = BrokerContext::builder(Settings::default()).store(store.clone()).build();
            (DefaultMessageCache::new(scx), store)
        }

        /// Pools a message the way the message manager would, storing persistent ones.
        pub fn add(cache: &Arc<DefaultMessageCache>, id: &str, persistent: bool) -> Arc<MessageRef> {
            let m = Message::new(Destination::queue("q"), "payload").with_id(id).with_persistent(persistent);
            Self::add_message(cache, m)
        }

        pub fn add_message(cache: &Arc<DefaultMessageCache>, m: Message) -> Arc<MessageRef> {
            if m.persistent {
                cache.scx().store.add_message(&m).unwrap();
            }
            cache.add_message(Arc::new(m))
        }

        pub fn destroyed(cache: &Arc<DefaultMessageCache>) -> isize {
            cache.scx().stats.messages_destroyed.count()
        }
    }

    pub fn handle(
        cache: &Arc<DefaultMessageCache>,
        id: &str,
        priority: Priority,
        timestamp: TimestampMillis,
        sequence: u64,
    ) -> MessageHandle {
        let mut m = Message::new(Destination::queue("q"), "payload").with_id(id).with_priority(priority);
        m.timestamp = timestamp;
        m.sequence = sequence;
        let m = Arc::new(m);
        let msg_ref = cache.add_message(m.clone());
        MessageHandle::transient(msg_ref, &m).unwrap()
    }
}
