use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::message::MessageCache;
use crate::types::{Message, MessageId};
use crate::{BrokerError, Result};

/// Count value of a destroyed reference.
pub const DESTROYED: isize = -1;

/// Owner of a message's lifetime.
///
/// Handles take a reference each; the last `dereference` (or a forced
/// `destroy`) removes the message from its cache and, for persistent
/// messages, from the store. Once destroyed the count stays at
/// [`DESTROYED`] and further references are refused.
pub struct MessageRef {
    id: MessageId,
    persistent: bool,
    count: Mutex<isize>,
    cache: Weak<dyn MessageCache>,
}

impl MessageRef {
    #[inline]
    pub(crate) fn new(id: MessageId, persistent: bool, cache: Weak<dyn MessageCache>) -> Self {
        Self { id, persistent, count: Mutex::new(0), cache }
    }

    #[inline]
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    #[inline]
    pub fn count(&self) -> isize {
        *self.count.lock()
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.count() < 0
    }

    /// The message, or `None` once destroyed or evicted without a backing copy.
    #[inline]
    pub fn message(&self) -> Result<Option<Arc<Message>>> {
        if self.is_destroyed() {
            return Ok(None);
        }
        match self.cache.upgrade() {
            Some(cache) => cache.get_message(self),
            None => Ok(None),
        }
    }

    #[inline]
    pub fn reference(&self) -> Result<()> {
        let mut count = self.count.lock();
        if *count < 0 {
            return Err(BrokerError::MessageDestroyed(self.id.clone()));
        }
        *count += 1;
        Ok(())
    }

    /// Drops one reference, destroying the message when none remain.
    /// A no-op on a destroyed reference.
    #[inline]
    pub fn dereference(&self) -> Result<()> {
        {
            let mut count = self.count.lock();
            if *count < 0 {
                return Ok(());
            }
            *count -= 1;
            if *count > 0 {
                return Ok(());
            }
            *count = DESTROYED;
        }
        self.destroy_message()
    }

    /// Destroys the message regardless of outstanding references.
    #[inline]
    pub fn destroy(&self) -> Result<()> {
        {
            let mut count = self.count.lock();
            if *count < 0 {
                return Ok(());
            }
            *count = DESTROYED;
        }
        self.destroy_message()
    }

    #[inline]
    fn destroy_message(&self) -> Result<()> {
        log::debug!("destroy message {}", self.id);
        match self.cache.upgrade() {
            Some(cache) => cache.destroy(self),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageRef {{ id: {}, persistent: {}, count: {} }}", self.id, self.persistent, self.count())
    }
}

#[cfg(test)]
mod tests {
    use crate::message::test_support::TestCache;
    use crate::message::MessageCache;

    #[test]
    fn test_reference_counting() {
        let (cache, store) = TestCache::with_store();
        let msg_ref = TestCache::add(&cache, "m1", true);
        assert!(store.contains_message(&"m1".into()));

        for _ in 0..3 {
            msg_ref.reference().unwrap();
        }
        assert_eq!(msg_ref.count(), 3);
        msg_ref.dereference().unwrap();
        msg_ref.dereference().unwrap();
        assert!(!msg_ref.is_destroyed());
        assert!(msg_ref.message().unwrap().is_some());

        msg_ref.dereference().unwrap();
        assert_eq!(msg_ref.count(), super::DESTROYED);
        assert!(msg_ref.message().unwrap().is_none());
        assert!(cache.get_message_ref(&"m1".into()).is_none());
        assert!(!store.contains_message(&"m1".into()));

        msg_ref.dereference().unwrap();
        assert_eq!(msg_ref.count(), super::DESTROYED);
        assert!(msg_ref.reference().is_err());
        assert_eq!(TestCache::destroyed(&cache), 1);
    }

    #[test]
    fn test_forced_destroy() {
        let (cache, _store) = TestCache::with_store();
        let msg_ref = TestCache::add(&cache, "m1", false);
        msg_ref.reference().unwrap();
        msg_ref.reference().unwrap();
        msg_ref.destroy().unwrap();
        assert!(msg_ref.is_destroyed());
        msg_ref.destroy().unwrap();
        msg_ref.dereference().unwrap();
        assert_eq!(TestCache::destroyed(&cache), 1);
    }
}
