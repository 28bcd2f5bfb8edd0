use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::message::{MessageHandle, MessageRef};
use crate::types::{HashMap, MessageId, OrderKey};

pub trait OnEventFn: 'static + Sync + Send + Fn() {}
impl<T> OnEventFn for T where T: 'static + Sync + Send + Fn() {}

pub trait CompareFn<T>: 'static + Sync + Send + Fn(&T, &T) -> Ordering {}
impl<T, F> CompareFn<T> for F where F: 'static + Sync + Send + Fn(&T, &T) -> Ordering {}

/// Sorted vector kept in order by an injected comparator.
///
/// Insertion binary-searches for its slot; an element comparing equal to an
/// existing one is placed right after the found position.
pub struct OrderedQueue<T> {
    cmp: Arc<dyn CompareFn<T>>,
    inner: Mutex<Vec<T>>,
}

impl<T> OrderedQueue<T> {
    #[inline]
    pub fn new<F>(cmp: F) -> Self
    where
        F: CompareFn<T>,
    {
        Self { cmp: Arc::new(cmp), inner: Mutex::new(Vec::new()) }
    }

    #[inline]
    pub fn add(&self, v: T) {
        let mut inner = self.inner.lock();
        let idx = match inner.binary_search_by(|item| (self.cmp)(item, &v)) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        };
        inner.insert(idx, v);
    }

    #[inline]
    pub fn remove_first(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.is_empty() {
            None
        } else {
            Some(inner.remove(0))
        }
    }

    /// Pops the head only when `f` accepts it.
    #[inline]
    pub fn remove_first_if<F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut inner = self.inner.lock();
        match inner.first() {
            Some(head) if f(head) => Some(inner.remove(0)),
            _ => None,
        }
    }

    #[inline]
    pub fn first_with<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&T) -> R,
    {
        self.inner.lock().first().map(f)
    }

    #[inline]
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: PartialEq> OrderedQueue<T> {
    #[inline]
    pub fn remove(&self, v: &T) -> bool {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.iter().position(|x| x == v) {
            inner.remove(pos);
            true
        } else {
            false
        }
    }
}

impl<T: Clone> OrderedQueue<T> {
    #[inline]
    pub fn to_vec(&self) -> Vec<T> {
        self.inner.lock().clone()
    }
}

#[derive(Default)]
struct Inner {
    sorted: BTreeMap<OrderKey, MessageHandle>,
    index: HashMap<MessageId, OrderKey>,
}

/// Handles in delivery order with an id index.
pub struct MessageQueue {
    inner: Mutex<Inner>,
    on_push_fn: Option<Arc<dyn OnEventFn>>,
    on_pop_fn: Option<Arc<dyn OnEventFn>>,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    #[inline]
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()), on_push_fn: None, on_pop_fn: None }
    }

    #[inline]
    pub fn on_push<F>(&mut self, f: F)
    where
        F: OnEventFn,
    {
        self.on_push_fn = Some(Arc::new(f));
    }

    #[inline]
    pub fn on_pop<F>(&mut self, f: F)
    where
        F: OnEventFn,
    {
        self.on_pop_fn = Some(Arc::new(f));
    }

    /// Returns the handle back when a handle for the same message is already queued.
    #[inline]
    pub fn add(&self, handle: MessageHandle) -> Result<(), MessageHandle> {
        {
            let mut inner = self.inner.lock();
            if inner.index.contains_key(handle.id()) {
                return Err(handle);
            }
            let key = handle.key();
            inner.index.insert(handle.id().clone(), key.clone());
            inner.sorted.insert(key, handle);
        }
        if let Some(f) = self.on_push_fn.as_ref() {
            f();
        }
        Ok(())
    }

    #[inline]
    pub fn remove_first(&self) -> Option<MessageHandle> {
        let handle = {
            let mut inner = self.inner.lock();
            let (_, handle) = inner.sorted.pop_first()?;
            inner.index.remove(handle.id());
            handle
        };
        self.popped();
        Some(handle)
    }

    #[inline]
    pub fn remove(&self, id: &MessageId) -> Option<MessageHandle> {
        let handle = {
            let mut inner = self.inner.lock();
            let key = inner.index.remove(id)?;
            inner.sorted.remove(&key)
        };
        if handle.is_some() {
            self.popped();
        }
        handle
    }

    #[inline]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    /// Ids and refs of the queued handles, in delivery order.
    #[inline]
    pub fn snapshot(&self) -> Vec<(MessageId, Arc<MessageRef>)> {
        self.inner.lock().sorted.values().map(|h| (h.id().clone(), h.message_ref().clone())).collect()
    }

    #[inline]
    pub fn ids(&self) -> Vec<MessageId> {
        self.inner.lock().sorted.values().map(|h| h.id().clone()).collect()
    }

    /// Empties the queue, handing the handles back in delivery order.
    #[inline]
    pub fn drain(&self) -> Vec<MessageHandle> {
        let sorted = {
            let mut inner = self.inner.lock();
            inner.index.clear();
            std::mem::take(&mut inner.sorted)
        };
        let handles = sorted.into_values().collect::<Vec<_>>();
        for _ in 0..handles.len() {
            self.popped();
        }
        handles
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().sorted.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn popped(&self) {
        if let Some(f) = self.on_pop_fn.as_ref() {
            f();
        }
    }
}
