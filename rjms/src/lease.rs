use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use rjms_utils::{remaining_millis, timestamp_millis, TimestampMillis};

use crate::queue::OrderedQueue;
use crate::types::MessageId;
use crate::Result;

static LEASE_ID: AtomicU64 = AtomicU64::new(1);

pub trait LeaseListener: Sync + Send {
    fn on_lease_expired(&self, lease: &Lease);
}

/// Timed registration for one message; fires its listener once at `deadline`.
pub struct Lease {
    id: u64,
    message_id: MessageId,
    duration: TimestampMillis,
    deadline: TimestampMillis,
    listener: Weak<dyn LeaseListener>,
}

impl Lease {
    /// `duration` is clamped to at least 1ms.
    #[inline]
    pub fn new(message_id: MessageId, duration: TimestampMillis, listener: Weak<dyn LeaseListener>) -> Self {
        Self::with_start(message_id, duration, timestamp_millis(), listener)
    }

    #[inline]
    pub fn with_start(
        message_id: MessageId,
        duration: TimestampMillis,
        start: TimestampMillis,
        listener: Weak<dyn LeaseListener>,
    ) -> Self {
        let duration = duration.max(1);
        Self {
            id: LEASE_ID.fetch_add(1, Ordering::SeqCst),
            message_id,
            duration,
            deadline: start + duration,
            listener,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    #[inline]
    pub fn duration(&self) -> TimestampMillis {
        self.duration
    }

    #[inline]
    pub fn deadline(&self) -> TimestampMillis {
        self.deadline
    }

    #[inline]
    fn expire(&self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_lease_expired(self);
        }
    }
}

impl PartialEq for Lease {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Lease {{ id: {}, message_id: {}, deadline: {} }}", self.id, self.message_id, self.deadline)
    }
}

pub trait LeaseManager: Sync + Send {
    fn add_lease(&self, lease: Arc<Lease>) -> Result<()>;

    ///Returns false if the lease had already fired or been removed.
    fn remove_lease(&self, lease: &Arc<Lease>) -> bool;

    fn len(&self) -> usize;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    ///Starts the background timer, if the implementation has one.
    fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        None
    }
}

pub struct DefaultLeaseManager {
    leases: OrderedQueue<Arc<Lease>>,
    notify: Notify,
    check_interval: Duration,
}

impl DefaultLeaseManager {
    #[inline]
    pub fn new(check_interval: Duration) -> DefaultLeaseManager {
        Self {
            leases: OrderedQueue::new(|a: &Arc<Lease>, b: &Arc<Lease>| a.deadline.cmp(&b.deadline)),
            notify: Notify::new(),
            check_interval,
        }
    }

    /// Fires every lease due at `now`, each exactly once, outside the queue lock.
    pub fn expire(&self, now: TimestampMillis) -> usize {
        let mut n = 0;
        while let Some(lease) = self.leases.remove_first_if(|l| l.deadline <= now) {
            log::debug!("lease expired, {:?}", lease);
            lease.expire();
            n += 1;
        }
        n
    }

    #[inline]
    pub fn next_deadline(&self) -> Option<TimestampMillis> {
        self.leases.first_with(|l| l.deadline)
    }

    #[inline]
    fn sleep_time(&self, now: TimestampMillis) -> Duration {
        let max = self.check_interval.max(Duration::from_millis(1));
        match self.next_deadline() {
            Some(deadline) => Duration::from_millis(remaining_millis(deadline, now) as u64).min(max),
            None => max,
        }
    }
}

impl LeaseManager for DefaultLeaseManager {
    fn add_lease(&self, lease: Arc<Lease>) -> Result<()> {
        let earliest = self.next_deadline().map(|d| lease.deadline < d).unwrap_or(true);
        self.leases.add(lease);
        if earliest {
            self.notify.notify_one();
        }
        Ok(())
    }

    #[inline]
    fn remove_lease(&self, lease: &Arc<Lease>) -> bool {
        self.leases.remove(lease)
    }

    #[inline]
    fn len(&self) -> usize {
        self.leases.len()
    }

    fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let mgr = Arc::downgrade(&self);
        drop(self);
        Some(tokio::spawn(async move {
            while let Some(mgr) = mgr.upgrade() {
                let now = timestamp_millis();
                mgr.expire(now);
                let sleep = mgr.sleep_time(now);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {},
                    _ = mgr.notify.notified() => {},
                }
            }
            log::debug!("lease timer stopped");
        }))
    }
}
