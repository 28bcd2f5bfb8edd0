use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cancellation check consulted between delivery attempts.
pub trait Condition: Send + Sync {
    fn is_met(&self) -> bool;
}

/// One-way flag. Once set it stays set.
#[derive(Debug, Default)]
pub struct Flag(AtomicBool);

impl Flag {
    #[inline]
    pub fn new() -> Self {
        Flag(AtomicBool::new(false))
    }

    /// Returns the previous value.
    #[inline]
    pub fn set(&self) -> bool {
        self.0.swap(true, Ordering::SeqCst)
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Condition for Flag {
    #[inline]
    fn is_met(&self) -> bool {
        self.is_set()
    }
}

pub struct Or<'a>(pub &'a dyn Condition, pub &'a dyn Condition);

impl Condition for Or<'_> {
    #[inline]
    fn is_met(&self) -> bool {
        self.0.is_met() || self.1.is_met()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    #[inline]
    pub fn at(instant: Instant) -> Self {
        Deadline(instant)
    }

    #[inline]
    pub fn after(timeout: Duration) -> Self {
        Deadline(Instant::now() + timeout)
    }

    #[inline]
    pub fn instant(&self) -> Instant {
        self.0
    }
}

impl Condition for Deadline {
    #[inline]
    fn is_met(&self) -> bool {
        Instant::now() >= self.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl Condition for Never {
    #[inline]
    fn is_met(&self) -> bool {
        false
    }
}
