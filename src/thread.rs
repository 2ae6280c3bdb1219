//! # Current thread
//!
//! The primitives need 3 things from the scheduler:
//! - who's calling, as a comparable identity (lock owners)
//! - whether we're inside an interrupt handler (blocking there is forbidden)
//! - how many spinlocks the calling thread holds (blocking while holding one is forbidden too)
//!
//! Everything is per-thread state, so thread locals do the job - no process-wide mutable globals.
//! Interrupt handlers don't exist in a hosted process, [InterruptContext] marks a stretch of code as one.

use std::{
    cell::Cell,
    fmt,
    marker::PhantomData,
    num::NonZeroU64,
    sync::atomic::{AtomicU64, Ordering::Relaxed},
};

/// Stable identity of a thread, never reused within the process.
///
/// std's `ThreadId::as_u64` isn't stable, and the spinlock wants to keep its holder in an atomic,
/// so we hand out our own numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ID: ThreadId = {
        // Relaxed is fine, uniqueness is all we need
        let id = NEXT_ID.fetch_add(1, Relaxed);
        ThreadId(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    };
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
    static SPINLOCKS_HELD: Cell<usize> = const { Cell::new(0) };
}

/// Identity of the calling thread
pub fn current() -> ThreadId {
    ID.with(|id| *id)
}

pub fn in_interrupt() -> bool {
    IN_INTERRUPT.with(Cell::get)
}

/// Number of spinlocks the calling thread holds right now
pub fn spinlocks_held() -> usize {
    SPINLOCKS_HELD.with(Cell::get)
}

pub(crate) fn spinlock_taken() {
    SPINLOCKS_HELD.with(|n| n.set(n.get() + 1));
}

pub(crate) fn spinlock_dropped() {
    SPINLOCKS_HELD.with(|n| {
        assert!(n.get() > 0, "spinlock release without a matching acquire");
        n.set(n.get() - 1);
    });
}

/// # Panics
/// When the calling thread can't be put to sleep: it runs an interrupt handler or holds a spinlock.
pub fn assert_may_block(op: &str) {
    assert!(!in_interrupt(), "{op}: may not block in an interrupt handler");
    assert_eq!(
        spinlocks_held(),
        0,
        "{op}: may not block while holding a spinlock"
    );
}

/// Marks the calling thread as running an interrupt handler until dropped.
///
/// It's tied to the thread that made it, hence `!Send`.
pub struct InterruptContext {
    previous: bool,
    _not_send: PhantomData<*const ()>,
}

impl InterruptContext {
    pub fn enter() -> Self {
        let previous = IN_INTERRUPT.with(|f| f.replace(true));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for InterruptContext {
    fn drop(&mut self) {
        IN_INTERRUPT.with(|f| f.set(self.previous));
    }
}
