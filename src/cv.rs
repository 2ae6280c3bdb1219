//! # Condition variable
//!
//! Mesa semantics: [ConditionVariable::wait] releases the lock, sleeps until a signal, then re-acquires the lock.
//! By the time the waiter has the lock back the condition may not hold anymore
//! (another thread could've run first), so the waiter re-checks it in a loop:
//!
//! ```ignore
//! lock.acquire();
//! while !condition() {
//!     cv.wait(&lock);
//! }
//! ```
//!
//! The cv doesn't remember the lock, every call passes it and must be made while holding it.
//!
//! ## Not losing signals
//!
//! The waiter takes the cv's spinlock first, then releases the lock, then sleeps (which gives up the spinlock).
//! A signaller holds the lock and then takes the cv's spinlock => it can't get between
//! "lock released" and "asleep" of the waiter.

use crate::{error::Result, kalloc, lock::Lock, spinlock::Spinlock, thread, wchan::WaitChannel};

pub struct ConditionVariable {
    name: String,
    wchan: WaitChannel,
    guard: Spinlock<()>,
}

impl ConditionVariable {
    pub fn new(name: &str) -> Result<Self> {
        let name = kalloc::kstrdup(name, "cv name")?;
        let wchan = WaitChannel::new(&name)?;
        log::trace!("cv_create: {name}");
        Ok(Self {
            name,
            wchan,
            guard: Spinlock::new(()),
        })
    }

    /// # Panics
    /// If somebody still waits on it (the wait channel checks that)
    pub fn destroy(self) {
        log::trace!("cv_destroy: {}", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn assert_holds(&self, op: &str, lock: &Lock) {
        assert!(
            lock.held_by_caller(),
            "{op}: {} used without holding {}",
            self.name,
            lock.name()
        );
    }

    /// Release `lock`, sleep until signalled, re-acquire `lock`
    ///
    /// # Panics
    /// - if the caller doesn't hold `lock`
    /// - from a context that can't block
    pub fn wait(&self, lock: &Lock) {
        self.assert_holds("cv_wait", lock);
        thread::assert_may_block("cv_wait");

        let guard = self.guard.lock();
        lock.release();
        let guard = self.wchan.sleep(guard);
        drop(guard);
        lock.acquire();
    }

    /// Wake one waiter, if there's any
    pub fn signal(&self, lock: &Lock) {
        self.assert_holds("cv_signal", lock);
        let guard = self.guard.lock();
        self.wchan.wake_one(&guard);
    }

    /// Wake all the waiters
    pub fn broadcast(&self, lock: &Lock) {
        self.assert_holds("cv_broadcast", lock);
        let guard = self.guard.lock();
        self.wchan.wake_all(&guard);
    }
}
