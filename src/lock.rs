//! # Lock
//!
//! A sleeping mutex with an owner. Unlike the [Spinlock](crate::spinlock::Spinlock),
//! a thread that finds it held goes to sleep on the lock's wait channel.
//!
//! There's no guard: acquire and release are separate calls, as the condition variables
//! release and re-acquire the lock on the caller's behalf.
//! Owner tracking is what keeps this honest - releasing a lock you don't hold is a bug and panics.
//!
//! The internal state is protected by a spinlock, the same one the wait channel sleeps with:
//! checking `held` and going to sleep is one atomic step, so a release in between can't be missed.

use std::{fmt, sync::Arc};

use crate::{
    error::Result,
    hangman::{LockObserver, Lockable, LockableId},
    kalloc,
    spinlock::Spinlock,
    thread::{self, ThreadId},
    wchan::WaitChannel,
};

struct LockState {
    held: bool,
    owner: Option<ThreadId>,
    // sleepers, for diagnostics only
    waiters: u32,
}

pub struct Lock {
    name: String,
    id: LockableId,
    wchan: WaitChannel,
    state: Spinlock<LockState>,
    observer: Option<Arc<dyn LockObserver>>,
}

impl Lock {
    pub fn new(name: &str) -> Result<Self> {
        Self::build(name, None)
    }

    /// A lock reporting its wait/acquire/release events, e.g. to [Hangman](crate::hangman::Hangman)
    pub fn with_observer(name: &str, observer: Arc<dyn LockObserver>) -> Result<Self> {
        Self::build(name, Some(observer))
    }

    fn build(name: &str, observer: Option<Arc<dyn LockObserver>>) -> Result<Self> {
        let name = kalloc::kstrdup(name, "lock name")?;
        let wchan = WaitChannel::new(&name)?;
        let id = LockableId::next();
        log::trace!("lock_create: {name} ({id})");
        Ok(Self {
            name,
            id,
            wchan,
            state: Spinlock::new(LockState {
                held: false,
                owner: None,
                waiters: 0,
            }),
            observer,
        })
    }

    /// # Panics
    /// If the lock is held, see [Drop]
    pub fn destroy(self) {
        log::trace!("lock_destroy: {}", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lockable(&self) -> Lockable<'_> {
        Lockable {
            id: self.id,
            name: &self.name,
        }
    }

    /// # Panics
    /// - from a context that can't block
    /// - if the caller holds the lock already
    pub fn acquire(&self) {
        thread::assert_may_block("lock_acquire");
        let me = thread::current();
        if let Some(observer) = &self.observer {
            observer.on_wait(me, self.lockable());
        }

        let mut state = self.state.lock();
        assert!(
            state.owner != Some(me),
            "lock_acquire: {} already held by {me}",
            self.name
        );
        if state.held {
            log::debug!("lock_acquire: {me} waits for {}", self.name);
        }
        state.waiters += 1;
        while state.held {
            // gives the spinlock up and takes it back atomically => no lost wake-up
            state = self.wchan.sleep(state);
        }
        state.waiters -= 1;
        state.held = true;
        state.owner = Some(me);
        drop(state);

        if let Some(observer) = &self.observer {
            observer.on_acquire(me, self.lockable());
        }
    }

    /// # Panics
    /// If the caller doesn't hold the lock
    pub fn release(&self) {
        assert!(
            self.held_by_caller(),
            "lock_release: {} not held by {}",
            self.name,
            thread::current()
        );

        // reported while still held, so nobody can take the lock before the observer forgets us
        if let Some(observer) = &self.observer {
            observer.on_release(thread::current(), self.lockable());
        }

        let mut state = self.state.lock();
        state.held = false;
        state.owner = None;
        self.wchan.wake_one(&state);
    }

    pub fn held_by_caller(&self) -> bool {
        let state = self.state.lock();
        state.held && state.owner == Some(thread::current())
    }

    /// Number of threads sleeping on the lock, a snapshot
    pub fn waiters(&self) -> u32 {
        self.state.lock().waiters
    }
}

/// Destroying a held lock is a bug: the owner would release a dangling lock.
/// Sleepers are caught by the wait channel's own drop.
impl Drop for Lock {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(
                !self.state.get_mut().held,
                "lock_destroy: {} is held",
                self.name
            );
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{error::SyncError, hangman::Hangman, thread::InterruptContext};
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed},
        thread::{scope, sleep},
        time::Duration,
    };

    #[test]
    fn test_create_destroy() {
        let lock = Lock::new("lk").unwrap();
        assert_eq!(lock.name(), "lk");
        assert!(!lock.held_by_caller());
        lock.destroy();
    }

    #[test]
    fn test_create_failures() {
        for (successes, what) in [
            (0, "lock name"),
            (1, "wait channel name"),
            (2, "wait channel queue"),
        ] {
            let _oom = kalloc::fail_after(successes);
            assert_eq!(
                Lock::new("lk").err(),
                Some(SyncError::OutOfMemory { what })
            );
        }
    }

    #[test]
    fn test_ownership() {
        let lock = Lock::new("lk").unwrap();
        lock.acquire();
        assert!(lock.held_by_caller());
        scope(|s| {
            s.spawn(|| assert!(!lock.held_by_caller()));
        });
        lock.release();
        assert!(!lock.held_by_caller());
    }

    #[test]
    fn test_mutual_exclusion() {
        let lock = Lock::new("lk").unwrap();
        let inside = AtomicUsize::new(0);
        let violations = AtomicUsize::new(0);
        let total = AtomicUsize::new(0);
        scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..500 {
                        lock.acquire();
                        if inside.fetch_add(1, Relaxed) != 0 {
                            violations.fetch_add(1, Relaxed);
                        }
                        total.fetch_add(1, Relaxed);
                        std::hint::spin_loop();
                        inside.fetch_sub(1, Relaxed);
                        lock.release();
                    }
                });
            }
        });
        assert_eq!(violations.load(Relaxed), 0);
        assert_eq!(total.load(Relaxed), 4000);
        assert_eq!(lock.waiters(), 0);
    }

    #[test]
    fn test_blocks_until_released() {
        let lock = Lock::new("lk").unwrap();
        let acquired = AtomicBool::new(false);
        lock.acquire();
        scope(|s| {
            s.spawn(|| {
                lock.acquire();
                acquired.store(true, Relaxed);
                lock.release();
            });
            // wait until it's asleep on the lock
            while lock.waiters() == 0 {
                sleep(Duration::from_millis(5));
            }
            assert!(!acquired.load(Relaxed));
            lock.release();
        });
        assert!(acquired.load(Relaxed));
    }

    #[test]
    #[should_panic(expected = "not held")]
    fn test_release_unheld() {
        let lock = Lock::new("lk").unwrap();
        lock.release();
    }

    #[test]
    fn test_release_by_other_thread_panics() {
        let lock = Lock::new("lk").unwrap();
        lock.acquire();
        let result = scope(|s| s.spawn(|| lock.release()).join());
        assert!(result.is_err());
        assert!(lock.held_by_caller());
        lock.release();
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn test_recursive_acquire() {
        let lock = Lock::new("lk").unwrap();
        lock.acquire();
        lock.acquire();
    }

    #[test]
    #[should_panic(expected = "lock_destroy: lk is held")]
    fn test_destroy_held() {
        let lock = Lock::new("lk").unwrap();
        lock.acquire();
        lock.destroy();
    }

    #[test]
    #[should_panic(expected = "may not block in an interrupt handler")]
    fn test_acquire_in_interrupt() {
        let lock = Lock::new("lk").unwrap();
        let _irq = InterruptContext::enter();
        lock.acquire();
    }

    #[test]
    fn test_observer_events() {
        let hangman = Arc::new(Hangman::new());
        let lock = Lock::with_observer("lk", hangman.clone()).unwrap();
        lock.acquire();
        assert_eq!(hangman.holder(lock.id), Some(thread::current()));
        lock.release();
        assert_eq!(hangman.holder(lock.id), None);
    }

    #[test]
    fn test_observer_tracks_holder_under_contention() {
        let hangman = Arc::new(Hangman::new());
        let lock = Lock::with_observer("lk", hangman.clone()).unwrap();
        let lost = AtomicUsize::new(0);
        scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let me = thread::current();
                    for _ in 0..2000 {
                        lock.acquire();
                        for _ in 0..20 {
                            std::hint::spin_loop();
                        }
                        if hangman.holder(lock.id) != Some(me) {
                            lost.fetch_add(1, Relaxed);
                        }
                        lock.release();
                    }
                });
            }
        });
        assert_eq!(lost.load(Relaxed), 0);
        assert_eq!(hangman.holder(lock.id), None);
    }

    #[test]
    #[should_panic(expected = "hangman: deadlock")]
    fn test_observer_catches_self_deadlock() {
        let lock = Lock::with_observer("lk", Arc::new(Hangman::new())).unwrap();
        lock.acquire();
        lock.acquire();
    }
}
