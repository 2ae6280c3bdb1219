//! # Wait channel
//!
//! A named queue of sleeping threads. It's the only place where a thread actually goes to sleep.
//!
//! The key operation is [WaitChannel::sleep]: it takes the guard of the spinlock that protects the
//! caller's condition, queues the caller, gives the spinlock up and sleeps - as one step
//! for anyone who wants to wake it. Wakers have to hold the same spinlock (they pass its guard),
//! so a waker either runs before the sleeper checked its condition or finds the sleeper queued.
//! No wake-up is lost in between.
//!
//! Sleeping is done with futex-like [atomic_wait::wait] on a per-sleeper word:
//! - 0 - still asleep
//! - 1 - woken up
//!
//! The wait only blocks while the word is 0, so a wake that lands before the sleeper blocked isn't lost either.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicU32,
            Ordering::{Acquire, Release},
        },
        Arc,
    },
};

use atomic_wait::{wait, wake_one};

use crate::{
    error::Result,
    kalloc,
    spinlock::{SpinGuard, Spinlock},
    thread::{self, ThreadId},
};

const ASLEEP: u32 = 0;
const AWAKE: u32 = 1;

struct Sleeper {
    thread: ThreadId,
    state: AtomicU32,
}

pub struct WaitChannel {
    name: String,
    // FIFO, but wakers don't hand anything over, so whoever grabs the spinlock first wins
    sleepers: Spinlock<VecDeque<Arc<Sleeper>>>,
}

impl WaitChannel {
    pub fn new(name: &str) -> Result<Self> {
        let name = kalloc::kstrdup(name, "wait channel name")?;
        let mut sleepers = VecDeque::new();
        kalloc::reserve(&mut sleepers, 1, "wait channel queue")?;
        Ok(Self {
            name,
            sleepers: Spinlock::new(sleepers),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Atomically give up `guard`'s spinlock and sleep until woken up.
    /// The spinlock is taken again before returning.
    ///
    /// # Panics
    /// In an interrupt handler, or if the caller holds any spinlock besides `guard`'s.
    pub fn sleep<'a, Y>(&self, guard: SpinGuard<'a, Y>) -> SpinGuard<'a, Y> {
        assert!(
            !thread::in_interrupt(),
            "wchan_sleep: {} may not sleep in an interrupt handler",
            self.name
        );
        assert_eq!(
            thread::spinlocks_held(),
            1,
            "wchan_sleep: {} must hold exactly the guard spinlock",
            self.name
        );

        let me = Arc::new(Sleeper {
            thread: thread::current(),
            state: AtomicU32::new(ASLEEP),
        });
        // queued while the caller's spinlock is still held => visible to every later waker
        self.sleepers.lock().push_back(Arc::clone(&me));
        let lock = guard.spinlock();
        drop(guard);

        // Acquire pairs with the waker's Release, spurious futex returns just loop
        while me.state.load(Acquire) == ASLEEP {
            wait(&me.state, ASLEEP);
        }
        lock.lock()
    }

    /// Wake the longest sleeper, if any. Returns whether somebody was woken up.
    pub fn wake_one<Y>(&self, _held: &SpinGuard<'_, Y>) -> bool {
        let sleeper = self.sleepers.lock().pop_front();
        match sleeper {
            Some(sleeper) => {
                Self::wake(&sleeper);
                true
            }
            None => false,
        }
    }

    /// Wake everybody. Returns how many were woken up.
    pub fn wake_all<Y>(&self, _held: &SpinGuard<'_, Y>) -> usize {
        let sleepers = std::mem::take(&mut *self.sleepers.lock());
        for sleeper in &sleepers {
            Self::wake(sleeper);
        }
        sleepers.len()
    }

    pub fn is_empty<Y>(&self, _held: &SpinGuard<'_, Y>) -> bool {
        self.sleepers.lock().is_empty()
    }

    fn wake(sleeper: &Sleeper) {
        log::trace!("wchan: waking {}", sleeper.thread);
        sleeper.state.store(AWAKE, Release);
        wake_one(&sleeper.state);
    }
}

/// Destroying a channel someone sleeps on would leave them asleep forever
impl Drop for WaitChannel {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(
                self.sleepers.get_mut().is_empty(),
                "wchan_destroy: {} has sleepers",
                self.name
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::SyncError;
    use std::{
        thread::{scope, sleep},
        time::Duration,
    };

    #[test]
    fn test_sleep_and_wake() {
        let wchan = WaitChannel::new("test").unwrap();
        let ready = Spinlock::new(false);
        scope(|s| {
            s.spawn(|| {
                let mut g = ready.lock();
                while !*g {
                    g = wchan.sleep(g);
                }
                // the spinlock is back
                assert!(ready.do_i_hold());
            });
            sleep(Duration::from_millis(50));
            let mut g = ready.lock();
            *g = true;
            wchan.wake_one(&g);
        });
        assert!(wchan.is_empty(&ready.lock()));
    }

    #[test]
    fn test_wake_all() {
        let wchan = WaitChannel::new("test").unwrap();
        // (go, parked)
        let state = Spinlock::new((false, 0));
        scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    let mut g = state.lock();
                    g.1 += 1;
                    while !g.0 {
                        g = wchan.sleep(g);
                    }
                });
            }
            // a thread counts itself and queues up under the same spinlock hold
            let mut g = state.lock();
            while g.1 < 3 {
                drop(g);
                sleep(Duration::from_millis(10));
                g = state.lock();
            }
            g.0 = true;
            assert_eq!(wchan.wake_all(&g), 3);
        });
        assert!(wchan.is_empty(&state.lock()));
    }

    #[test]
    fn test_wake_nobody() {
        let wchan = WaitChannel::new("empty").unwrap();
        let l = Spinlock::new(());
        let g = l.lock();
        assert!(!wchan.wake_one(&g));
        assert_eq!(wchan.wake_all(&g), 0);
    }

    #[test]
    fn test_alloc_failures() {
        for (successes, what) in [(0, "wait channel name"), (1, "wait channel queue")] {
            let _oom = kalloc::fail_after(successes);
            assert_eq!(
                WaitChannel::new("x").err(),
                Some(SyncError::OutOfMemory { what })
            );
        }
    }

    #[test]
    #[should_panic(expected = "must hold exactly the guard spinlock")]
    fn test_sleep_with_two_spinlocks() {
        let wchan = WaitChannel::new("test").unwrap();
        let a = Spinlock::new(());
        let b = Spinlock::new(());
        let _ga = a.lock();
        let gb = b.lock();
        wchan.sleep(gb);
    }
}
