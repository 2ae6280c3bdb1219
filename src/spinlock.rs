/*
 * The spinlock is the bottom of the stack: a busy-wait lock for short critical sections.
 * It never puts a thread to sleep, so it's fine where sleeping is not (e.g. interrupt handlers).
 *
 * Holding one counts as "interrupts off" for the holder => it must not block while holding it,
 * the only exception is WaitChannel::sleep which gives the spinlock up atomically.
 */

use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicBool, AtomicU64,
        Ordering::{Acquire, Relaxed, Release},
    },
};

use crate::thread;

// nobody holds the lock
const NO_HOLDER: u64 = 0;

pub struct Spinlock<Y> {
    locked: AtomicBool,
    // ThreadId of the holder, only used for do_i_hold checks
    holder: AtomicU64,
    value: UnsafeCell<Y>,
}
// same promise as for any lock - the value is only reachable through the guard
unsafe impl<Y> Sync for Spinlock<Y> where Y: Send {}

impl<Y> Spinlock<Y> {
    pub const fn new(value: Y) -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicU64::new(NO_HOLDER),
            value: UnsafeCell::new(value),
        }
    }

    /// # Panics
    /// If the calling thread holds the lock already - it'd spin forever otherwise
    pub fn lock(&self) -> SpinGuard<'_, Y> {
        assert!(!self.do_i_hold(), "spinlock_acquire: deadlock, already held");
        // "disable interrupts" before spinning, as the kernel does
        thread::spinlock_taken();
        while self
            .locked
            .compare_exchange_weak(false, true, Acquire, Relaxed)
            .is_err()
        {
            // spin on a load, it's cheaper on the cache than CAS
            while self.locked.load(Relaxed) {
                std::hint::spin_loop();
            }
        }
        self.holder.store(thread::current().as_u64(), Relaxed);
        SpinGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, Y>> {
        thread::spinlock_taken();
        if self
            .locked
            .compare_exchange(false, true, Acquire, Relaxed)
            .is_ok()
        {
            self.holder.store(thread::current().as_u64(), Relaxed);
            Some(SpinGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            thread::spinlock_dropped();
            None
        }
    }

    /// Only the answer "it's me" is reliable, other threads may change the holder any moment
    pub fn do_i_hold(&self) -> bool {
        self.holder.load(Relaxed) == thread::current().as_u64()
    }

    pub fn get_mut(&mut self) -> &mut Y {
        self.value.get_mut()
    }
}

/// Cleanup: a guard borrows the lock, so it can only be held here if the guard was leaked
impl<Y> Drop for Spinlock<Y> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(!*self.locked.get_mut(), "spinlock_cleanup: still held");
        }
    }
}

/// Proof of holding the spinlock, unlocks on drop.
///
/// It's !Send: the "interrupts off" accounting belongs to the thread that locked.
pub struct SpinGuard<'a, Y> {
    lock: &'a Spinlock<Y>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, Y> SpinGuard<'a, Y> {
    /// The lock behind the guard, to take it again after giving the guard up
    pub fn spinlock(&self) -> &'a Spinlock<Y> {
        self.lock
    }
}

impl<Y> Deref for SpinGuard<'_, Y> {
    type Target = Y;
    fn deref(&self) -> &Self::Target {
        // SAFETY: existence of the guard is caused by locking its lock
        unsafe { &*self.lock.value.get() }
    }
}

impl<Y> DerefMut for SpinGuard<'_, Y> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: existence of the guard is caused by locking its lock
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<Y> Drop for SpinGuard<'_, Y> {
    fn drop(&mut self) {
        self.lock.holder.store(NO_HOLDER, Relaxed);
        self.lock.locked.store(false, Release);
        thread::spinlock_dropped();
    }
}
