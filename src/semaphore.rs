//! # Semaphore
//!
//! A counter of available resources:
//! - P (decrement) takes one, sleeping while there're none
//! - V (increment) gives one back and wakes a sleeper
//!
//! The count is guarded by a spinlock which also protects the wait channel queue.
//!
//! There's no strict FIFO among the sleepers: a thread that just came in may grab the count
//! before a woken one re-checks it. The woken one simply goes back to sleep.

use crate::{error::Result, kalloc, spinlock::Spinlock, thread, wchan::WaitChannel};

pub struct Semaphore {
    name: String,
    wchan: WaitChannel,
    count: Spinlock<u32>,
}

impl Semaphore {
    pub fn new(name: &str, initial_count: u32) -> Result<Self> {
        let name = kalloc::kstrdup(name, "semaphore name")?;
        let wchan = WaitChannel::new(&name)?;
        log::trace!("sem_create: {name} ({initial_count})");
        Ok(Self {
            name,
            wchan,
            count: Spinlock::new(initial_count),
        })
    }

    /// Dropping the wait channel asserts nobody sleeps on it,
    /// dropping the spinlock asserts it's free.
    pub fn destroy(self) {
        log::trace!("sem_destroy: {}", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// P: take one unit, sleep until there's one
    ///
    /// # Panics
    /// When called from a context that can't block, even if it wouldn't actually need to.
    pub fn p(&self) {
        thread::assert_may_block("P");

        let mut count = self.count.lock();
        while *count == 0 {
            log::debug!("P: {} is empty, sleeping", self.name);
            // loop, as another thread might've taken the unit we were woken up for
            count = self.wchan.sleep(count);
        }
        assert!(*count > 0);
        *count -= 1;
    }

    /// V: give one unit back and wake one sleeper
    pub fn v(&self) {
        thread::assert_may_block("V");

        let mut count = self.count.lock();
        assert!(*count < u32::MAX, "V: {} count overflow", self.name);
        *count += 1;
        self.wchan.wake_one(&count);
    }

    pub fn decrement(&self) {
        self.p()
    }

    pub fn increment(&self) {
        self.v()
    }

    /// Snapshot, it may be stale right after returning
    pub fn count(&self) -> u32 {
        *self.count.lock()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{error::SyncError, thread::InterruptContext};
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed},
        thread::{scope, sleep},
        time::Duration,
    };

    #[test]
    fn test_create_destroy() {
        let sem = Semaphore::new("sem", 3).unwrap();
        assert_eq!(sem.name(), "sem");
        assert_eq!(sem.count(), 3);
        sem.destroy();
    }

    #[test]
    fn test_create_failures() {
        // name, then the channel's name and queue
        for (successes, what) in [
            (0, "semaphore name"),
            (1, "wait channel name"),
            (2, "wait channel queue"),
        ] {
            let _oom = kalloc::fail_after(successes);
            assert_eq!(
                Semaphore::new("sem", 0).err(),
                Some(SyncError::OutOfMemory { what })
            );
        }
        assert!(Semaphore::new("sem", 0).is_ok());
    }

    #[test]
    fn test_count_accounting() {
        let sem = Semaphore::new("sem", 2).unwrap();
        sem.v();
        sem.v();
        sem.p();
        // 2 + 2 - 1
        assert_eq!(sem.count(), 3);
        sem.p();
        sem.p();
        sem.p();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_zero_one_zero() {
        let sem = Semaphore::new("sem", 0).unwrap();
        let first_done = AtomicBool::new(false);
        let second_done = AtomicBool::new(false);

        scope(|s| {
            // A blocks
            s.spawn(|| {
                sem.decrement();
                first_done.store(true, Relaxed);
            });
            sleep(Duration::from_millis(50));
            assert!(!first_done.load(Relaxed));

            // B lets it through
            s.spawn(|| sem.increment());
            while !first_done.load(Relaxed) {
                sleep(Duration::from_millis(5));
            }
            assert_eq!(sem.count(), 0);

            // a third one blocks again, as the count is back at 0
            s.spawn(|| {
                sem.decrement();
                second_done.store(true, Relaxed);
            });
            sleep(Duration::from_millis(50));
            assert!(!second_done.load(Relaxed));
            sem.increment();
        });
        assert!(second_done.load(Relaxed));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_bounded_resource() {
        // no more than 2 threads inside at a time
        let sem = Semaphore::new("pool", 2).unwrap();
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);
        scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..200 {
                        sem.p();
                        let n = inside.fetch_add(1, Relaxed) + 1;
                        max_inside.fetch_max(n, Relaxed);
                        std::hint::spin_loop();
                        inside.fetch_sub(1, Relaxed);
                        sem.v();
                    }
                });
            }
        });
        assert!(max_inside.load(Relaxed) <= 2);
        assert_eq!(sem.count(), 2);
    }

    #[test]
    #[should_panic(expected = "may not block in an interrupt handler")]
    fn test_p_in_interrupt() {
        let sem = Semaphore::new("sem", 1).unwrap();
        let _irq = InterruptContext::enter();
        sem.p();
    }

    #[test]
    #[should_panic(expected = "V: may not block in an interrupt handler")]
    fn test_v_in_interrupt() {
        let sem = Semaphore::new("sem", 0).unwrap();
        let _irq = InterruptContext::enter();
        sem.v();
    }
}
