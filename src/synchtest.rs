//! # Synchronization tests
//!
//! Stress runs of every primitive, in the spirit of a kernel's built-in test menu.
//! Each one hammers a primitive from many threads and checks the invariant it promises;
//! the first violation is returned as the error.
//!
//! The shared data is plain relaxed atomics on purpose: they don't order anything,
//! so the only thing keeping the checks consistent is the primitive under test.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::Relaxed},
    thread::scope,
};

use crate::{
    cv::ConditionVariable, lock::Lock, rwlock::RwLock, semaphore::Semaphore, spinlock::Spinlock,
};

type TestResult = Result<(), String>;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub threads: usize,
    pub iterations: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 8,
            iterations: 200,
        }
    }
}

// the first failure wins, the rest are dropped
fn record(failure: &Spinlock<Option<String>>, message: String) {
    let mut slot = failure.lock();
    if slot.is_none() {
        *slot = Some(message);
    }
}

/// Semaphore as a pool of 2 units plus a "done" semaphore the main thread collects threads with
pub fn semtest(config: Config) -> TestResult {
    const UNITS: u32 = 2;
    log::info!("semtest: {} threads, {} iterations", config.threads, config.iterations);
    let pool = Semaphore::new("semtest pool", UNITS).map_err(|e| e.to_string())?;
    let done = Semaphore::new("semtest done", 0).map_err(|e| e.to_string())?;
    let inside = AtomicUsize::new(0);
    let failure = Spinlock::new(None);

    scope(|s| {
        for t in 0..config.threads {
            let (pool, done, inside, failure) = (&pool, &done, &inside, &failure);
            s.spawn(move || {
                for _ in 0..config.iterations {
                    pool.p();
                    let n = inside.fetch_add(1, Relaxed) + 1;
                    if n > UNITS as usize {
                        record(failure, format!("semtest: {n} threads inside a pool of {UNITS}"));
                    }
                    std::hint::spin_loop();
                    inside.fetch_sub(1, Relaxed);
                    pool.v();
                }
                log::debug!("semtest: thread {t} done");
                done.v();
            });
        }
        for _ in 0..config.threads {
            done.p();
        }
    });

    if let Some(message) = failure.lock().take() {
        return Err(message);
    }
    if pool.count() != UNITS {
        return Err(format!("semtest: pool ended at {}, expected {UNITS}", pool.count()));
    }
    pool.destroy();
    done.destroy();
    log::info!("semtest: passed");
    Ok(())
}

/// Every thread writes a related triple under the lock and checks it reads back intact
pub fn locktest(config: Config) -> TestResult {
    log::info!("locktest: {} threads, {} iterations", config.threads, config.iterations);
    let lock = Lock::new("locktest").map_err(|e| e.to_string())?;
    let (v1, v2, v3) = (AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0));
    let failure = Spinlock::new(None);

    scope(|s| {
        for t in 0..config.threads as u64 {
            let (lock, v1, v2, v3, failure) = (&lock, &v1, &v2, &v3, &failure);
            s.spawn(move || {
                for i in 0..config.iterations as u64 {
                    let value = t * 1_000_003 + i;
                    lock.acquire();
                    if !lock.held_by_caller() {
                        record(failure, "locktest: lock not held after acquire".to_string());
                    }
                    v1.store(value, Relaxed);
                    v2.store(value.wrapping_mul(value), Relaxed);
                    v3.store(value % 3, Relaxed);
                    std::hint::spin_loop();
                    let (a, b, c) = (v1.load(Relaxed), v2.load(Relaxed), v3.load(Relaxed));
                    if a != value || b != value.wrapping_mul(value) || c != value % 3 {
                        record(failure, format!("locktest: thread {t} saw ({a}, {b}, {c}) for {value}"));
                    }
                    lock.release();
                }
            });
        }
    });

    if let Some(message) = failure.lock().take() {
        return Err(message);
    }
    lock.destroy();
    log::info!("locktest: passed");
    Ok(())
}

/// Threads take turns in a fixed order, handing the turn over with a broadcast
pub fn cvtest(config: Config) -> TestResult {
    log::info!("cvtest: {} threads, {} rounds", config.threads, config.iterations);
    let lock = Lock::new("cvtest").map_err(|e| e.to_string())?;
    let cv = ConditionVariable::new("cvtest").map_err(|e| e.to_string())?;
    // whose turn it is, counting down; only touched with the lock held
    let turn = AtomicUsize::new(0);
    let failure = Spinlock::new(None);

    for round in 0..config.iterations {
        lock.acquire();
        turn.store(config.threads, Relaxed);
        lock.release();

        scope(|s| {
            for t in 0..config.threads {
                let (lock, cv, turn, failure) = (&lock, &cv, &turn, &failure);
                s.spawn(move || {
                    lock.acquire();
                    while turn.load(Relaxed) != t + 1 {
                        cv.wait(lock);
                    }
                    if !lock.held_by_caller() {
                        record(failure, format!("cvtest: round {round}, thread {t} woke without the lock"));
                    }
                    turn.store(t, Relaxed);
                    cv.broadcast(lock);
                    lock.release();
                });
            }
        });

        if turn.load(Relaxed) != 0 {
            record(&failure, format!("cvtest: round {round} ended at turn {}", turn.load(Relaxed)));
        }
    }

    if let Some(message) = failure.lock().take() {
        return Err(message);
    }
    cv.destroy();
    lock.destroy();
    log::info!("cvtest: passed");
    Ok(())
}

/// Writers keep a pair (x, 2x) updated, readers check they never see it half-written
/// and that readers and writers never overlap
pub fn rwtest(config: Config) -> TestResult {
    log::info!("rwtest: {} threads, {} iterations", config.threads, config.iterations);
    let rw = RwLock::new("rwtest").map_err(|e| e.to_string())?;
    let (x, y) = (AtomicU64::new(0), AtomicU64::new(0));
    let readers = AtomicUsize::new(0);
    let writer = AtomicBool::new(false);
    let failure = Spinlock::new(None);
    let writers = (config.threads / 4).max(1);

    scope(|s| {
        for t in 0..config.threads {
            let (rw, x, y, readers, writer, failure) = (&rw, &x, &y, &readers, &writer, &failure);
            let is_writer = t < writers;
            s.spawn(move || {
                for i in 0..config.iterations as u64 {
                    if is_writer {
                        rw.acquire_write();
                        if writer.swap(true, Relaxed) || readers.load(Relaxed) != 0 {
                            record(failure, "rwtest: writer shares the lock".to_string());
                        }
                        x.store(i, Relaxed);
                        std::hint::spin_loop();
                        y.store(i * 2, Relaxed);
                        writer.store(false, Relaxed);
                        rw.release_write();
                    } else {
                        rw.acquire_read();
                        readers.fetch_add(1, Relaxed);
                        if writer.load(Relaxed) {
                            record(failure, "rwtest: reader next to a writer".to_string());
                        }
                        let (a, b) = (x.load(Relaxed), y.load(Relaxed));
                        if b != a * 2 {
                            record(failure, format!("rwtest: torn pair ({a}, {b})"));
                        }
                        readers.fetch_sub(1, Relaxed);
                        rw.release_read();
                    }
                }
            });
        }
    });

    if let Some(message) = failure.lock().take() {
        return Err(message);
    }
    rw.destroy();
    log::info!("rwtest: passed");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    const SMALL: Config = Config {
        threads: 4,
        iterations: 50,
    };

    #[test]
    fn test_semtest() {
        assert_eq!(semtest(SMALL), Ok(()));
    }

    #[test]
    fn test_locktest() {
        assert_eq!(locktest(SMALL), Ok(()));
    }

    #[test]
    fn test_cvtest() {
        assert_eq!(
            cvtest(Config {
                threads: 4,
                iterations: 5
            }),
            Ok(())
        );
    }

    #[test]
    fn test_rwtest() {
        assert_eq!(rwtest(SMALL), Ok(()));
    }
}
