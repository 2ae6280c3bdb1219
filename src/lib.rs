//! # Kernel synchronization
//!
//! Sleeping synchronization primitives of a small kernel, built bottom-up:
//! - [spinlock] and [wchan] - busy-wait lock and a queue to sleep on, the two building blocks
//! - [semaphore] - counting semaphore (P/V)
//! - [lock] - sleeping mutex with an owner
//! - [cv] - Mesa condition variable, used together with a [lock::Lock]
//! - [rwlock] - reader-writer lock with writer preference
//!
//! plus the pieces around them: fallible allocation ([kalloc]), the current thread ([thread]),
//! deadlock detection ([hangman]) and stress tests ([synchtest]).

pub mod cv;
pub mod error;
pub mod hangman;
pub mod kalloc;
pub mod lock;
pub mod logger;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;
pub mod synchtest;
pub mod thread;
pub mod wchan;

pub use cv::ConditionVariable;
pub use error::{Result, SyncError};
pub use hangman::{Hangman, LockObserver};
pub use lock::Lock;
pub use rwlock::{RwLock, RwState};
pub use semaphore::Semaphore;
pub use spinlock::{SpinGuard, Spinlock};
pub use wchan::WaitChannel;
