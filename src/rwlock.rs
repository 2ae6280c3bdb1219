//! # Reader-writer lock
//!
//! Many readers or a single writer, never both. Built from one [Lock] (the gate, protecting the counters below)
//! and two [ConditionVariable]s: one readers wait on, one writers wait on.
//!
//! States:
//! - idle - nobody's inside
//! - shared(n) - n readers inside
//! - exclusive - one writer inside
//!
//! ## Starvation
//!
//! A stream of readers could keep the count above 0 forever and a writer would never get in.
//! So a waiting writer stops new readers at the door (writer preference):
//! once the readers inside leave, the last one hands the lock to a waiting writer.
//!
//! The other way round, a done writer prefers the readers that queued up meanwhile and lets the whole batch in.
//! Those readers got in line before the writer's release, so they're admitted even if more writers wait,
//! otherwise they'd be sent back to sleep and nobody would wake the writers.
//! Readers that come after that release see the waiting writers and wait again.
//! The result: a writer waits for at most the batch of readers in front of it,
//! and a reader waits for at most one writer.

use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use crate::{cv::ConditionVariable, error::Result, hangman::LockObserver, kalloc, lock::Lock};

/// Snapshot of who's inside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwState {
    Idle,
    Shared(u32),
    Exclusive,
}

#[derive(Debug, Default)]
struct Counters {
    active_readers: u32,
    reader_in: bool,
    writer_in: bool,
    readers_waiting: u32,
    writers_waiting: u32,
    // bumped by every release_write, readers use it to tell whether they queued before it
    write_releases: u64,
}

pub struct RwLock {
    name: String,
    reader_cv: ConditionVariable,
    writer_cv: ConditionVariable,
    gate: Lock,
    counters: UnsafeCell<Counters>,
}
// the counters are only touched with the gate held
unsafe impl Sync for RwLock {}

/// Holding the gate, gives access to the counters
struct Gate<'a> {
    rw: &'a RwLock,
}

impl Deref for Gate<'_> {
    type Target = Counters;
    fn deref(&self) -> &Self::Target {
        // SAFETY: the gate is held while the guard exists
        unsafe { &*self.rw.counters.get() }
    }
}

impl DerefMut for Gate<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the gate is held while the guard exists
        unsafe { &mut *self.rw.counters.get() }
    }
}

impl Gate<'_> {
    // the gate is released while sleeping, no reference into the counters may live across this
    fn wait(&self, cv: &ConditionVariable) {
        cv.wait(&self.rw.gate);
    }

    fn signal(&self, cv: &ConditionVariable) {
        cv.signal(&self.rw.gate);
    }

    fn broadcast(&self, cv: &ConditionVariable) {
        cv.broadcast(&self.rw.gate);
    }
}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        self.rw.gate.release();
    }
}

impl RwLock {
    pub fn new(name: &str) -> Result<Self> {
        Self::build(name, None)
    }

    /// The observer watches the gate lock
    pub fn with_observer(name: &str, observer: Arc<dyn LockObserver>) -> Result<Self> {
        Self::build(name, Some(observer))
    }

    // sub-resources are dropped in reverse if a later one fails
    fn build(name: &str, observer: Option<Arc<dyn LockObserver>>) -> Result<Self> {
        let name = kalloc::kstrdup(name, "rwlock name")?;
        let reader_cv = ConditionVariable::new("rwlock reader cv")?;
        let writer_cv = ConditionVariable::new("rwlock writer cv")?;
        let gate = match observer {
            Some(observer) => Lock::with_observer("rwlock gate", observer)?,
            None => Lock::new("rwlock gate")?,
        };
        log::trace!("rwlock_create: {name}");
        Ok(Self {
            name,
            reader_cv,
            writer_cv,
            gate,
            counters: UnsafeCell::new(Counters::default()),
        })
    }

    /// # Panics
    /// If anybody is inside or waiting
    pub fn destroy(self) {
        log::trace!("rwlock_destroy: {}", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn enter(&self) -> Gate<'_> {
        self.gate.acquire();
        Gate { rw: self }
    }

    pub fn acquire_read(&self) {
        let mut gate = self.enter();
        gate.readers_waiting += 1;
        let queued_at = gate.write_releases;
        // a waiting writer holds new readers back, unless a writer left since this reader queued
        while gate.writer_in || (gate.writers_waiting > 0 && gate.write_releases == queued_at) {
            gate.wait(&self.reader_cv);
        }
        gate.readers_waiting -= 1;
        gate.active_readers += 1;
        gate.reader_in = true;
        debug_assert!(!gate.writer_in);
    }

    /// # Panics
    /// If there's no reader inside
    pub fn release_read(&self) {
        let mut gate = self.enter();
        assert!(
            gate.reader_in && gate.active_readers > 0,
            "rwlock_release_read: no reader in {}",
            self.name
        );
        gate.active_readers -= 1;
        gate.reader_in = gate.active_readers > 0;
        if gate.active_readers == 0 {
            if gate.writers_waiting > 0 {
                gate.signal(&self.writer_cv);
            } else {
                gate.broadcast(&self.reader_cv);
            }
        }
    }

    pub fn acquire_write(&self) {
        let mut gate = self.enter();
        gate.writers_waiting += 1;
        while gate.writer_in || gate.active_readers > 0 {
            gate.wait(&self.writer_cv);
        }
        gate.writers_waiting -= 1;
        gate.writer_in = true;
    }

    /// # Panics
    /// If there's no writer inside
    pub fn release_write(&self) {
        let mut gate = self.enter();
        assert!(
            gate.writer_in,
            "rwlock_release_write: no writer in {}",
            self.name
        );
        gate.writer_in = false;
        gate.write_releases = gate.write_releases.wrapping_add(1);
        if gate.readers_waiting > 0 {
            gate.broadcast(&self.reader_cv);
        } else {
            gate.signal(&self.writer_cv);
        }
    }

    /// Readers waiting in [RwLock::acquire_read], a snapshot
    pub fn readers_waiting(&self) -> u32 {
        self.enter().readers_waiting
    }

    /// Writers waiting in [RwLock::acquire_write], a snapshot
    pub fn writers_waiting(&self) -> u32 {
        self.enter().writers_waiting
    }

    /// Who's inside, a snapshot
    pub fn state(&self) -> RwState {
        let gate = self.enter();
        match (gate.writer_in, gate.active_readers) {
            (true, _) => RwState::Exclusive,
            (false, 0) => RwState::Idle,
            (false, n) => RwState::Shared(n),
        }
    }
}

impl Drop for RwLock {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let c = self.counters.get_mut();
        assert!(
            !c.reader_in && c.active_readers == 0,
            "rwlock_destroy: {} has readers",
            self.name
        );
        assert!(!c.writer_in, "rwlock_destroy: {} has a writer", self.name);
        assert!(
            c.readers_waiting == 0 && c.writers_waiting == 0,
            "rwlock_destroy: {} has waiters",
            self.name
        );
    }
}
