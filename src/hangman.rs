//! # Hangman
//!
//! Deadlock detection for sleep locks, as a pluggable observer.
//!
//! A [Lock](crate::lock::Lock) made with an observer reports 3 events:
//! - a thread is about to wait for the lock
//! - the thread got it
//! - the thread released it
//!
//! [Hangman] keeps the resulting wait-for graph: who holds each lock and which lock each thread waits for.
//! Each thread waits for at most one lock and each lock has at most one holder,
//! so a deadlock is a walk "lock -> its holder -> the lock it waits for -> ..." that comes back to the waiter.
//!
//! It's diagnostics only: nothing is prevented, the deadlocked thread is halted with a report.

use std::{
    collections::HashMap,
    fmt::{self, Write},
    sync::atomic::{AtomicU64, Ordering::Relaxed},
};

use crate::{spinlock::Spinlock, thread::ThreadId};

/// Identity of something that can be waited for, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockableId(u64);

impl LockableId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Relaxed))
    }
}

impl fmt::Display for LockableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lockable#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Lockable<'a> {
    pub id: LockableId,
    pub name: &'a str,
}

/// Receives lock events. Called without the lock's own spinlock held, but possibly with others held,
/// so implementations must not block.
pub trait LockObserver: Send + Sync {
    /// `thread` is about to wait for `lock` (called even if the lock turns out to be free)
    fn on_wait(&self, thread: ThreadId, lock: Lockable<'_>);
    fn on_acquire(&self, thread: ThreadId, lock: Lockable<'_>);
    fn on_release(&self, thread: ThreadId, lock: Lockable<'_>);
}

#[derive(Default)]
struct Graph {
    holders: HashMap<LockableId, (ThreadId, String)>,
    waiting: HashMap<ThreadId, (LockableId, String)>,
}

impl Graph {
    // the chain of (lock, holder) pairs from `lock` back to `thread`, if there's one
    fn cycle(&self, thread: ThreadId, lock: LockableId) -> Option<Vec<(LockableId, ThreadId)>> {
        let mut path = Vec::new();
        let mut current = lock;
        loop {
            let (holder, _) = self.holders.get(&current)?;
            path.push((current, *holder));
            if *holder == thread {
                return Some(path);
            }
            let (next, _) = self.waiting.get(holder)?;
            // a cycle without us was reported when it formed
            if path.iter().any(|(l, _)| l == next) {
                return None;
            }
            current = *next;
        }
    }

    fn describe(&self, thread: ThreadId, path: &[(LockableId, ThreadId)]) -> String {
        let mut report = String::new();
        let mut waiter = thread;
        for (lock, holder) in path {
            let name = self
                .holders
                .get(lock)
                .map(|(_, name)| name.as_str())
                .unwrap_or("?");
            let _ = write!(report, "{waiter} waits for {name} held by {holder}; ");
            waiter = *holder;
        }
        report.trim_end_matches("; ").to_string()
    }
}

pub struct Hangman {
    graph: Spinlock<Graph>,
}

impl Default for Hangman {
    fn default() -> Self {
        Self::new()
    }
}

impl Hangman {
    pub fn new() -> Self {
        Self {
            graph: Spinlock::new(Graph::default()),
        }
    }

    /// Would `thread` deadlock by waiting for `lock` now? Returns the cycle description if so.
    pub fn find_cycle(&self, thread: ThreadId, lock: LockableId) -> Option<String> {
        let graph = self.graph.lock();
        graph
            .cycle(thread, lock)
            .map(|path| graph.describe(thread, &path))
    }

    /// Current holder of `lock` as far as the detector knows
    pub fn holder(&self, lock: LockableId) -> Option<ThreadId> {
        self.graph.lock().holders.get(&lock).map(|(t, _)| *t)
    }
}

impl LockObserver for Hangman {
    fn on_wait(&self, thread: ThreadId, lock: Lockable<'_>) {
        let mut graph = self.graph.lock();
        if let Some(path) = graph.cycle(thread, lock.id) {
            let report = graph.describe(thread, &path);
            drop(graph);
            log::error!("hangman: deadlock: {report}");
            panic!("hangman: deadlock: {report}");
        }
        graph
            .waiting
            .insert(thread, (lock.id, lock.name.to_string()));
    }

    fn on_acquire(&self, thread: ThreadId, lock: Lockable<'_>) {
        let mut graph = self.graph.lock();
        graph.waiting.remove(&thread);
        graph
            .holders
            .insert(lock.id, (thread, lock.name.to_string()));
    }

    fn on_release(&self, thread: ThreadId, lock: Lockable<'_>) {
        let mut graph = self.graph.lock();
        let holds = matches!(graph.holders.get(&lock.id), Some((holder, _)) if *holder == thread);
        if holds {
            graph.holders.remove(&lock.id);
        } else {
            // somebody else's entry stays
            log::warn!("hangman: {thread} released {} it doesn't hold", lock.name);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::thread;

    fn other_thread() -> ThreadId {
        std::thread::spawn(thread::current).join().unwrap()
    }

    fn lockable(id: LockableId, name: &str) -> Lockable<'_> {
        Lockable { id, name }
    }

    #[test]
    fn test_no_cycle() {
        let h = Hangman::new();
        let (a, b) = (LockableId::next(), LockableId::next());
        let (t1, t2) = (thread::current(), other_thread());

        h.on_wait(t1, lockable(a, "a"));
        h.on_acquire(t1, lockable(a, "a"));
        assert_eq!(h.holder(a), Some(t1));

        // t2 waits for a, held by t1 which waits for nothing
        assert_eq!(h.find_cycle(t2, a), None);
        h.on_wait(t2, lockable(a, "a"));
        assert_eq!(h.find_cycle(t1, b), None);

        h.on_release(t1, lockable(a, "a"));
        assert_eq!(h.holder(a), None);
        h.on_acquire(t2, lockable(a, "a"));
        assert_eq!(h.holder(a), Some(t2));
    }

    #[test]
    fn test_two_thread_cycle() {
        let h = Hangman::new();
        let (a, b) = (LockableId::next(), LockableId::next());
        let (t1, t2) = (thread::current(), other_thread());

        h.on_acquire(t1, lockable(a, "a"));
        h.on_acquire(t2, lockable(b, "b"));
        h.on_wait(t1, lockable(b, "b"));

        let report = h.find_cycle(t2, a).expect("a cycle");
        assert!(report.contains("waits for a"));
        assert!(report.contains("waits for b"));
    }

    #[test]
    #[should_panic(expected = "hangman: deadlock")]
    fn test_self_deadlock_panics() {
        let h = Hangman::new();
        let a = LockableId::next();
        let me = thread::current();
        h.on_acquire(me, lockable(a, "a"));
        h.on_wait(me, lockable(a, "a"));
    }

    #[test]
    fn test_late_release_keeps_new_holder() {
        let h = Hangman::new();
        let a = LockableId::next();
        let (t1, t2) = (thread::current(), other_thread());

        h.on_acquire(t2, lockable(a, "a"));
        h.on_release(t1, lockable(a, "a"));
        assert_eq!(h.holder(a), Some(t2));
    }
}
