//! # Kernel allocation
//!
//! Creating a primitive allocates a few things: a copy of its name, a wait channel queue, sub-primitives.
//! A kernel can't abort on OOM, so every allocation here is fallible and reports [SyncError::OutOfMemory].
//!
//! Real allocation failures are rare, so there's a per-thread fault injection knob - [fail_after].
//! It lets the tests walk every failure point of a `new` and check it unwinds cleanly.

use std::{cell::Cell, collections::VecDeque};

use crate::error::{Result, SyncError};

thread_local! {
    // None - no injection, Some(n) - n more allocations succeed, then all of them fail
    static FAIL_AFTER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Make the calling thread's allocations fail after `successes` more of them succeed.
/// The previous setting comes back when the returned scope is dropped.
pub fn fail_after(successes: usize) -> FaultInjection {
    let previous = FAIL_AFTER.with(|f| f.replace(Some(successes)));
    FaultInjection { previous }
}

pub struct FaultInjection {
    previous: Option<usize>,
}

impl Drop for FaultInjection {
    fn drop(&mut self) {
        FAIL_AFTER.with(|f| f.set(self.previous));
    }
}

fn out_of_memory(what: &'static str) -> SyncError {
    log::warn!("kalloc: out of memory allocating {what}");
    SyncError::OutOfMemory { what }
}

// account for one allocation against the injection budget
fn charge(what: &'static str) -> Result<()> {
    FAIL_AFTER.with(|f| match f.get() {
        Some(0) => Err(out_of_memory(what)),
        Some(n) => {
            f.set(Some(n - 1));
            Ok(())
        }
        None => Ok(()),
    })
}

/// Fallible copy of a name
pub fn kstrdup(name: &str, what: &'static str) -> Result<String> {
    charge(what)?;
    let mut copy = String::new();
    copy.try_reserve_exact(name.len())
        .map_err(|_| out_of_memory(what))?;
    copy.push_str(name);
    Ok(copy)
}

/// Fallible up-front reservation for a queue
pub fn reserve<Y>(queue: &mut VecDeque<Y>, additional: usize, what: &'static str) -> Result<()> {
    charge(what)?;
    queue
        .try_reserve(additional)
        .map_err(|_| out_of_memory(what))
}
