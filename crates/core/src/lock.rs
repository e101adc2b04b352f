//! Poison-tolerant locking for the in-memory structures.
//!
//! The guarded maps only hold derived state (hot entries, digests, flights),
//! so a panic on another thread never makes them unsafe to keep using.

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock `lock`, recovering the guard if a previous holder panicked.
pub fn mutex_lock<'a, T>(lock: &'a Mutex<T>, target: &'static str, op: &'static str) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                "Recovered from poisoned lock"
            );
            poisoned.into_inner()
        }
    }
}
