//! Lock helpers for the node's shared health state.
//!
//! The DOS score, the IP change record and the limiter caches are plain
//! `std::sync::Mutex`es held only for a read-modify-write sequence. A panic
//! inside one of those short sections must not take the health layer down
//! with it, so poisoned locks are recovered and logged instead of unwrapped.

use std::sync::{Mutex, MutexGuard};
use tracing::error;

/// Acquire a Mutex lock, recovering from poisoning if necessary.
///
/// # Arguments
/// * `mutex` - The Mutex to lock
/// * `context` - What the lock protects (for logging)
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                "Mutex poisoned for '{}' - recovering with potentially stale data",
                context
            );
            poisoned.into_inner()
        }
    }
}
