pub mod api;
pub mod engine;
pub mod error;
pub mod index;
pub mod model;
pub mod normalize;
pub mod outbox;
pub mod read_state;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod store;

#[cfg(test)]
mod testing;

use std::sync::{Mutex, MutexGuard};

/// Lock ignoring poisoning. Every critical section in this crate replaces state
/// wholesale, so a panicked holder cannot leave it half-written.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
