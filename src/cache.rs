//! ==============================================================================
//! cache.rs - single-slot latest reading
//! ==============================================================================
//!
//! purpose:
//!     holds the most recent `Reading` and nothing else.
//!     the serial ingestor writes it, the stream, the api and the forwarder
//!     read it.
//!
//! design:
//!     - `LatestReading` is a cheap clone-able handle (arc inside), passed to
//!       each consumer instead of living in a global.
//!     - the mutex guards a `Copy` value, so a get is a copy under the lock and
//!       a set is a single assignment. the lock is never held across i/o.
//!     - the ingestor runs on a plain os thread, so this is a std mutex rather
//!       than a tokio one.
//!
//! ==============================================================================

use crate::domain::Reading;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Default)]
pub struct LatestReading {
    slot: Arc<Mutex<Option<Reading>>>,
}

impl LatestReading {
    pub fn new() -> Self {
        Self::default()
    }

    /// replace the held reading wholesale
    pub fn set(&self, reading: Reading) {
        *self.lock() = Some(reading);
    }

    /// copy of the held reading, `None` until the first `set`
    pub fn get(&self) -> Option<Reading> {
        *self.lock()
    }

    /// live handles to the slot
    #[cfg(test)]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.slot)
    }

    // a writer that panicked mid-assignment cannot leave a torn Copy value
    fn lock(&self) -> MutexGuard<'_, Option<Reading>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
