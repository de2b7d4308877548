use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use tracing::debug;

/// Caches successful results by key and collapses concurrent computations of
/// the same key into one. Failures are never stored, so the next caller for
/// that key computes again.
pub struct SingleFlightCache<V> {
    slots: Mutex<HashMap<String, Arc<Mutex<Option<V>>>>>,
}

impl<V: Clone> SingleFlightCache<V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| lock(slot).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached value for `key`, or runs `compute` to produce it.
    /// The per-key slot lock is held for the duration of `compute`, so a
    /// second caller for the same key blocks and then reads the stored value
    /// instead of computing. Other keys are unaffected.
    pub fn get_or_compute<F>(&self, key: &str, compute: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let slot = {
            let mut slots = lock(&self.slots);
            Arc::clone(
                slots
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(None))),
            )
        };

        let mut guard = lock(&slot);
        if let Some(value) = guard.as_ref() {
            debug!(key, "cache hit");
            return Ok(value.clone());
        }
        let value = compute()?;
        *guard = Some(value.clone());
        Ok(value)
    }
}

impl<V: Clone> Default for SingleFlightCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
