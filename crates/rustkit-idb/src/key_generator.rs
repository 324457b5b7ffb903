//! Surrogate key allocation for auto-increment stores.

use serde::{Deserialize, Serialize};

use crate::error::{IDBError, Result};

/// Largest integer a key generator hands out (2^53).
pub const MAX_GENERATED_KEY: u64 = 9_007_199_254_740_992;

/// Monotonic key generator. `counter` is the next key to hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenerator {
    counter: u64,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self { counter: 1 }
    }
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a generator from a saved counter.
    pub fn with_counter(counter: u64) -> Self {
        Self { counter }
    }

    /// The next key to hand out.
    pub fn current(&self) -> u64 {
        self.counter
    }

    /// Key `next()` would return, without consuming it.
    pub fn peek(&self) -> Result<u64> {
        if self.counter > MAX_GENERATED_KEY {
            return Err(IDBError::constraint("Key generator exhausted"));
        }
        Ok(self.counter)
    }

    /// Hand out the next key.
    pub fn next(&mut self) -> Result<u64> {
        let key = self.peek()?;
        self.counter += 1;
        Ok(key)
    }

    /// Observe an explicit numeric key so later keys exceed it.
    /// Returns whether the counter moved.
    pub fn set_if_larger(&mut self, n: f64) -> bool {
        if n.is_nan() {
            return false;
        }
        let value = n.min(MAX_GENERATED_KEY as f64).floor();
        if value >= self.counter as f64 {
            self.counter = value as u64 + 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn restore(&mut self, counter: u64) {
        self.counter = counter;
    }
}
