//! Operation token tracking for io_uring completion correlation.
//!
//! Each submitted operation is parked here under a token (the SQE's
//! user_data) and handed back, buffer and tag included, when its CQE
//! arrives. Parking the operation also pins its buffer for the kernel.

use crate::runtime::Operation;
use slab::Slab;

/// Reserved token for wake-up NOPs. Never produced by the slab.
pub const WAKE_TOKEN: u64 = u64::MAX;

/// In-flight operations with O(1) lookup.
pub struct TokenTable<T> {
    ops: Slab<Operation<T>>,
}

impl<T> TokenTable<T> {
    /// Create a new token table with specified capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// Park an operation and return its token.
    pub fn insert(&mut self, op: Operation<T>) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Take the operation for a completed token.
    ///
    /// Returns None if the token is unknown or already completed.
    pub fn remove(&mut self, token: u64) -> Option<Operation<T>> {
        let idx = usize::try_from(token).ok()?;
        self.ops.try_remove(idx)
    }

    /// Number of operations in flight.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
