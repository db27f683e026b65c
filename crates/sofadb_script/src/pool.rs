//! Bounding the number of live interpreters.
//!
//! Interpreter contexts are thread-bound and cannot be handed between
//! threads, so the pool is a counting semaphore: holders build their own
//! [`crate::Sandbox`] after acquiring a permit, and peak interpreter memory
//! stays bounded by the pool capacity.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore over interpreter slots.
pub struct InterpreterPool {
    in_use: Mutex<usize>,
    freed: Condvar,
    capacity: usize,
}

impl InterpreterPool {
    /// Creates a pool admitting `capacity` concurrent interpreters.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            in_use: Mutex::new(0),
            freed: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Acquires a slot, blocking until one is free.
    pub fn acquire(&self) -> InterpreterPermit<'_> {
        let mut in_use = self.in_use.lock();
        while *in_use >= self.capacity {
            self.freed.wait(&mut in_use);
        }
        *in_use += 1;
        InterpreterPermit { pool: self }
    }

    /// Acquires a slot if one is free, without blocking.
    pub fn try_acquire(&self) -> Option<InterpreterPermit<'_>> {
        let mut in_use = self.in_use.lock();
        if *in_use >= self.capacity {
            return None;
        }
        *in_use += 1;
        Some(InterpreterPermit { pool: self })
    }

    /// Number of permits currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        *self.in_use.lock()
    }

    /// Pool capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// RAII guard for one interpreter slot.
pub struct InterpreterPermit<'a> {
    pool: &'a InterpreterPool,
}

impl Drop for InterpreterPermit<'_> {
    fn drop(&mut self) {
        let mut in_use = self.pool.in_use.lock();
        *in_use -= 1;
        self.pool.freed.notify_one();
    }
}
