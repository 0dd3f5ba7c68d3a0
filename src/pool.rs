//! Reset-on-release object pool.
//!
//! Message records and per-connection batch records churn at packet rate, so
//! both are recycled through a fixed-capacity pool instead of being
//! reallocated. A pool is built from a constructor and a reset hook: `get`
//! hands out a recycled (or freshly constructed) value, `release` runs the
//! reset hook and returns the value to the pool, dropping it when the pool is
//! full or closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A bounded object pool with constructor and reset hooks.
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
    ctor: Box<dyn Fn() -> T + Send + Sync>,
    reset: Box<dyn Fn(&mut T) + Send + Sync>,
    closed: AtomicBool,
}

impl<T> Pool<T> {
    /// Creates a pool that holds at most `capacity` idle values.
    pub fn new(
        capacity: usize,
        ctor: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity.min(1024))),
            capacity,
            ctor: Box::new(ctor),
            reset: Box::new(reset),
            closed: AtomicBool::new(false),
        }
    }

    /// Takes a value from the pool, constructing a fresh one when empty.
    ///
    /// After [`close`](Self::close) this always constructs; the values are
    /// simply dropped again on release.
    pub fn get(&self) -> T {
        if !self.is_closed() {
            if let Some(item) = self.items.lock().map(|mut v| v.pop()).unwrap_or(None) {
                return item;
            }
        }
        (self.ctor)()
    }

    /// Resets `item` and returns it to the pool.
    ///
    /// Values beyond the pool capacity, and any value released after close,
    /// are dropped.
    pub fn release(&self, mut item: T) {
        (self.reset)(&mut item);
        if self.is_closed() {
            return;
        }
        if let Ok(mut items) = self.items.lock() {
            if items.len() < self.capacity {
                items.push(item);
            }
        }
    }

    /// Closes the pool and drops all idle values. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut items) = self.items.lock() {
            items.clear();
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_release_recycles() {
        let pool: Pool<Vec<u8>> = Pool::new(4, Vec::new, |v| v.clear());
        let mut a = pool.get();
        a.extend_from_slice(b"abc");
        pool.release(a);

        let b = pool.get();
        assert!(b.is_empty(), "reset hook must clear recycled values");
    }

    #[test]
    fn overflow_is_dropped() {
        let pool: Pool<u32> = Pool::new(1, || 0, |_| {});
        pool.release(1);
        pool.release(2);
        assert_eq!(pool.items.lock().unwrap().len(), 1);
    }

    #[test]
    fn closed_pool_constructs_fresh() {
        let pool: Pool<u32> = Pool::new(4, || 7, |v| *v = 0);
        pool.release(99);
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.get(), 7, "closed pool hands out constructor output");
        pool.release(5);
        assert_eq!(pool.items.lock().unwrap().len(), 0);
    }
}
