use std::sync::atomic::{AtomicI64, Ordering};

/// Process-wide gauge of B-tree depth.
///
/// Every slice adds one when it installs a root above the current one
/// (initial leaf root or root split) and subtracts one when a root collapses
/// into its only child. With several slices the gauge holds the sum.
pub static BTREE_DEPTH: DepthGauge = DepthGauge::new();

#[derive(Debug, Default)]
pub struct DepthGauge(AtomicI64);

impl DepthGauge {
    #[inline]
    pub const fn new() -> Self {
        DepthGauge(AtomicI64::new(0))
    }

    #[inline]
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decr(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}
