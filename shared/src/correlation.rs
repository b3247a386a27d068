//! Correlation id allocation
//!
//! Ids increase monotonically from [`timing::CORRELATION_ID_MIN`] and wrap back
//! to it after [`timing::CORRELATION_ID_MAX`]. Zero is never issued, and an id
//! still outstanding at wrap time is skipped.

use std::fmt;

use crate::timing;

/// Ties a completion callback back to its originating submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u32);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Wrapping correlation id source
#[derive(Debug, Clone)]
pub struct CorrelationIdAllocator {
    min: u32,
    max: u32,
    next: u32,
}

impl Default for CorrelationIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationIdAllocator {
    /// Create an allocator over the default id range
    pub fn new() -> Self {
        Self::with_range(timing::CORRELATION_ID_MIN, timing::CORRELATION_ID_MAX)
    }

    /// Create an allocator over `min..=max`. A zero minimum is bumped to 1.
    pub fn with_range(min: u32, max: u32) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self { min, max, next: min }
    }

    /// Issue the next id for which `outstanding` returns false.
    ///
    /// Returns `None` only when every id in the range is outstanding.
    pub fn allocate(&mut self, outstanding: impl Fn(CorrelationId) -> bool) -> Option<CorrelationId> {
        let span = u64::from(self.max - self.min) + 1;
        for _ in 0..span {
            let candidate = CorrelationId(self.next);
            self.next = if self.next >= self.max {
                self.min
            } else {
                self.next + 1
            };
            if !outstanding(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}
