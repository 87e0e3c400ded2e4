//! Item and byte tally for the used and free sides of a pool.
//!
//! Not synchronized; the pool's lock covers it.

use crate::trace::warn_event;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub count: usize,
    pub num_bytes: usize,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one item of `num_bytes`.
    pub fn increment(&mut self, num_bytes: usize) {
        self.count += 1;
        self.num_bytes += num_bytes;
    }

    /// Remove one item of `num_bytes`. A decrement that would underflow is
    /// logged and ignored.
    pub fn decrement(&mut self, num_bytes: usize) {
        if self.num_bytes >= num_bytes && self.count > 0 {
            self.count -= 1;
            self.num_bytes -= num_bytes;
        } else {
            warn_event!(
                num_bytes,
                current_bytes = self.num_bytes,
                count = self.count,
                "unexpected counter decrement"
            );
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.num_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_and_decrement() {
        let mut c = Counter::new();
        c.increment(10);
        c.increment(6);
        assert_eq!((c.count, c.num_bytes), (2, 16));
        c.decrement(10);
        assert_eq!((c.count, c.num_bytes), (1, 6));
    }

    #[test]
    fn underflow_is_ignored() {
        let mut c = Counter::new();
        c.increment(4);
        c.decrement(8);
        assert_eq!((c.count, c.num_bytes), (1, 4));
        c.decrement(4);
        c.decrement(0);
        assert_eq!((c.count, c.num_bytes), (0, 0));
    }

    #[test]
    fn reset_clears() {
        let mut c = Counter::new();
        c.increment(3);
        c.reset();
        assert_eq!(c, Counter::default());
    }
}
