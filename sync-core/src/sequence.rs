//! Running chunk counter check.

/// Counter value before the first chunk, so the first accepted counter is 0.
pub const INITIAL_COUNTER: u8 = 0xFF;

/// Accepts only the exact successor (mod 256) of the last counter.
///
/// A rejected counter leaves the guard unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGuard {
    last: u8,
}

impl SequenceGuard {
    /// Create a guard expecting 0 next.
    pub fn new() -> Self {
        Self {
            last: INITIAL_COUNTER,
        }
    }

    /// Reset so the next accepted counter is `start + 1`.
    pub fn reset(&mut self, start: u8) {
        self.last = start;
    }

    /// Check `counter` and advance on success.
    pub fn expect(&mut self, counter: u8) -> bool {
        if counter == self.next() {
            self.last = counter;
            true
        } else {
            false
        }
    }

    /// The counter the guard will accept next.
    pub fn next(&self) -> u8 {
        self.last.wrapping_add(1)
    }

    /// The last accepted counter.
    pub fn last(&self) -> u8 {
        self.last
    }
}

impl Default for SequenceGuard {
    fn default() -> Self {
        Self::new()
    }
}
