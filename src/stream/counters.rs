/// A 16 bit sequence counter that wraps around
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct SequenceCounter(u16);

impl SequenceCounter {
    pub fn new(initial: u16) -> SequenceCounter {
        SequenceCounter(initial)
    }

    pub fn get(&self) -> u16 {
        self.0
    }

    pub fn set(&mut self, value: u16) {
        self.0 = value;
    }

    pub fn advance(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// returns the current value and advances
    pub fn next(&mut self) -> u16 {
        let result = self.0;
        self.advance();
        result
    }
}

/// Snapshot of one stream's counters, for diagnostics
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct StreamCounters {
    pub reliable_out: u16,
    pub unreliable_out: u16,
    pub expected_reliable_in: u16,
    pub expected_unreliable_in: u16,
}
