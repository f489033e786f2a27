/// Rate limiter for log lines that repeat on every retry.
///
/// The first occurrence is reported, then every `every`th one after it.
/// [`reset`](Self::reset) starts over, e.g. once the failing step succeeds.
#[derive(Debug)]
pub(crate) struct LogThrottle {
    /// Report every Nth repetition.
    every: u32,
    /// Occurrences since the last reset.
    seen: u32,
}

impl LogThrottle {
    /// Report the first occurrence, then every `every`th (at least 1).
    pub(crate) fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            seen: 0,
        }
    }

    /// Count one occurrence; returns true if it should be logged.
    pub(crate) fn hit(&mut self) -> bool {
        let report = self.seen % self.every == 0;
        self.seen = self.seen.wrapping_add(1);
        report
    }

    /// Occurrences since the last reset.
    pub(crate) fn count(&self) -> u32 {
        self.seen
    }

    /// Start counting from zero again.
    pub(crate) fn reset(&mut self) {
        self.seen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_then_every_nth() {
        let mut t = LogThrottle::new(4);
        let reported: Vec<bool> = (0..9).map(|_| t.hit()).collect();
        assert_eq!(
            reported,
            vec![true, false, false, false, true, false, false, false, true]
        );
        assert_eq!(t.count(), 9);
        t.reset();
        assert!(t.hit());
    }

    #[test]
    fn zero_means_every_time() {
        let mut t = LogThrottle::new(0);
        assert!(t.hit());
        assert!(t.hit());
    }
}
