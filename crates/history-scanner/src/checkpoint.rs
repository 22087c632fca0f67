//! Checkpoint arithmetic.
//!
//! Archives group ledgers into checkpoints and name each one by its last
//! ledger, which satisfies `(checkpoint + 1) % frequency == 0`. With the
//! network frequency of 64:
//!
//! - checkpoint 63 holds ledgers 1-63 (there is no ledger 0)
//! - checkpoint 127 holds ledgers 64-127
//! - checkpoint 191 holds ledgers 128-191

use crate::CHECKPOINT_FREQUENCY;

/// Number of ledgers per checkpoint. Always non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckPointFrequency(u32);

impl CheckPointFrequency {
    /// Returns `None` for a zero frequency.
    pub fn new(frequency: u32) -> Option<Self> {
        (frequency > 0).then_some(Self(frequency))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for CheckPointFrequency {
    fn default() -> Self {
        Self(CHECKPOINT_FREQUENCY)
    }
}

/// Computes and enumerates checkpoints for a frequency.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckPointGenerator {
    frequency: CheckPointFrequency,
}

impl CheckPointGenerator {
    pub fn new(frequency: CheckPointFrequency) -> Self {
        Self { frequency }
    }

    pub fn frequency(&self) -> CheckPointFrequency {
        self.frequency
    }

    /// The checkpoint containing `ledger`.
    ///
    /// ```
    /// use henyey_history_scanner::CheckPointGenerator;
    ///
    /// let generator = CheckPointGenerator::default();
    /// assert_eq!(generator.closest_higher_checkpoint(0), 63);
    /// assert_eq!(generator.closest_higher_checkpoint(63), 63);
    /// assert_eq!(generator.closest_higher_checkpoint(64), 127);
    /// ```
    pub fn closest_higher_checkpoint(&self, ledger: u32) -> u32 {
        let f = u64::from(self.frequency.get());
        let checkpoint = ((u64::from(ledger) + f) / f) * f - 1;
        u32::try_from(checkpoint).unwrap_or(u32::MAX)
    }

    pub fn is_checkpoint(&self, ledger: u32) -> bool {
        (u64::from(ledger) + 1) % u64::from(self.frequency.get()) == 0
    }

    /// Lazily enumerate the checkpoints `c` with `from <= c <= to`,
    /// starting at the checkpoint containing `from`.
    pub fn generate(&self, from: u32, to: u32) -> CheckPoints {
        CheckPoints {
            next: u64::from(self.closest_higher_checkpoint(from)),
            to: u64::from(to),
            step: u64::from(self.frequency.get()),
        }
    }

    /// A reusable description of a checkpoint range.
    pub fn range(&self, from: u32, to: u32) -> CheckPointRange {
        CheckPointRange {
            generator: *self,
            from,
            to,
        }
    }
}

/// Iterator returned by [`CheckPointGenerator::generate`].
#[derive(Debug, Clone)]
pub struct CheckPoints {
    next: u64,
    to: u64,
    step: u64,
}

impl Iterator for CheckPoints {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next > self.to {
            return None;
        }
        let current = self.next;
        self.next += self.step;
        u32::try_from(current).ok()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.next > self.to {
            0
        } else {
            ((self.to - self.next) / self.step + 1) as usize
        };
        (remaining, Some(remaining))
    }
}

/// The checkpoints of a ledger range, re-iterable without holding state.
#[derive(Debug, Clone, Copy)]
pub struct CheckPointRange {
    generator: CheckPointGenerator,
    from: u32,
    to: u32,
}

impl CheckPointRange {
    pub fn iter(&self) -> CheckPoints {
        self.generator.generate(self.from, self.to)
    }

    pub fn len(&self) -> usize {
        self.iter().size_hint().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn from_ledger(&self) -> u32 {
        self.from
    }

    pub fn to_ledger(&self) -> u32 {
        self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_zero_to_128() {
        let generator = CheckPointGenerator::default();
        let checkpoints: Vec<u32> = generator.generate(0, 128).collect();
        assert_eq!(checkpoints, vec![63, 127]);
    }

    #[test]
    fn test_generate_includes_upper_bound() {
        let generator = CheckPointGenerator::default();
        let checkpoints: Vec<u32> = generator.generate(64, 191).collect();
        assert_eq!(checkpoints, vec![127, 191]);
    }

    #[test]
    fn test_generate_empty_when_inverted() {
        let generator = CheckPointGenerator::default();
        assert_eq!(generator.generate(200, 100).count(), 0);
        // from inside a checkpoint whose end is past `to`
        assert_eq!(generator.generate(100, 120).count(), 0);
    }

    #[test]
    fn test_closest_higher_checkpoint() {
        let generator = CheckPointGenerator::default();
        assert_eq!(generator.closest_higher_checkpoint(32), 63);
        assert_eq!(generator.closest_higher_checkpoint(64), 127);
        assert_eq!(generator.closest_higher_checkpoint(127), 127);
    }

    #[test]
    fn test_closest_higher_checkpoint_saturates() {
        let generator = CheckPointGenerator::default();
        assert_eq!(generator.closest_higher_checkpoint(u32::MAX), u32::MAX);
    }

    #[test]
    fn test_custom_frequency() {
        let generator = CheckPointGenerator::new(CheckPointFrequency::new(8).unwrap());
        assert_eq!(generator.generate(0, 30).collect::<Vec<_>>(), vec![7, 15, 23]);
        assert!(generator.is_checkpoint(15));
        assert!(!generator.is_checkpoint(16));
        assert!(CheckPointFrequency::new(0).is_none());
    }

    #[test]
    fn test_range_is_reiterable() {
        let range = CheckPointGenerator::default().range(0, 300);
        assert_eq!(range.len(), 4);
        assert_eq!(range.iter().collect::<Vec<_>>(), range.iter().collect::<Vec<_>>());
        assert!(!range.is_empty());
    }
}
