use std::fmt;

/// A 32-bit sequence number with wraparound ordering.
///
/// Ordering uses signed-difference arithmetic, which is well defined as long
/// as outstanding windows stay well below 2^31.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SeqNum(pub u32);

impl SeqNum {
    pub fn next(self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }

    pub fn prev(self) -> SeqNum {
        SeqNum(self.0.wrapping_sub(1))
    }

    /// `self` precedes `other` in the circular sequence space.
    pub fn before(self, other: SeqNum) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    pub fn after(self, other: SeqNum) -> bool {
        other.before(self)
    }

    /// Number of steps from `from` up to and including `self`.
    pub fn distance_from(self, from: SeqNum) -> u32 {
        self.0.wrapping_sub(from.0)
    }
}

impl From<u32> for SeqNum {
    fn from(val: u32) -> Self {
        SeqNum(val)
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_plain_below_wrap() {
        assert!(SeqNum(1).before(SeqNum(2)));
        assert!(!SeqNum(2).before(SeqNum(1)));
        assert!(!SeqNum(7).before(SeqNum(7)));
        assert!(SeqNum(2).after(SeqNum(1)));
    }

    #[test]
    fn ordering_survives_the_wrap() {
        assert!(SeqNum(u32::MAX).before(SeqNum(0)));
        assert!(SeqNum(u32::MAX - 10).before(SeqNum(5)));
        assert!(SeqNum(0).after(SeqNum(u32::MAX)));
        assert_eq!(SeqNum(u32::MAX).next(), SeqNum(0));
        assert_eq!(SeqNum(0).prev(), SeqNum(u32::MAX));
    }

    #[test]
    fn distance_counts_across_the_wrap() {
        assert_eq!(SeqNum(5).distance_from(SeqNum(u32::MAX - 4)), 10);
        assert_eq!(SeqNum(9).distance_from(SeqNum(9)), 0);
    }
}
