use std::fmt::{Display, Formatter};

/// A sequence number in the sender's byte stream. Sequence numbers wrap around at 2^32, so
///  ordering is defined relative to a distance of less than half the number space rather than
///  by plain integer comparison.
///
/// 0 is skipped when wrapping: an acknowledgment number of 0 is reserved for window updates.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn plus(&self, n: u32) -> SeqNum {
        match self.0.overflowing_add(n) {
            (raw, false) => SeqNum(raw),
            (raw, true) => SeqNum(raw + 1),
        }
    }

    /// number of bytes from `earlier` to `self`, assuming `earlier` is not after `self`
    pub fn distance_from(&self, earlier: SeqNum) -> u32 {
        if self.0 >= earlier.0 {
            self.0 - earlier.0
        }
        else {
            self.0.wrapping_sub(earlier.0) - 1
        }
    }

    pub fn is_before(&self, other: SeqNum) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    pub fn is_before_or_at(&self, other: SeqNum) -> bool {
        (other.0.wrapping_sub(self.0) as i32) >= 0
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::equal(5, 5, false, true)]
    #[case::smaller(4, 5, true, true)]
    #[case::bigger(6, 5, false, false)]
    #[case::zero_vs_stale(0, 5120, true, true)]
    #[case::wrap_before(u32::MAX, 0, true, true)]
    #[case::wrap_after(0, u32::MAX, false, false)]
    #[case::wrap_far(u32::MAX - 10, 20, true, true)]
    fn test_ordering(#[case] a: u32, #[case] b: u32, #[case] before: bool, #[case] before_or_at: bool) {
        let a = SeqNum::from_raw(a);
        let b = SeqNum::from_raw(b);
        assert_eq!(a.is_before(b), before);
        assert_eq!(a.is_before_or_at(b), before_or_at);
    }

    #[rstest]
    #[case::simple(1000, 24, 1024)]
    #[case::wrap(u32::MAX, 1, 1)]
    #[case::wrap_onto_zero(u32::MAX - 3, 4, 1)]
    #[case::wrap_packet(u32::MAX - 23, 1024, 1001)]
    fn test_plus(#[case] start: u32, #[case] n: u32, #[case] expected: u32) {
        let s = SeqNum::from_raw(start).plus(n);
        assert_eq!(s.to_raw(), expected);
        assert_eq!(s.distance_from(SeqNum::from_raw(start)), n);
    }
}
