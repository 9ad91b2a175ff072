use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of flavour lanes a stream can carry.
pub const NUM_FLAVOURS: usize = 32;

/// The mask used when a producer does not multiplex flavours: lane 0 only.
pub const DEFAULT_FLAVOUR_MASK: FlavourMask = FlavourMask(1);

/// A set of flavour lanes, one bit per lane.
///
/// Each element advertises the flavours it carries and each request asks for
/// a subset; routing intersects the two. Iteration always proceeds from the
/// rightmost set bit upward.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlavourMask(u32);

impl FlavourMask {
    pub const EMPTY: FlavourMask = FlavourMask(0);
    pub const ALL: FlavourMask = FlavourMask(u32::MAX);

    pub const fn new(bits: u32) -> Self {
        FlavourMask(bits)
    }

    /// Mask with the single lane `id` set. `id` must be below [`NUM_FLAVOURS`].
    pub const fn single(id: u8) -> Self {
        FlavourMask(1 << id)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, id: u8) -> bool {
        self.0 & (1 << id) != 0
    }

    pub const fn intersect(self, other: FlavourMask) -> FlavourMask {
        FlavourMask(self.0 & other.0)
    }

    pub const fn union(self, other: FlavourMask) -> FlavourMask {
        FlavourMask(self.0 | other.0)
    }

    pub const fn intersects(self, other: FlavourMask) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_subset_of(self, other: FlavourMask) -> bool {
        self.0 & !other.0 == 0
    }

    /// Id of the rightmost set lane, clearing it from the mask.
    pub fn pop_rightmost(&mut self) -> Option<u8> {
        if self.0 == 0 {
            return None;
        }
        let id = self.0.trailing_zeros() as u8;
        self.0 &= self.0 - 1;
        Some(id)
    }

    /// Iterator over the set lane ids, rightmost first.
    pub fn ids(self) -> FlavourIds {
        FlavourIds(self)
    }
}

/// See [`FlavourMask::ids`].
pub struct FlavourIds(FlavourMask);

impl Iterator for FlavourIds {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        self.0.pop_rightmost()
    }
}

impl fmt::Debug for FlavourMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlavourMask({:#010b})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rightmost_iteration_order() {
        let mask = FlavourMask::new(0b1010_0101);
        let ids: Vec<u8> = mask.ids().collect();
        assert_eq!(ids, vec![0, 2, 5, 7]);
    }

    #[test]
    fn pop_rightmost_clears_bits() {
        let mut mask = FlavourMask::new(0b110);
        assert_eq!(mask.pop_rightmost(), Some(1));
        assert_eq!(mask.pop_rightmost(), Some(2));
        assert_eq!(mask.pop_rightmost(), None);
        assert!(mask.is_empty());
    }

    #[test]
    fn subset_and_intersection() {
        let a = FlavourMask::new(0b0110);
        let b = FlavourMask::new(0b1110);
        assert!(a.is_subset_of(b));
        assert!(!b.is_subset_of(a));
        assert_eq!(a.intersect(b), a);
        assert!(a.intersects(FlavourMask::single(1)));
        assert!(!a.intersects(FlavourMask::single(0)));
    }
}
