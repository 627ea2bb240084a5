// SPDX-License-Identifier: Apache-2.0

//! 256-bit component masks.
//!
//! One bit per dense component type id. The mask is stored as four `u64`
//! lanes so a full match test is four wide compares; the containing header
//! row is padded to a 32-byte multiple so lane loads stay aligned.

use bytemuck::{Pod, Zeroable};

use crate::registry::ComponentTypeId;

/// A 256-bit bitset indexed by [`ComponentTypeId`].
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Pod, Zeroable)]
pub struct Mask256 {
    lanes: [u64; 4],
}

impl Mask256 {
    /// The mask with no bits set.
    pub const EMPTY: Self = Self { lanes: [0; 4] };

    /// Sets the bit for `id`.
    #[inline]
    pub fn set(&mut self, id: ComponentTypeId) {
        self.lanes[(id.0 >> 6) as usize] |= 1u64 << (id.0 & 63);
    }

    /// Clears the bit for `id`.
    #[inline]
    pub fn clear(&mut self, id: ComponentTypeId) {
        self.lanes[(id.0 >> 6) as usize] &= !(1u64 << (id.0 & 63));
    }

    /// Returns whether the bit for `id` is set.
    #[inline]
    #[must_use]
    pub fn test(&self, id: ComponentTypeId) -> bool {
        self.lanes[(id.0 >> 6) as usize] & (1u64 << (id.0 & 63)) != 0
    }

    /// ORs every bit of `other` into `self`.
    #[inline]
    pub fn union_with(&mut self, other: &Self) {
        for (lane, o) in self.lanes.iter_mut().zip(other.lanes.iter()) {
            *lane |= o;
        }
    }

    /// Returns whether every bit of `required` is set in `self`.
    #[inline]
    #[must_use]
    pub fn covers(&self, required: &Self) -> bool {
        self.lanes
            .iter()
            .zip(required.lanes.iter())
            .all(|(lane, req)| lane & req == *req)
    }

    /// Returns whether `self` and `other` share any set bit.
    #[inline]
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.lanes
            .iter()
            .zip(other.lanes.iter())
            .any(|(lane, o)| lane & o != 0)
    }

    /// Returns whether no bit is set.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|lane| *lane == 0)
    }

    /// Evaluates the combined include/exclude filter against this mask.
    ///
    /// Computes `((self & include) ^ include) | (self & exclude)` lane-wise
    /// and tests the result against zero, so a full filter evaluation is one
    /// pass over the four lanes.
    #[inline]
    #[must_use]
    pub fn matches(&self, include: &Self, exclude: &Self) -> bool {
        let mut acc = 0u64;
        for i in 0..4 {
            let lane = self.lanes[i];
            acc |= ((lane & include.lanes[i]) ^ include.lanes[i]) | (lane & exclude.lanes[i]);
        }
        acc == 0
    }

    /// Clears every bit.
    #[inline]
    pub fn clear_all(&mut self) {
        self.lanes = [0; 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(raw: u8) -> ComponentTypeId {
        ComponentTypeId(raw)
    }

    #[test]
    fn set_test_clear() {
        let mut m = Mask256::EMPTY;
        assert!(!m.test(id(0)));
        m.set(id(0));
        m.set(id(63));
        m.set(id(64));
        m.set(id(255));
        assert!(m.test(id(0)));
        assert!(m.test(id(63)));
        assert!(m.test(id(64)));
        assert!(m.test(id(255)));
        assert!(!m.test(id(1)));
        m.clear(id(64));
        assert!(!m.test(id(64)));
    }

    #[test]
    fn matches_is_equivalent_to_covers_and_disjoint() {
        let mut target = Mask256::EMPTY;
        target.set(id(3));
        target.set(id(70));

        let mut include = Mask256::EMPTY;
        include.set(id(3));
        let mut exclude = Mask256::EMPTY;
        exclude.set(id(9));

        assert!(target.matches(&include, &exclude));

        exclude.set(id(70));
        assert!(!target.matches(&include, &exclude));

        let mut include_missing = include;
        include_missing.set(id(200));
        assert!(!target.matches(&include_missing, &Mask256::EMPTY));
    }

    proptest! {
        #[test]
        fn matches_agrees_with_naive_evaluation(
            bits in proptest::collection::vec(any::<u8>(), 0..16),
            inc in proptest::collection::vec(any::<u8>(), 0..8),
            exc in proptest::collection::vec(any::<u8>(), 0..8),
        ) {
            let mut target = Mask256::EMPTY;
            for b in &bits {
                target.set(id(*b));
            }
            let mut include = Mask256::EMPTY;
            for b in &inc {
                include.set(id(*b));
            }
            let mut exclude = Mask256::EMPTY;
            for b in &exc {
                exclude.set(id(*b));
            }

            let naive = inc.iter().all(|b| target.test(id(*b)))
                && !exc.iter().any(|b| target.test(id(*b)));
            prop_assert_eq!(target.matches(&include, &exclude), naive);
        }

        #[test]
        fn union_is_superset_of_both(
            a in proptest::collection::vec(any::<u8>(), 0..16),
            b in proptest::collection::vec(any::<u8>(), 0..16),
        ) {
            let mut ma = Mask256::EMPTY;
            for bit in &a {
                ma.set(id(*bit));
            }
            let mut mb = Mask256::EMPTY;
            for bit in &b {
                mb.set(id(*bit));
            }
            let mut u = ma;
            u.union_with(&mb);
            prop_assert!(u.covers(&ma));
            prop_assert!(u.covers(&mb));
        }
    }
}
