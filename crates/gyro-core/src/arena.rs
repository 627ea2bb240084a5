// SPDX-License-Identifier: Apache-2.0

//! Reserve/commit storage arena backing every chunk table.
//!
//! A [`Region`] reserves an address budget up front as pure bookkeeping and
//! commits fixed-size zeroed slabs on demand. Nothing is allocated until
//! [`Region::commit`] touches a slab, and a committed slab stays resident
//! until the region drops. The release path is expressed through ownership:
//! [`Region::release`] consumes the region, so a double release does not
//! compile.
//!
//! Slabs are backed by `u64` words, so every slab base is 8-byte aligned
//! and in-place typed views over chunk bytes stay aligned.

use thiserror::Error;

/// Upper bound on a single reservation, matching a 38-bit address budget.
const MAX_RESERVE_BYTES: usize = 1 << 38;

/// Errors surfaced by reserve/commit operations.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// The requested reservation exceeds the arena's address budget.
    #[error("out of address space: requested {requested} bytes, budget {budget}")]
    OutOfAddressSpace {
        /// Bytes requested by the caller.
        requested: usize,
        /// Maximum reservable bytes.
        budget: usize,
    },

    /// The allocator refused to back a committed slab.
    #[error("out of memory committing {bytes} bytes at offset {offset}")]
    OutOfMemory {
        /// Offset of the slab being committed.
        offset: usize,
        /// Slab size in bytes.
        bytes: usize,
    },

    /// A commit or access landed outside the reserved range.
    #[error("offset {offset} + {bytes} bytes exceeds reservation of {reserved}")]
    OutOfReservation {
        /// Requested offset.
        offset: usize,
        /// Requested length.
        bytes: usize,
        /// Reserved size of the region.
        reserved: usize,
    },
}

/// A reserved range of storage, committed slab by slab.
///
/// The slab size is fixed at reservation time; commits are rounded to whole
/// slabs and are idempotent. Slices never straddle a slab boundary, which is
/// what lets chunk tables hand out one contiguous run per chunk.
#[derive(Debug)]
pub struct Region {
    slab_bytes: usize,
    reserved: usize,
    slabs: Vec<Option<Box<[u64]>>>,
}

impl Region {
    /// Reserves `bytes` of address budget carved into `slab_bytes` slabs.
    ///
    /// No storage is allocated. Fails with [`ArenaError::OutOfAddressSpace`]
    /// when the request exceeds the arena budget.
    pub fn reserve(bytes: usize, slab_bytes: usize) -> Result<Self, ArenaError> {
        debug_assert!(slab_bytes > 0);
        if bytes > MAX_RESERVE_BYTES {
            return Err(ArenaError::OutOfAddressSpace {
                requested: bytes,
                budget: MAX_RESERVE_BYTES,
            });
        }
        let slab_count = bytes.div_ceil(slab_bytes);
        let mut slabs = Vec::new();
        slabs.resize_with(slab_count, || None);
        Ok(Self {
            slab_bytes,
            reserved: bytes,
            slabs,
        })
    }

    /// Total reserved bytes.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Makes `bytes` starting at `offset` readable and writable.
    ///
    /// Rounds outward to whole slabs and zero-fills newly committed slabs.
    /// Idempotent: already-committed slabs are untouched.
    pub fn commit(&mut self, offset: usize, bytes: usize) -> Result<(), ArenaError> {
        let end = offset.checked_add(bytes).filter(|end| *end <= self.reserved).ok_or(
            ArenaError::OutOfReservation {
                offset,
                bytes,
                reserved: self.reserved,
            },
        )?;
        if bytes == 0 {
            return Ok(());
        }
        let first = offset / self.slab_bytes;
        let last = (end - 1) / self.slab_bytes;
        for slab_ix in first..=last {
            if self.slabs[slab_ix].is_none() {
                let words = self.slab_bytes_at(slab_ix).div_ceil(8);
                let mut backing: Vec<u64> = Vec::new();
                backing
                    .try_reserve_exact(words)
                    .map_err(|_| ArenaError::OutOfMemory {
                        offset: slab_ix * self.slab_bytes,
                        bytes: words * 8,
                    })?;
                backing.resize(words, 0u64);
                self.slabs[slab_ix] = Some(backing.into_boxed_slice());
            }
        }
        Ok(())
    }

    /// Returns whether every byte of `[offset, offset + bytes)` is committed.
    #[must_use]
    pub fn is_committed(&self, offset: usize, bytes: usize) -> bool {
        let Some(end) = offset.checked_add(bytes).filter(|end| *end <= self.reserved) else {
            return false;
        };
        if bytes == 0 {
            return true;
        }
        let first = offset / self.slab_bytes;
        let last = (end - 1) / self.slab_bytes;
        (first..=last).all(|slab_ix| self.slabs[slab_ix].is_some())
    }

    /// Borrows a committed range. The range must not straddle a slab boundary.
    #[must_use]
    pub fn slice(&self, offset: usize, bytes: usize) -> Option<&[u8]> {
        let slab_ix = offset / self.slab_bytes;
        let local = offset % self.slab_bytes;
        let slab = self.slabs.get(slab_ix)?.as_ref()?;
        bytemuck::cast_slice::<u64, u8>(slab).get(local..local + bytes)
    }

    /// Exclusively borrows a committed range within one slab.
    #[must_use]
    pub fn slice_mut(&mut self, offset: usize, bytes: usize) -> Option<&mut [u8]> {
        let slab_ix = offset / self.slab_bytes;
        let local = offset % self.slab_bytes;
        let slab = self.slabs.get_mut(slab_ix)?.as_mut()?;
        bytemuck::cast_slice_mut::<u64, u8>(slab).get_mut(local..local + bytes)
    }

    /// Iterates every committed slab exclusively, in slab order.
    ///
    /// The yielded borrows are disjoint, which is what the parallel iteration
    /// path relies on to fan chunks out across workers.
    pub fn slabs_mut(&mut self) -> impl Iterator<Item = (usize, &mut [u8])> {
        self.slabs.iter_mut().enumerate().filter_map(|(ix, slab)| {
            slab.as_mut()
                .map(|s| (ix, bytemuck::cast_slice_mut::<u64, u8>(s)))
        })
    }

    /// Iterates the indices of committed slabs in order.
    pub fn committed_slabs(&self) -> impl Iterator<Item = usize> + '_ {
        self.slabs
            .iter()
            .enumerate()
            .filter_map(|(ix, slab)| slab.as_ref().map(|_| ix))
    }

    /// Drops every committed slab while keeping the reservation.
    pub fn decommit_all(&mut self) {
        for slab in &mut self.slabs {
            *slab = None;
        }
    }

    /// Returns all address budget and backing storage.
    ///
    /// Consumes the region; the borrow checker rules out a second release.
    pub fn release(self) {
        drop(self);
    }

    fn slab_bytes_at(&self, slab_ix: usize) -> usize {
        let start = slab_ix * self.slab_bytes;
        self.slab_bytes.min(self.reserved - start)
    }
}
