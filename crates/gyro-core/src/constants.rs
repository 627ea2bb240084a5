// SPDX-License-Identifier: Apache-2.0

//! Build-time sizing constants for the kernel.
//!
//! Chunk geometry is fixed at compile time so index→chunk addressing is a
//! shift and a mask, never a division.

/// Number of elements in one chunk of any store. Power of two.
pub const CHUNK_CAPACITY: usize = 16_384;

/// `log2(CHUNK_CAPACITY)`, the shift that maps an entity index to its chunk.
pub const CHUNK_SHIFT: u32 = CHUNK_CAPACITY.trailing_zeros();

/// Hard ceiling on live entity indices.
pub const MAX_ENTITIES: usize = 1 << 20;

/// Number of chunks each store can ever hold.
pub const MAX_CHUNKS: usize = MAX_ENTITIES / CHUNK_CAPACITY;

/// Hard ceiling on registered component types (dense ids fit in a `u8`).
pub const MAX_COMPONENT_TYPES: usize = 256;

const _: () = assert!(CHUNK_CAPACITY.is_power_of_two());
const _: () = assert!(MAX_ENTITIES % CHUNK_CAPACITY == 0);
const _: () = assert!(MAX_ENTITIES <= u32::MAX as usize);

/// Returns the chunk that holds `index`.
#[inline]
#[must_use]
pub const fn chunk_of(index: u32) -> usize {
    (index as usize) >> CHUNK_SHIFT
}

/// Returns the position of `index` within its chunk.
#[inline]
#[must_use]
pub const fn offset_in_chunk(index: u32) -> usize {
    (index as usize) & (CHUNK_CAPACITY - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_addressing_round_trips() {
        for index in [0u32, 1, CHUNK_CAPACITY as u32 - 1, CHUNK_CAPACITY as u32, 123_456] {
            let reassembled = chunk_of(index) * CHUNK_CAPACITY + offset_in_chunk(index);
            assert_eq!(reassembled, index as usize);
        }
    }
}
