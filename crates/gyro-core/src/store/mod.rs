// SPDX-License-Identifier: Apache-2.0

//! Component storage back-ends.
//!
//! Four storage classes sit behind one tagged dispatch surface, indexed by
//! dense type id from the repository. Tags have no back-end at all; their
//! presence is the component-mask bit.

mod inline;
mod multipart;
mod object;
mod singleton;

pub(crate) use inline::InlineStore;
pub(crate) use multipart::{MultiPartStore, PartRef};
pub(crate) use object::ObjectStore;
pub(crate) use singleton::SingletonStore;

/// Tagged dispatch over the storage back-ends.
#[derive(Debug)]
pub(crate) enum Store {
    /// Fixed-size elements in a chunk table.
    Inline(InlineStore),
    /// Owning slots of serializable payloads.
    Object(ObjectStore),
    /// Variable-count runs behind indirection records.
    MultiPart(MultiPartStore),
    /// One inline element, always slot 0.
    Singleton(SingletonStore),
}

impl Store {
    /// Drops whatever the back-end holds for `index`.
    ///
    /// Inline slots keep their bytes (chunks are never reclaimed and the
    /// cleared mask bit is authoritative); object slots drop their payload;
    /// multi-part slots zero their indirection record.
    pub(crate) fn clear_slot(&mut self, index: u32, clock: u64) {
        match self {
            Self::Inline(_) | Self::Singleton(_) => {}
            Self::Object(store) => {
                let _ = store.remove(index, clock);
            }
            Self::MultiPart(store) => store.clear_run(index, clock),
        }
    }
}
