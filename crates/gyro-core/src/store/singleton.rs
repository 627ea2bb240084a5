// SPDX-License-Identifier: Apache-2.0

//! Singleton storage: one inline element, always slot 0.

/// A single-element inline store with its own change version.
#[derive(Debug)]
pub(crate) struct SingletonStore {
    data: Vec<u64>,
    elem_size: usize,
    version: u64,
    present: bool,
}

impl SingletonStore {
    pub(crate) fn new(elem_size: usize) -> Self {
        Self {
            data: vec![0; elem_size.div_ceil(8)],
            elem_size,
            version: 0,
            present: false,
        }
    }

    pub(crate) fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Read-only value bytes; `None` until first written.
    pub(crate) fn get(&self) -> Option<&[u8]> {
        self.present
            .then(|| &bytemuck::cast_slice::<u64, u8>(&self.data)[..self.elem_size])
    }

    /// Exclusive value bytes; marks the value present and stamps `clock`.
    pub(crate) fn get_mut(&mut self, clock: u64) -> &mut [u8] {
        self.present = true;
        self.version = clock;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.data)[..self.elem_size]
    }

    pub(crate) fn is_present(&self) -> bool {
        self.present
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn clear(&mut self) {
        self.data.iter_mut().for_each(|w| *w = 0);
        self.version = 0;
        self.present = false;
    }
}
