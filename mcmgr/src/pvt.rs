// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Software shadows of the pipe and die vector tables.  Each MGID owns a
//! narrow field packed into a shared hardware row, so every update is
//! composed in the shadow and the whole row is written.

use aal::{Mgid, VectorLayout};

#[derive(Clone)]
pub(crate) struct VectorTable {
    layout: VectorLayout,
    rows: Vec<u64>,
}

impl VectorTable {
    pub fn new(layout: VectorLayout, mgids: u32) -> Self {
        VectorTable {
            layout,
            rows: vec![0; layout.rows(mgids) as usize],
        }
    }

    pub fn row_count(&self) -> u32 {
        self.rows.len() as u32
    }

    pub fn row(&self, row: u32) -> Option<u64> {
        self.rows.get(row as usize).copied()
    }

    pub fn get(&self, mgid: Mgid) -> u32 {
        let (row, shift) = self.layout.locate(mgid);
        let value = self.rows.get(row as usize).copied().unwrap_or(0);
        ((value >> shift) & self.layout.field_mask()) as u32
    }

    /// Store a new mask for an MGID, returning the row to write and its new
    /// value.  Bits that don't fit the field are dropped.
    pub fn set(&mut self, mgid: Mgid, mask: u32) -> (u32, u64) {
        let (row, shift) = self.layout.locate(mgid);
        let fmask = self.layout.field_mask();
        let slot = &mut self.rows[row as usize];
        *slot = (*slot & !(fmask << shift)) | ((mask as u64 & fmask) << shift);
        (row, *slot)
    }

    /// Whether a mask fits within an MGID's field.
    pub fn fits(&self, mask: u32) -> bool {
        mask as u64 & !self.layout.field_mask() == 0
    }

    pub fn clear(&mut self) {
        self.rows.iter_mut().for_each(|r| *r = 0);
    }
}
