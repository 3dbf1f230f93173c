// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use serde::{Deserialize, Serialize};

/// There are three generations of the Tofino ASIC, which the SDE refers to as
/// "families".  They differ in how many pipes they carry, whether the
/// replication engine supports tail blocks, and how the pipe and die vector
/// tables are packed.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TofinoFamily {
    Tofino1,
    Tofino2,
    Tofino3,
}

/// Describes how a per-MGID bitmask is packed into the rows of a vector
/// table.  Each MGID owns a `field_bits` wide field; as many fields as fit
/// are packed into each `row_bits` wide hardware word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VectorLayout {
    pub field_bits: u32,
    pub row_bits: u32,
}

impl VectorLayout {
    pub const fn fields_per_row(&self) -> u32 {
        self.row_bits / self.field_bits
    }

    pub const fn field_mask(&self) -> u64 {
        (1u64 << self.field_bits) - 1
    }

    /// Returns the row holding an MGID's field, and the bit offset of the
    /// field within that row.
    pub const fn locate(&self, mgid: u16) -> (u32, u32) {
        let per_row = self.fields_per_row();
        let row = mgid as u32 / per_row;
        let shift = (mgid as u32 % per_row) * self.field_bits;
        (row, shift)
    }

    /// Number of rows needed to cover `count` MGIDs.
    pub const fn rows(&self, count: u32) -> u32 {
        count.div_ceil(self.fields_per_row())
    }
}

impl TofinoFamily {
    /// The largest number of pipes a device of this family can carry.
    pub fn max_pipes(&self) -> u8 {
        match self {
            TofinoFamily::Tofino1 | TofinoFamily::Tofino2 => 4,
            TofinoFamily::Tofino3 => 8,
        }
    }

    /// Whether the replication engine supports fixed-size tail blocks.
    pub fn has_tails(&self) -> bool {
        !matches!(self, TofinoFamily::Tofino1)
    }

    /// Tail block sizes used when the configuration doesn't override them.
    pub fn default_tail_sizes(&self) -> Vec<u8> {
        if self.has_tails() {
            vec![2, 4, 8, 16, 32]
        } else {
            Vec::new()
        }
    }

    pub fn pvt_layout(&self) -> VectorLayout {
        match self {
            TofinoFamily::Tofino1 => VectorLayout {
                field_bits: 4,
                row_bits: 32,
            },
            TofinoFamily::Tofino2 => VectorLayout {
                field_bits: 5,
                row_bits: 64,
            },
            TofinoFamily::Tofino3 => VectorLayout {
                field_bits: 8,
                row_bits: 64,
            },
        }
    }

    /// Only multi-die devices carry a die vector table.
    pub fn tvt_layout(&self) -> Option<VectorLayout> {
        match self {
            TofinoFamily::Tofino3 => Some(VectorLayout {
                field_bits: 4,
                row_bits: 32,
            }),
            _ => None,
        }
    }
}
