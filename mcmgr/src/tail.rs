// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Tail blocks.  The last L1 node of a tree points at a pre-sized tail
//! block, which bounds how deep the dataplane has to walk.  One block of
//! each configured size is placed in every pipe when the device is added.

use aal::RdmAddr;

/// Tail bookkeeping for one tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TreeLen {
    /// Size of the tail the hardware is using.
    pub hw: Option<u8>,
    /// Longest L2 chain hanging off the tree.
    pub sw: u32,
    /// A smaller tail is waiting for an epoch before it can be installed.
    pub pending: bool,
}

pub(crate) struct TailTable {
    sizes: Vec<u8>,
    bases: Vec<RdmAddr>,
}

/// What a length change asks of the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TailChange {
    None,
    /// Install a larger tail now, before the longer tree becomes visible.
    Grow(Option<u8>),
    /// Install a smaller tail once the current epoch completes.
    Shrink,
}

impl TailTable {
    /// Lay out one tail block per size, starting at `base`.
    pub fn new(sizes: Vec<u8>, mut base: RdmAddr) -> Self {
        let mut bases = Vec::with_capacity(sizes.len());
        for size in &sizes {
            bases.push(base);
            base += *size as RdmAddr;
        }
        TailTable { sizes, bases }
    }

    pub fn sizes(&self) -> &[u8] {
        &self.sizes
    }

    pub fn blocks(&self) -> impl Iterator<Item = (u8, RdmAddr)> + '_ {
        self.sizes.iter().copied().zip(self.bases.iter().copied())
    }

    /// Returns the tail size for a tree whose longest chain is `len`, and
    /// whether that length exceeds every configured size.
    pub fn pick(&self, len: u32) -> (Option<u8>, bool) {
        if len <= 1 || self.sizes.is_empty() {
            return (None, false);
        }
        match self.sizes.iter().find(|s| u32::from(**s) >= len) {
            Some(size) => (Some(*size), false),
            None => (self.sizes.last().copied(), true),
        }
    }

    pub fn base(&self, size: u8) -> Option<RdmAddr> {
        self.sizes
            .iter()
            .position(|s| *s == size)
            .map(|idx| self.bases[idx])
    }

    /// Decide how the tail of a tree has to move now that its longest chain
    /// is `len`.  `current` is the size the hardware is using.
    pub fn change(&self, current: Option<u8>, len: u32) -> TailChange {
        let (want, _) = self.pick(len);
        // None sorts below every size, so this orders "no tail" first.
        match want.cmp(&current) {
            std::cmp::Ordering::Equal => TailChange::None,
            std::cmp::Ordering::Greater => TailChange::Grow(want),
            std::cmp::Ordering::Less => TailChange::Shrink,
        }
    }
}
