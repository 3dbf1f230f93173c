// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Write batches.  An operation stages its hardware writes, the work it has
//! to defer until the writes are confirmed, and enough to restore the table
//! shadows if the writes never make it to the device.

use aal::{McWrite, Mgid, RdmAddr};

use crate::rdm::Deferred;

/// A shadow value to put back if the batch fails to reach the hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Undo {
    Pvt { mgid: Mgid, old: u32 },
    Tvt { mgid: Mgid, old: u32 },
}

#[must_use = "a write batch does nothing until it is flushed"]
#[derive(Debug, Default)]
pub(crate) struct WriteBatch {
    pub writes: Vec<(u8, McWrite)>,
    pub deferred: Vec<Deferred>,
    pub undo: Vec<Undo>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subdev: u8, write: McWrite) {
        self.writes.push((subdev, write));
    }

    /// Free a block once this batch has been confirmed.
    pub fn free(&mut self, pipe: u8, addr: RdmAddr) {
        self.deferred.push(Deferred::Free { pipe, addr });
    }

    pub fn free_all(
        &mut self,
        pipe: u8,
        addrs: impl IntoIterator<Item = RdmAddr>,
    ) {
        for addr in addrs {
            self.free(pipe, addr);
        }
    }

    /// Revisit the tail of a tree once this batch has been confirmed.  `len`
    /// is the tree's longest chain before the batch.
    pub fn shrink(&mut self, pipe: u8, mgid: Mgid, len: u32) {
        for item in self.deferred.iter_mut() {
            if let Deferred::Shrink { pipe: p, mgid: m, len: l } = item {
                if *p == pipe && *m == mgid {
                    *l = (*l).max(len);
                    return;
                }
            }
        }
        self.deferred.push(Deferred::Shrink { pipe, mgid, len });
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deferred.is_empty()
    }

    /// Move the deferred work onto another batch, typically the one that
    /// completes a multi-step update.
    pub fn hand_off(&mut self, to: &mut WriteBatch) {
        to.deferred.append(&mut self.deferred);
    }
}
