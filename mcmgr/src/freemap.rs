// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Allocation of contiguous address ranges out of a fixed region.  Each RDM
//! pool is one of these, as is the space of per-device ECMP ids.  Single
//! records are one-wide ranges; an ECMP End-block is as wide as its group.

use std::collections::BTreeMap;

use slog::{debug, trace};

use aal::RdmAddr;

use crate::types::McError;
use crate::types::McResult;

/// A run of free addresses, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    start: RdmAddr,
    end: RdmAddr,
}

impl Run {
    fn len(&self) -> u32 {
        self.end - self.start
    }
}

/// Tracks the free space of the region `[base, base + size)`.
///
/// Released ranges are parked in a bin for their width, so the common case of
/// freeing and reallocating records of one size never touches the ordered
/// free list.  The bins are folded back into the free list, merging
/// neighbours, only when a request can't otherwise be met.
pub struct FreeMap {
    log: slog::Logger,
    base: RdmAddr,
    size: u32,
    available: u32,
    // Released runs, by width.  Order within a bin is not meaningful.
    bins: BTreeMap<u32, Vec<RdmAddr>>,
    // Free runs not held in a bin, keyed by start address.
    free: BTreeMap<RdmAddr, RdmAddr>,
}

impl FreeMap {
    pub fn new(
        log: &slog::Logger,
        name: impl ToString,
        base: RdmAddr,
        size: u32,
    ) -> Self {
        let unit = format!("freemap_{}", name.to_string());
        let log = log.new(slog::o!("unit" => unit));
        debug!(log, "created new freemap"; "base" => base, "size" => size);
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(base, base + size);
        }
        FreeMap {
            log,
            base,
            size,
            available: size,
            bins: BTreeMap::new(),
            free,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of unallocated addresses.  They may not all be contiguous.
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Allocate `count` contiguous addresses, returning the first.
    ///
    /// A parked run of exactly the right width is used if there is one.
    /// Otherwise the free list is searched in address order for an exact fit,
    /// falling back to the first run that is wide enough.  If that fails too,
    /// the bins are merged back into the free list and the search repeated.
    pub fn alloc(&mut self, count: u32) -> McResult<RdmAddr> {
        if count == 0 {
            return Err(McError::Invalid("zero-sized allocation".into()));
        }
        if let Some(start) = self.take_from_bin(count) {
            trace!(self.log, "reused parked run"; "start" => start,
                "count" => count);
            self.available -= count;
            return Ok(start);
        }

        let run = match self.find_run(count) {
            Some(run) => run,
            None => {
                self.merge_bins();
                self.find_run(count).ok_or_else(|| {
                    McError::NoResources(format!(
                        "no run of {count} free in a region of {}",
                        self.size
                    ))
                })?
            }
        };
        self.free.remove(&run.start);
        if run.len() > count {
            self.free.insert(run.start + count, run.end);
        }
        trace!(self.log, "carved run"; "start" => run.start,
            "count" => count, "runs" => self.free.len());
        self.available -= count;
        Ok(run.start)
    }

    /// Return `count` addresses starting at `start`.
    pub fn free(&mut self, start: RdmAddr, count: u32) {
        debug_assert!(
            start >= self.base && start + count <= self.base + self.size
        );
        trace!(self.log, "parking run"; "start" => start, "count" => count);
        self.available += count;
        self.bins.entry(count).or_default().push(start);
    }

    fn take_from_bin(&mut self, count: u32) -> Option<RdmAddr> {
        let bin = self.bins.get_mut(&count)?;
        let start = bin.pop();
        if bin.is_empty() {
            self.bins.remove(&count);
        }
        start
    }

    fn find_run(&self, count: u32) -> Option<Run> {
        let mut fit = None;
        for (&start, &end) in &self.free {
            let run = Run { start, end };
            if run.len() == count {
                return Some(run);
            }
            if run.len() > count && fit.is_none() {
                fit = Some(run);
            }
        }
        fit
    }

    // Move every parked run to the free list, joining runs that touch.
    fn merge_bins(&mut self) {
        if self.bins.is_empty() {
            return;
        }
        while let Some((count, starts)) = self.bins.pop_first() {
            for start in starts {
                self.free.insert(start, start + count);
            }
        }
        let mut merged: BTreeMap<RdmAddr, RdmAddr> = BTreeMap::new();
        let mut last: Option<Run> = None;
        for (&start, &end) in &self.free {
            last = match last {
                Some(run) if run.end == start => Some(Run {
                    start: run.start,
                    end,
                }),
                Some(run) => {
                    merged.insert(run.start, run.end);
                    Some(Run { start, end })
                }
                None => Some(Run { start, end }),
            };
        }
        if let Some(run) = last {
            merged.insert(run.start, run.end);
        }
        trace!(self.log, "merged parked runs"; "runs" => merged.len());
        self.free = merged;
    }
}
