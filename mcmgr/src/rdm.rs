// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Replication data memory allocation.
//!
//! Each pipe's RDM is carved into one pool per node type, laid out back to
//! back starting at address 1, followed by the tail region.  Addresses are
//! handed out by a [`FreeMap`] per pool.  Multi-step operations take all the
//! addresses they need through a [`Reservation`], which gives every address
//! back if it is dropped before being committed.  Addresses that may have
//! been visible to the dataplane are never returned directly: they go onto
//! the [`DeferredQueue`] and are released once the epoch of the write list
//! that unlinked them has been confirmed.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use serde::Serialize;
use slog::{debug, trace};

use aal::{Epoch, Mgid, RdmAddr};

use crate::config::RdmCapacity;
use crate::freemap::FreeMap;
use crate::types::{McError, McResult};

/// The kinds of record held in replication data memory.  Each has its own
/// pool.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    L1Rid,
    L1Ecmp,
    L1End,
    Vector,
    Port,
    Lag,
    Tail,
}

impl NodeType {
    /// The node types allocated dynamically.  Tails are placed at device
    /// attach and never freed.
    pub const POOLS: [NodeType; 6] = [
        NodeType::L1Rid,
        NodeType::L1Ecmp,
        NodeType::L1End,
        NodeType::Vector,
        NodeType::Port,
        NodeType::Lag,
    ];
}

// The address space of a single pipe.
struct PipeRdm {
    pools: BTreeMap<NodeType, FreeMap>,
    // Every allocated block, by start address
    live: BTreeMap<RdmAddr, (NodeType, u32)>,
}

/// Free and total record counts of one pool in one pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub pipe: u8,
    pub node_type: NodeType,
    pub size: u32,
    pub free: u32,
}

pub(crate) struct RdmAllocator {
    log: slog::Logger,
    pipes: BTreeMap<u8, PipeRdm>,
    // First address past the dynamic pools; the tail region starts here.
    tail_base: RdmAddr,
    // When set, the allocation this many calls from now fails.
    chaos: Option<u32>,
}

impl RdmAllocator {
    pub fn new(
        log: &slog::Logger,
        pipes: impl IntoIterator<Item = u8>,
        capacity: &RdmCapacity,
    ) -> Self {
        let log = log.new(slog::o!("unit" => "rdm"));
        let mut tail_base = 1;
        let mut pipe_map = BTreeMap::new();
        for pipe in pipes {
            let mut base = 1;
            let mut pools = BTreeMap::new();
            for ty in NodeType::POOLS {
                let size = capacity.size(ty);
                let name = format!("{ty}_{pipe}");
                pools.insert(ty, FreeMap::new(&log, name, base, size));
                base += size;
            }
            tail_base = base;
            pipe_map.insert(
                pipe,
                PipeRdm {
                    pools,
                    live: BTreeMap::new(),
                },
            );
        }
        debug!(log, "rdm pools laid out"; "tail_base" => tail_base);
        RdmAllocator {
            log,
            pipes: pipe_map,
            tail_base,
            chaos: None,
        }
    }

    pub fn tail_base(&self) -> RdmAddr {
        self.tail_base
    }

    /// Fail the `n`th allocation from now, counting from 1.
    pub fn set_chaos(&mut self, n: Option<u32>) {
        self.chaos = n;
    }

    fn pipe_mut(&mut self, pipe: u8) -> McResult<&mut PipeRdm> {
        self.pipes
            .get_mut(&pipe)
            .ok_or_else(|| McError::Invalid(format!("no rdm for pipe {pipe}")))
    }

    /// Allocate `count` contiguous records of the given type.
    pub fn alloc(
        &mut self,
        pipe: u8,
        ty: NodeType,
        count: u32,
    ) -> McResult<RdmAddr> {
        if let Some(n) = self.chaos {
            if n <= 1 {
                self.chaos = None;
                return Err(McError::NoResources(format!(
                    "injected failure allocating {count} {ty} in pipe {pipe}"
                )));
            }
            self.chaos = Some(n - 1);
        }
        let rdm = self.pipe_mut(pipe)?;
        let pool = rdm.pools.get_mut(&ty).ok_or_else(|| {
            McError::Invalid(format!("{ty} records are not pooled"))
        })?;
        let addr = pool.alloc(count).map_err(|_| {
            McError::NoResources(format!(
                "{count} {ty} records in pipe {pipe}"
            ))
        })?;
        rdm.live.insert(addr, (ty, count));
        trace!(self.log, "alloc"; "pipe" => pipe, "type" => %ty,
            "addr" => addr, "count" => count);
        Ok(addr)
    }

    /// Return a block to its pool.
    pub fn release(&mut self, pipe: u8, addr: RdmAddr) -> McResult<()> {
        let rdm = self.pipe_mut(pipe)?;
        let (ty, count) = rdm.live.remove(&addr).ok_or_else(|| {
            McError::Internal(format!(
                "releasing unallocated address {addr:#x} in pipe {pipe}"
            ))
        })?;
        let pool = rdm.pools.get_mut(&ty).ok_or_else(|| {
            McError::Internal(format!("no pool for {ty}"))
        })?;
        pool.free(addr, count);
        trace!(self.log, "release"; "pipe" => pipe, "type" => %ty,
            "addr" => addr, "count" => count);
        Ok(())
    }

    /// Shrink a block to its first `keep` records.  The remainder becomes a
    /// block of its own, whose address is returned so that it can be freed
    /// once the dataplane is done with it.
    pub fn split(
        &mut self,
        pipe: u8,
        addr: RdmAddr,
        keep: u32,
    ) -> McResult<Option<RdmAddr>> {
        let rdm = self.pipe_mut(pipe)?;
        let Some((ty, count)) = rdm.live.get(&addr).copied() else {
            return Err(McError::Internal(format!(
                "splitting unallocated address {addr:#x} in pipe {pipe}"
            )));
        };
        if keep == 0 || keep >= count {
            return Ok(None);
        }
        rdm.live.insert(addr, (ty, keep));
        rdm.live.insert(addr + keep, (ty, count - keep));
        Ok(Some(addr + keep))
    }

    /// The type and size of an allocated block.
    pub fn block(&self, pipe: u8, addr: RdmAddr) -> Option<(NodeType, u32)> {
        self.pipes.get(&pipe)?.live.get(&addr).copied()
    }

    pub fn usage(&self) -> Vec<PoolUsage> {
        let mut usage = Vec::new();
        for (pipe, rdm) in &self.pipes {
            for (ty, pool) in &rdm.pools {
                usage.push(PoolUsage {
                    pipe: *pipe,
                    node_type: *ty,
                    size: pool.size(),
                    free: pool.available(),
                });
            }
        }
        usage
    }
}

/// A set of allocations that is either committed as a whole or returned as
/// a whole.
#[must_use = "an uncommitted reservation returns its addresses when dropped"]
pub(crate) struct Reservation<'a> {
    rdm: &'a mut RdmAllocator,
    taken: Vec<(u8, RdmAddr)>,
}

impl<'a> Reservation<'a> {
    pub fn new(rdm: &'a mut RdmAllocator) -> Self {
        Reservation {
            rdm,
            taken: Vec::new(),
        }
    }

    pub fn take(
        &mut self,
        pipe: u8,
        ty: NodeType,
        count: u32,
    ) -> McResult<RdmAddr> {
        let addr = self.rdm.alloc(pipe, ty, count)?;
        self.taken.push((pipe, addr));
        Ok(addr)
    }

    /// Keep everything taken so far.
    pub fn commit(mut self) {
        self.taken.clear();
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.taken.is_empty() {
            return;
        }
        debug!(self.rdm.log, "returning {} unused allocations",
            self.taken.len());
        for (pipe, addr) in self.taken.drain(..) {
            // These were just allocated, so the release can't miss.
            let _ = self.rdm.release(pipe, addr);
        }
    }
}

/// Work that has to wait until the dataplane can no longer observe the
/// structures a write list replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Deferred {
    /// Return a block to its pool.
    Free { pipe: u8, addr: RdmAddr },
    /// Recheck whether a tree can move to a smaller tail.  `len` is the
    /// longest chain the tree had before the write list, which the tail
    /// must keep covering until it drains.
    Shrink { pipe: u8, mgid: Mgid, len: u32 },
}

/// Deferred work, each item tagged with the epoch that must complete before
/// it may run.
#[derive(Default)]
pub(crate) struct DeferredQueue {
    queue: VecDeque<(Epoch, Deferred)>,
}

impl DeferredQueue {
    pub fn push(&mut self, epoch: Epoch, item: Deferred) {
        // Epochs come from successive sends, so the queue stays sorted.
        self.queue.push_back((epoch, item));
    }

    /// Remove and return everything whose epoch has completed.
    pub fn drain_through(&mut self, epoch: Epoch) -> Vec<Deferred> {
        let mut ready = Vec::new();
        while let Some((tag, _)) = self.queue.front() {
            if *tag > epoch {
                break;
            }
            if let Some((_, item)) = self.queue.pop_front() {
                ready.push(item);
            }
        }
        ready
    }

    pub fn pending(&self) -> Vec<(Epoch, Deferred)> {
        self.queue.iter().copied().collect()
    }

    /// The longest chain a tree may still expose through write lists that
    /// haven't drained, if any of them shortened it.
    pub fn shrink_floor(&self, pipe: u8, mgid: Mgid) -> Option<u32> {
        self.queue
            .iter()
            .filter_map(|(_, item)| match item {
                Deferred::Shrink { pipe: p, mgid: m, len }
                    if *p == pipe && *m == mgid =>
                {
                    Some(*len)
                }
                _ => None,
            })
            .max()
    }
}
