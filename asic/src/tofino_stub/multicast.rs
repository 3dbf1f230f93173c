// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::{BTreeMap, HashMap, HashSet};

use aal::{
    AsicError, AsicResult, DevPort, LagId, McWrite, Mgid, PortBitmap, RdmAddr,
    RdmRecord, Rid, Xid,
};

// Upper bound on the number of records followed in a single walk, so a loop
// in a corrupted structure can't hang the model.
const WALK_LIMIT: usize = 4096;

/// One hop of an L2 chain as seen by the dataplane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum L2Hop {
    Ports(PortBitmap),
    Lag(LagId),
}

/// One L1 node as seen by the dataplane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Replica {
    Rid {
        rid: Rid,
        xid: Option<Xid>,
        l2: Vec<L2Hop>,
    },
    /// An ECMP pointer, with the members selectable through the vector of
    /// the active table version.
    Ecmp {
        xid: Option<Xid>,
        members: Vec<(u8, Rid, Vec<L2Hop>)>,
    },
}

/// The result of walking one tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeWalk {
    pub l1: Vec<Replica>,
    /// Size of the tail block terminating the L1 list, if any.
    pub tail: Option<u8>,
}

pub(crate) struct McModel {
    pub staged: Vec<(u8, McWrite)>,
    pub rdm: HashMap<(u8, RdmAddr), RdmRecord>,
    pub mit: HashMap<(u8, Mgid), RdmAddr>,
    pub pvt: Vec<BTreeMap<u32, u64>>,
    pub tvt: Vec<BTreeMap<u32, u64>>,
    pub lit: BTreeMap<LagId, PortBitmap>,
    pub pmt: BTreeMap<DevPort, DevPort>,
    pub version: u8,
    pub flips: u32,
    pub epoch: u64,
    pub drain: [u32; 2],
    pub drain_polls: Option<u32>,
    pub writes: u64,
    pub violations: Vec<String>,
}

impl McModel {
    pub fn new(subdevices: u8) -> Self {
        McModel {
            staged: Vec::new(),
            rdm: HashMap::new(),
            mit: HashMap::new(),
            pvt: vec![BTreeMap::new(); subdevices as usize],
            tvt: vec![BTreeMap::new(); subdevices as usize],
            lit: BTreeMap::new(),
            pmt: BTreeMap::new(),
            version: 0,
            flips: 0,
            epoch: 0,
            drain: [0, 0],
            drain_polls: None,
            writes: 0,
            violations: Vec::new(),
        }
    }

    pub fn apply(&mut self, subdev: u8, write: McWrite) {
        self.writes += 1;
        match write {
            McWrite::Rdm { pipe, addr, record } => {
                self.rdm.insert((pipe, addr), record);
            }
            McWrite::Mit { pipe, mgid, head } => match head {
                Some(addr) => {
                    self.mit.insert((pipe, mgid), addr);
                }
                None => {
                    self.mit.remove(&(pipe, mgid));
                }
            },
            McWrite::PvtRow { row, value } => {
                self.pvt[subdev as usize].insert(row, value);
            }
            McWrite::TvtRow { row, value } => {
                self.tvt[subdev as usize].insert(row, value);
            }
            McWrite::Lit { lag_id, ports } => {
                self.lit.insert(lag_id, ports);
            }
            McWrite::Pmt { port, backup } => match backup {
                Some(b) => {
                    self.pmt.insert(port, b);
                }
                None => {
                    self.pmt.remove(&port);
                }
            },
        }
    }

    fn get(&self, pipe: u8, addr: RdmAddr) -> AsicResult<&RdmRecord> {
        self.rdm.get(&(pipe, addr)).ok_or_else(|| {
            AsicError::Missing(format!("pipe {pipe} addr {addr:#x} unwritten"))
        })
    }

    fn walk_l2(
        &self,
        pipe: u8,
        mut next: Option<RdmAddr>,
    ) -> AsicResult<Vec<L2Hop>> {
        let mut hops = Vec::new();
        while let Some(addr) = next {
            if hops.len() > WALK_LIMIT {
                return Err(AsicError::Internal("L2 chain loops".into()));
            }
            match self.get(pipe, addr)? {
                RdmRecord::Port { ports, next: n } => {
                    hops.push(L2Hop::Ports(*ports));
                    next = *n;
                }
                RdmRecord::Lag { lag_id, next: n } => {
                    hops.push(L2Hop::Lag(*lag_id));
                    next = *n;
                }
                r => {
                    return Err(AsicError::Internal(format!(
                        "pipe {pipe} addr {addr:#x}: expected L2, found {r:?}"
                    )))
                }
            }
        }
        Ok(hops)
    }

    fn walk_ecmp(
        &self,
        pipe: u8,
        vectors: &[RdmAddr; 2],
    ) -> AsicResult<Vec<(u8, Rid, Vec<L2Hop>)>> {
        let vaddr = vectors[self.version as usize];
        let (base, mask) = match self.get(pipe, vaddr)? {
            RdmRecord::Vector { base, mask } => (*base, *mask),
            r => {
                return Err(AsicError::Internal(format!(
                    "pipe {pipe} addr {vaddr:#x}: expected vector, found {r:?}"
                )))
            }
        };
        let mut members = Vec::new();
        for slot in 0..32u8 {
            if mask & (1 << slot) == 0 {
                continue;
            }
            let addr = base + slot as RdmAddr;
            match self.get(pipe, addr)? {
                RdmRecord::L1End { rid, l2 } => {
                    members.push((slot, *rid, self.walk_l2(pipe, *l2)?))
                }
                r => {
                    return Err(AsicError::Internal(format!(
                        "pipe {pipe} member {slot} at {addr:#x}: expected \
                         L1-End, found {r:?}"
                    )))
                }
            }
        }
        Ok(members)
    }

    pub fn walk(&self, pipe: u8, mgid: Mgid) -> AsicResult<TreeWalk> {
        let mut walk = TreeWalk::default();
        let mut next = self.mit.get(&(pipe, mgid)).copied();
        let mut seen = HashSet::new();
        while let Some(addr) = next {
            if !seen.insert(addr) || seen.len() > WALK_LIMIT {
                return Err(AsicError::Internal(format!(
                    "mgid {mgid} pipe {pipe}: L1 list loops"
                )));
            }
            match self.get(pipe, addr)? {
                RdmRecord::L1Rid { next: n, rid, xid, l2 } => {
                    walk.l1.push(Replica::Rid {
                        rid: *rid,
                        xid: *xid,
                        l2: self.walk_l2(pipe, *l2)?,
                    });
                    next = *n;
                }
                RdmRecord::L1Ecmp { next: n, xid, vectors } => {
                    walk.l1.push(Replica::Ecmp {
                        xid: *xid,
                        members: self.walk_ecmp(pipe, vectors)?,
                    });
                    next = *n;
                }
                RdmRecord::Tail { size } => {
                    walk.tail = Some(*size);
                    next = None;
                }
                r => {
                    return Err(AsicError::Internal(format!(
                        "mgid {mgid} pipe {pipe} addr {addr:#x}: expected L1, \
                         found {r:?}"
                    )))
                }
            }
        }
        Ok(walk)
    }

    /// Walk every live tree, recording anything the dataplane could trip over.
    pub fn audit(&mut self) {
        let mut roots: Vec<(u8, Mgid)> = self.mit.keys().copied().collect();
        roots.sort_unstable();
        let mut found = Vec::new();
        for (pipe, mgid) in roots {
            if let Err(e) = self.walk(pipe, mgid) {
                found.push(format!("after write {}: {e}", self.writes));
            }
        }
        self.violations.extend(found);
    }
}
