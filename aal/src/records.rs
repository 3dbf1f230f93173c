// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The records the replication manager writes through the write list.  These
//! are the manager's view of the hardware tables; packing them into the
//! device's descriptor format is the transport's job.

use crate::{DevPort, PortBitmap};

/// An address in a pipe's replication data memory.  Address 0 is never
/// handed out.
pub type RdmAddr = u32;

/// Multicast group id.
pub type Mgid = u16;

/// Replication id carried by an L1 node.
pub type Rid = u16;

/// Level-1 exclusion id.
pub type Xid = u16;

/// Link aggregation group id.
pub type LagId = u8;

/// A single record in replication data memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RdmRecord {
    /// An L1 node replicating to its own L2 chain.
    L1Rid {
        next: Option<RdmAddr>,
        rid: Rid,
        xid: Option<Xid>,
        l2: Option<RdmAddr>,
    },
    /// An L1 node handing replication off to an ECMP group.  The dataplane
    /// follows `vectors[v]`, where `v` is the device's table version.
    L1Ecmp {
        next: Option<RdmAddr>,
        xid: Option<Xid>,
        vectors: [RdmAddr; 2],
    },
    /// One member slot of an ECMP group's L1-End block.
    L1End { rid: Rid, l2: Option<RdmAddr> },
    /// An ECMP vector: the End-block base and the member mask.
    Vector { base: RdmAddr, mask: u32 },
    /// An L2 port node.
    Port {
        ports: PortBitmap,
        next: Option<RdmAddr>,
    },
    /// An L2 LAG node.
    Lag {
        lag_id: LagId,
        next: Option<RdmAddr>,
    },
    /// The head of a fixed-size tail block.
    Tail { size: u8 },
}

/// A single write staged on the write list.  Pipes are physical pipes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum McWrite {
    /// Write one record of a pipe's replication data memory.
    Rdm {
        pipe: u8,
        addr: RdmAddr,
        record: RdmRecord,
    },
    /// Point the tree root of an MGID in one pipe at a new first L1 node.
    Mit {
        pipe: u8,
        mgid: Mgid,
        head: Option<RdmAddr>,
    },
    /// Write one row of the pipe vector table.
    PvtRow { row: u32, value: u64 },
    /// Write one row of the die vector table.
    TvtRow { row: u32, value: u64 },
    /// Write one row of the LAG membership table.
    Lit { lag_id: LagId, ports: PortBitmap },
    /// Write the protection entry for a port.
    Pmt {
        port: DevPort,
        backup: Option<DevPort>,
    },
}
