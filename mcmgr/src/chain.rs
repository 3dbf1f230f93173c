// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! L2 chains: the port node and LAG nodes hanging off an L1 node.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use aal::{AsicOps, DevPort, LagId, PortBitmap, RdmAddr, RdmRecord};

use crate::batch::WriteBatch;
use crate::device::Device;
use crate::rdm::{NodeType, Reservation};
use crate::types::McResult;

/// What one L2 record replicates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum L2Content {
    Port(PortBitmap),
    Lag(LagId),
}

impl L2Content {
    fn node_type(&self) -> NodeType {
        match self {
            L2Content::Port(_) => NodeType::Port,
            L2Content::Lag(_) => NodeType::Lag,
        }
    }
}

/// An L2 chain in one pipe.  Entries with address 0 have been planned but
/// not yet allocated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct L2Chain {
    pub entries: Vec<(RdmAddr, L2Content)>,
}

impl L2Chain {
    pub fn planned(contents: Vec<L2Content>) -> Self {
        L2Chain {
            entries: contents.into_iter().map(|c| (0, c)).collect(),
        }
    }

    pub fn head(&self) -> Option<RdmAddr> {
        self.entries.first().map(|(addr, _)| *addr)
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contents(&self) -> Vec<L2Content> {
        self.entries.iter().map(|(_, c)| *c).collect()
    }

    pub fn addrs(&self) -> impl Iterator<Item = RdmAddr> + '_ {
        self.entries.iter().map(|(addr, _)| *addr)
    }

    /// Take an address for every entry.
    pub fn reserve(&mut self, res: &mut Reservation, pipe: u8) -> McResult<()> {
        for (addr, content) in self.entries.iter_mut() {
            *addr = res.take(pipe, content.node_type(), 1)?;
        }
        Ok(())
    }
}

impl<H: AsicOps> Device<H> {
    fn port_in_pipe(&self, port: DevPort, pipe: u8) -> bool {
        self.port_pipe(port) == Some(pipe)
            || self
                .backups
                .get(&port)
                .is_some_and(|b| self.port_pipe(*b) == Some(pipe))
    }

    /// Work out the L2 chain a node with these ports and LAGs needs in every
    /// pipe.  A port is carried in its own pipe and in the pipe of its backup
    /// port; a LAG is carried in every pipe holding one of its members or a
    /// member's backup.  Pipes needing nothing are left out.
    pub fn chain_contents(
        &self,
        ports: &BTreeSet<DevPort>,
        lags: &BTreeSet<LagId>,
    ) -> BTreeMap<u8, Vec<L2Content>> {
        let mut out = BTreeMap::new();
        for pipe in self.pipes.keys().copied() {
            let mut chain = Vec::new();
            let bitmap = PortBitmap::from_ports(
                ports.iter().filter(|p| self.port_in_pipe(**p, pipe)),
            );
            if !bitmap.is_empty() {
                chain.push(L2Content::Port(bitmap));
            }
            for lag_id in lags {
                let present = self.lags.get(lag_id).is_some_and(|members| {
                    members
                        .ports()
                        .into_iter()
                        .any(|m| self.port_in_pipe(m, pipe))
                });
                if present {
                    chain.push(L2Content::Lag(*lag_id));
                }
            }
            if !chain.is_empty() {
                out.insert(pipe, chain);
            }
        }
        out
    }

    /// Stage the records of a chain.  They are written back to front, so
    /// every record points at one that already exists.
    pub fn write_chain(
        &self,
        batch: &mut WriteBatch,
        pipe: u8,
        chain: &L2Chain,
    ) {
        let mut next = None;
        for (addr, content) in chain.entries.iter().rev() {
            let record = match content {
                L2Content::Port(ports) => RdmRecord::Port {
                    ports: *ports,
                    next,
                },
                L2Content::Lag(lag_id) => RdmRecord::Lag {
                    lag_id: *lag_id,
                    next,
                },
            };
            self.rdm_write(batch, pipe, *addr, record);
            next = Some(*addr);
        }
    }
}
