// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! RID nodes, and their attachment to MGIDs.
//!
//! A node is a replication id plus the ports and LAGs it replicates to.  It
//! is either attached directly to one MGID, in which case it owns an L1 RID
//! node in every pipe its ports reach, or it is a member of one ECMP group.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Serialize;
use slog::debug;

use aal::{AsicOps, DevPort, LagId, Mgid, RdmAddr, Rid, Xid};

use crate::batch::WriteBatch;
use crate::chain::{L2Chain, L2Content};
use crate::device::Device;
use crate::rdm::{NodeType, Reservation};
use crate::tree::{L1Handle, L1Kind};
use crate::types::{McError, McResult};
use crate::{GroupHandle, NodeHandle};

#[derive(Debug, Clone)]
pub(crate) enum Attach {
    Mgid {
        mgid: Mgid,
        xid: Option<Xid>,
        l1: BTreeMap<u8, L1Handle>,
    },
    Group {
        group: GroupHandle,
        slot: u8,
    },
}

#[derive(Debug)]
pub(crate) struct Node {
    pub rid: Rid,
    pub ports: BTreeSet<DevPort>,
    pub lags: BTreeSet<LagId>,
    pub attach: Option<Attach>,
}

/// Where a node is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeAttachment {
    Mgid { mgid: Mgid, xid: Option<Xid> },
    Group { group: GroupHandle, slot: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub rid: Rid,
    pub ports: Vec<DevPort>,
    pub lags: Vec<LagId>,
    pub attached: Option<NodeAttachment>,
    /// Logical pipes the node replicates into.
    pub pipes: Vec<u8>,
}

/// How one pipe of a directly attached node has to change.
#[derive(Debug)]
pub(crate) enum PipeChange {
    Add { l1: RdmAddr, chain: L2Chain },
    Modify { chain: L2Chain },
    Remove,
}

/// The changes needed to bring an MGID-attached node's trees in line with
/// its content.
#[derive(Debug)]
pub(crate) struct NodePlan {
    pub node: NodeHandle,
    pub mgid: Mgid,
    pub xid: Option<Xid>,
    pub pipes: BTreeMap<u8, PipeChange>,
}

impl NodePlan {
    pub fn reserve(&mut self, res: &mut Reservation) -> McResult<()> {
        for (pipe, change) in self.pipes.iter_mut() {
            match change {
                PipeChange::Add { l1, chain } => {
                    *l1 = res.take(*pipe, NodeType::L1Rid, 1)?;
                    chain.reserve(res, *pipe)?;
                }
                PipeChange::Modify { chain } => chain.reserve(res, *pipe)?,
                PipeChange::Remove => {}
            }
        }
        Ok(())
    }
}

impl<H: AsicOps> Device<H> {
    pub fn node(&self, node: NodeHandle) -> McResult<&Node> {
        self.nodes
            .get(node)
            .ok_or_else(|| McError::Missing(format!("no such node: {node:?}")))
    }

    fn check_content(&self, ports: &[DevPort]) -> McResult<()> {
        for port in ports {
            self.check_port(*port)?;
        }
        Ok(())
    }

    pub fn node_create(
        &mut self,
        rid: Rid,
        ports: &[DevPort],
        lags: &[LagId],
    ) -> McResult<NodeHandle> {
        self.check_content(ports)?;
        let node = self.nodes.insert(Node {
            rid,
            ports: ports.iter().copied().collect(),
            lags: lags.iter().copied().collect(),
            attach: None,
        });
        debug!(self.log, "created node"; "node" => ?node, "rid" => rid);
        Ok(node)
    }

    pub fn node_destroy(&mut self, node: NodeHandle) -> McResult<()> {
        if self.node(node)?.attach.is_some() {
            return Err(McError::Invalid(format!(
                "node {node:?} is still attached"
            )));
        }
        self.nodes.remove(node);
        debug!(self.log, "destroyed node"; "node" => ?node);
        Ok(())
    }

    pub fn node_get(&self, node: NodeHandle) -> McResult<NodeInfo> {
        let n = self.node(node)?;
        let attached = n.attach.as_ref().map(|a| match a {
            Attach::Mgid { mgid, xid, .. } => NodeAttachment::Mgid {
                mgid: *mgid,
                xid: *xid,
            },
            Attach::Group { group, slot } => NodeAttachment::Group {
                group: *group,
                slot: *slot,
            },
        });
        Ok(NodeInfo {
            rid: n.rid,
            ports: n.ports.iter().copied().collect(),
            lags: n.lags.iter().copied().collect(),
            attached,
            pipes: self.chain_contents(&n.ports, &n.lags).into_keys().collect(),
        })
    }

    /// Change a node's ports and LAGs, moving every tree or group it is part
    /// of over to the new content.
    pub fn node_update(
        &mut self,
        node: NodeHandle,
        ports: &[DevPort],
        lags: &[LagId],
    ) -> McResult<()> {
        self.check_content(ports)?;
        let n = self.node(node)?;
        let old_ports = n.ports.clone();
        let old_lags = n.lags.clone();
        let new_ports: BTreeSet<DevPort> = ports.iter().copied().collect();
        let new_lags: BTreeSet<LagId> = lags.iter().copied().collect();
        if old_ports == new_ports && old_lags == new_lags {
            return Ok(());
        }

        self.nodes[node].ports = new_ports;
        self.nodes[node].lags = new_lags;
        let mut plan = match self.plan_refresh(&[node]) {
            Ok(plan) => plan,
            Err(e) => {
                self.nodes[node].ports = old_ports;
                self.nodes[node].lags = old_lags;
                return Err(e);
            }
        };
        if let Err(e) = self.reserve_refresh(&mut plan) {
            self.nodes[node].ports = old_ports;
            self.nodes[node].lags = old_lags;
            return Err(e);
        }
        self.apply_refresh(WriteBatch::new(), plan, "node update")
    }

    /// The chain contents a directly attached node currently has in hardware.
    fn attached_contents(
        &self,
        l1: &BTreeMap<u8, L1Handle>,
    ) -> BTreeMap<u8, Vec<L2Content>> {
        l1.iter()
            .filter_map(|(pipe, h)| match &self.l1.get(*h)?.kind {
                L1Kind::Rid { chain, .. } => Some((*pipe, chain.contents())),
                L1Kind::Ecmp { .. } => None,
            })
            .collect()
    }

    /// Plan moving a directly attached node from its current trees to the
    /// trees its content calls for.  With `detach`, every tree is dropped.
    pub fn plan_node(
        &self,
        node: NodeHandle,
        detach: bool,
    ) -> McResult<Option<NodePlan>> {
        let n = self.node(node)?;
        let Some(Attach::Mgid { mgid, xid, l1 }) = &n.attach else {
            return Ok(None);
        };
        let current = self.attached_contents(l1);
        let wanted = if detach {
            BTreeMap::new()
        } else {
            self.chain_contents(&n.ports, &n.lags)
        };
        Ok(Some(NodePlan {
            node,
            mgid: *mgid,
            xid: *xid,
            pipes: diff_contents(&current, wanted),
        }))
    }

    /// Carry out a reserved node plan.
    pub fn apply_node(
        &mut self,
        batch: &mut WriteBatch,
        plan: NodePlan,
    ) -> McResult<()> {
        let NodePlan {
            node,
            mgid,
            xid,
            pipes,
        } = plan;
        for (pipe, change) in pipes {
            match change {
                PipeChange::Add { l1, chain } => {
                    self.write_chain(batch, pipe, &chain);
                    let h = self.link_l1(
                        batch,
                        pipe,
                        mgid,
                        l1,
                        L1Kind::Rid { node, xid, chain },
                    );
                    if let Some(Attach::Mgid { l1, .. }) =
                        self.nodes[node].attach.as_mut()
                    {
                        l1.insert(pipe, h);
                    }
                }
                PipeChange::Modify { chain } => {
                    let h = self.attached_l1(node, pipe)?;
                    self.write_chain(batch, pipe, &chain);
                    if let L1Kind::Rid { chain: old, .. } = &mut self.l1[h].kind
                    {
                        let old = std::mem::replace(old, chain);
                        batch.free_all(pipe, old.addrs());
                    }
                    self.retail(batch, pipe, mgid, Some(h));
                    self.write_l1(batch, h);
                }
                PipeChange::Remove => {
                    let h = self.attached_l1(node, pipe)?;
                    self.unlink_l1(batch, h)?;
                    if let Some(Attach::Mgid { l1, .. }) =
                        self.nodes[node].attach.as_mut()
                    {
                        l1.remove(&pipe);
                    }
                }
            }
        }
        self.sync_vectors(batch, mgid);
        Ok(())
    }

    fn attached_l1(&self, node: NodeHandle, pipe: u8) -> McResult<L1Handle> {
        match &self.node(node)?.attach {
            Some(Attach::Mgid { l1, .. }) => l1.get(&pipe).copied(),
            _ => None,
        }
        .ok_or_else(|| {
            McError::Internal(format!("node {node:?} has no L1 in pipe {pipe}"))
        })
    }

    pub fn mgid_attach_node(
        &mut self,
        mgid: Mgid,
        node: NodeHandle,
        xid: Option<Xid>,
    ) -> McResult<()> {
        self.check_mgid(mgid)?;
        if let Some(attach) = &self.node(node)?.attach {
            return Err(McError::Exists(format!(
                "node {node:?} is already attached: {attach:?}"
            )));
        }
        self.nodes[node].attach = Some(Attach::Mgid {
            mgid,
            xid,
            l1: BTreeMap::new(),
        });
        let plan = self.plan_node(node, false).and_then(|plan| {
            plan.ok_or_else(|| McError::Internal("attach plan vanished".into()))
        });
        let mut plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                self.nodes[node].attach = None;
                return Err(e);
            }
        };
        let reserved = {
            let mut res = Reservation::new(&mut self.rdm);
            let r = plan.reserve(&mut res);
            if r.is_ok() {
                res.commit();
            }
            r
        };
        if let Err(e) = reserved {
            self.nodes[node].attach = None;
            return Err(e);
        }

        let mut batch = WriteBatch::new();
        let pipes = plan.pipes.len();
        self.apply_node(&mut batch, plan)?;
        debug!(self.log, "attached node"; "mgid" => mgid, "node" => ?node,
            "pipes" => pipes);
        self.commit(batch, "mgid attach")
    }

    pub fn mgid_detach_node(
        &mut self,
        mgid: Mgid,
        node: NodeHandle,
    ) -> McResult<()> {
        self.check_mgid(mgid)?;
        match &self.node(node)?.attach {
            Some(Attach::Mgid { mgid: m, .. }) if *m == mgid => {}
            _ => {
                return Err(McError::Missing(format!(
                    "node {node:?} is not attached to mgid {mgid}"
                )))
            }
        }
        let Some(plan) = self.plan_node(node, true)? else {
            return Err(McError::Internal("detach plan vanished".into()));
        };
        let mut batch = WriteBatch::new();
        self.apply_node(&mut batch, plan)?;
        self.nodes[node].attach = None;
        debug!(self.log, "detached node"; "mgid" => mgid, "node" => ?node);
        self.commit(batch, "mgid detach")
    }
}

/// Compare a node's chains as they are against what they should be.
pub(crate) fn diff_contents(
    current: &BTreeMap<u8, Vec<L2Content>>,
    mut wanted: BTreeMap<u8, Vec<L2Content>>,
) -> BTreeMap<u8, PipeChange> {
    let mut changes = BTreeMap::new();
    for (pipe, old) in current {
        match wanted.remove(pipe) {
            None => {
                changes.insert(*pipe, PipeChange::Remove);
            }
            Some(new) if new != *old => {
                changes.insert(
                    *pipe,
                    PipeChange::Modify {
                        chain: L2Chain::planned(new),
                    },
                );
            }
            Some(_) => {}
        }
    }
    for (pipe, new) in wanted {
        changes.insert(
            pipe,
            PipeChange::Add {
                l1: 0,
                chain: L2Chain::planned(new),
            },
        );
    }
    changes
}
