// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The per-pipe L1 lists of every MGID.
//!
//! A new L1 node is always linked in at the head of its list: its record is
//! written pointing at the old head, the tail is grown if needed, and only
//! then is the tree root repointed at it.  Removal runs the other way around:
//! the predecessor (or the tree root) is repointed past the node first, and
//! the node and its chain are freed once the dataplane has drained.

use serde::Serialize;
use slog::{debug, warn};

use aal::{AsicOps, McWrite, Mgid, RdmAddr, RdmRecord, Rid, Xid};

use crate::arena::arena_key;
use crate::batch::WriteBatch;
use crate::chain::L2Chain;
use crate::device::Device;
use crate::tail::{TailChange, TreeLen};
use crate::types::{McError, McResult};
use crate::{GroupHandle, NodeHandle};

arena_key!(
    /// Refers to one L1 node in one pipe.
    L1Handle
);

#[derive(Debug)]
pub(crate) enum L1Kind {
    /// A RID leaf, owning its L2 chain.
    Rid {
        node: NodeHandle,
        xid: Option<Xid>,
        chain: L2Chain,
    },
    /// A pointer to an ECMP group's vectors in this pipe.
    Ecmp {
        group: GroupHandle,
        xid: Option<Xid>,
    },
}

#[derive(Debug)]
pub(crate) struct L1Node {
    pub pipe: u8,
    pub mgid: Mgid,
    pub addr: RdmAddr,
    pub prev: Option<L1Handle>,
    pub next: Option<L1Handle>,
    pub kind: L1Kind,
}

#[derive(Debug)]
pub(crate) struct Tree {
    pub head: L1Handle,
    pub len: TreeLen,
}

/// One L1 node of a tree, in hardware order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum L1Info {
    Rid {
        node: NodeHandle,
        addr: RdmAddr,
        rid: Rid,
        xid: Option<Xid>,
        chain_len: u32,
    },
    Ecmp {
        group: GroupHandle,
        addr: RdmAddr,
        xid: Option<Xid>,
    },
}

/// A snapshot of one MGID's tree in one pipe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeInfo {
    pub l1: Vec<L1Info>,
    /// Longest L2 chain in the tree.
    pub len: u32,
    /// Size of the tail block the hardware is using.
    pub tail: Option<u8>,
    /// A smaller tail is waiting for the next epoch.
    pub shrink_pending: bool,
}

impl<H: AsicOps> Device<H> {
    /// The L1 nodes of a tree, head first.
    pub fn tree_nodes(&self, pipe: u8, mgid: Mgid) -> Vec<L1Handle> {
        let mut out = Vec::new();
        let mut cursor = self.trees.get(&(pipe, mgid)).map(|t| t.head);
        while let Some(h) = cursor {
            out.push(h);
            cursor = self.l1.get(h).and_then(|n| n.next);
        }
        out
    }

    /// Length of the longest L2 chain reachable from a tree.
    pub fn tree_len(&self, pipe: u8, mgid: Mgid) -> u32 {
        self.tree_nodes(pipe, mgid)
            .into_iter()
            .map(|h| match &self.l1[h].kind {
                L1Kind::Rid { chain, .. } => chain.len(),
                L1Kind::Ecmp { group, .. } => {
                    self.groups[*group].chain_len(pipe)
                }
            })
            .max()
            .unwrap_or(0)
    }

    fn tail_addr(&self, pipe: u8, mgid: Mgid) -> Option<RdmAddr> {
        self.trees
            .get(&(pipe, mgid))
            .and_then(|t| t.len.hw)
            .and_then(|size| self.tails.base(size))
    }

    /// The record an L1 node should hold, given its current neighbors.
    pub fn l1_record(&self, h: L1Handle) -> RdmRecord {
        let n = &self.l1[h];
        let next = match n.next {
            Some(next) => Some(self.l1[next].addr),
            None => self.tail_addr(n.pipe, n.mgid),
        };
        match &n.kind {
            L1Kind::Rid { node, xid, chain } => RdmRecord::L1Rid {
                next,
                rid: self.nodes[*node].rid,
                xid: *xid,
                l2: chain.head(),
            },
            L1Kind::Ecmp { group, xid } => RdmRecord::L1Ecmp {
                next,
                xid: *xid,
                vectors: self.groups[*group].vectors(n.pipe),
            },
        }
    }

    pub fn write_l1(&self, batch: &mut WriteBatch, h: L1Handle) {
        let record = self.l1_record(h);
        let n = &self.l1[h];
        self.rdm_write(batch, n.pipe, n.addr, record);
    }

    pub fn write_mit(&self, batch: &mut WriteBatch, pipe: u8, mgid: Mgid) {
        let head = self
            .trees
            .get(&(pipe, mgid))
            .map(|t| self.l1[t.head].addr);
        batch.push(
            self.subdev(pipe),
            McWrite::Mit {
                pipe: self.phys(pipe),
                mgid,
                head,
            },
        );
    }

    /// Link a new L1 node at the head of a tree.  Any chain it owns must
    /// already be staged.
    pub fn link_l1(
        &mut self,
        batch: &mut WriteBatch,
        pipe: u8,
        mgid: Mgid,
        addr: RdmAddr,
        kind: L1Kind,
    ) -> L1Handle {
        let old_head = self.trees.get(&(pipe, mgid)).map(|t| t.head);
        let h = self.l1.insert(L1Node {
            pipe,
            mgid,
            addr,
            prev: None,
            next: old_head,
            kind,
        });
        match old_head {
            Some(old) => {
                self.l1[old].prev = Some(h);
                if let Some(tree) = self.trees.get_mut(&(pipe, mgid)) {
                    tree.head = h;
                }
            }
            None => {
                self.trees.insert(
                    (pipe, mgid),
                    Tree {
                        head: h,
                        len: TreeLen::default(),
                    },
                );
            }
        }
        debug!(self.log, "link l1"; "pipe" => pipe, "mgid" => mgid,
            "addr" => addr);
        self.retail(batch, pipe, mgid, Some(h));
        self.write_l1(batch, h);
        self.write_mit(batch, pipe, mgid);
        h
    }

    /// Unlink an L1 node, deferring the free of its record and of any chain
    /// it owns.
    pub fn unlink_l1(
        &mut self,
        batch: &mut WriteBatch,
        h: L1Handle,
    ) -> McResult<L1Node> {
        let node = self.l1.remove(h).ok_or_else(|| {
            McError::Internal(format!("unlinking stale L1 node {h:?}"))
        })?;
        let (pipe, mgid) = (node.pipe, node.mgid);
        if let Some(next) = node.next {
            self.l1[next].prev = node.prev;
        }
        match node.prev {
            Some(prev) => {
                self.l1[prev].next = node.next;
                self.write_l1(batch, prev);
            }
            None => {
                match node.next {
                    Some(next) => {
                        if let Some(tree) = self.trees.get_mut(&(pipe, mgid)) {
                            tree.head = next;
                        }
                    }
                    None => {
                        self.trees.remove(&(pipe, mgid));
                    }
                }
                self.write_mit(batch, pipe, mgid);
            }
        }
        debug!(self.log, "unlink l1"; "pipe" => pipe, "mgid" => mgid,
            "addr" => node.addr);
        batch.free(pipe, node.addr);
        if let L1Kind::Rid { chain, .. } = &node.kind {
            batch.free_all(pipe, chain.addrs());
        }
        self.retail(batch, pipe, mgid, None);
        Ok(node)
    }

    /// Bring a tree's tail in line with its longest chain.  A larger tail is
    /// installed in this batch, ahead of whatever makes the tree longer; a
    /// smaller one waits for the batch to drain.  `fresh` is a node whose
    /// record the caller is about to write anyway.
    pub fn retail(
        &mut self,
        batch: &mut WriteBatch,
        pipe: u8,
        mgid: Mgid,
        fresh: Option<L1Handle>,
    ) {
        let sw = self.tree_len(pipe, mgid);
        let Some(tree) = self.trees.get(&(pipe, mgid)) else {
            return;
        };
        let current = tree.len.hw;
        let change = self.tails.change(current, sw);
        if let (_, true) = self.tails.pick(sw) {
            warn!(self.log, "tree longer than the largest tail";
                "pipe" => pipe, "mgid" => mgid, "len" => sw);
        }
        let Some(tree) = self.trees.get_mut(&(pipe, mgid)) else {
            return;
        };
        let before = tree.len.sw;
        tree.len.sw = sw;
        match change {
            TailChange::None => tree.len.pending = false,
            TailChange::Grow(size) => {
                tree.len.hw = size;
                tree.len.pending = false;
                let last = self.tree_nodes(pipe, mgid).last().copied();
                if let Some(last) = last {
                    if Some(last) != fresh {
                        self.write_l1(batch, last);
                    }
                }
            }
            TailChange::Shrink => {
                tree.len.pending = true;
                batch.shrink(pipe, mgid, before);
            }
        }
    }

    /// Install a smaller tail once an epoch has drained.  The tail still has
    /// to cover chains that later, undrained write lists replaced, so it only
    /// shrinks as far as the longest of those.  Called after the drained
    /// items have left the deferred queue.
    pub fn apply_shrink(&mut self, batch: &mut WriteBatch, pipe: u8, mgid: Mgid) {
        let sw = self.tree_len(pipe, mgid);
        let floor = self.deferred.shrink_floor(pipe, mgid);
        let safe = floor.map_or(sw, |f| f.max(sw));
        let Some(tree) = self.trees.get_mut(&(pipe, mgid)) else {
            return;
        };
        tree.len.sw = sw;
        let shrink = self.tails.change(tree.len.hw, safe) == TailChange::Shrink;
        if shrink {
            tree.len.hw = self.tails.pick(safe).0;
        }
        tree.len.pending = floor.is_some()
            && self.tails.change(tree.len.hw, sw) == TailChange::Shrink;
        if !shrink {
            return;
        }
        debug!(self.log, "shrinking tail"; "pipe" => pipe, "mgid" => mgid,
            "tail" => ?tree.len.hw, "covers" => safe);
        if let Some(last) = self.tree_nodes(pipe, mgid).last().copied() {
            self.write_l1(batch, last);
        }
    }

    pub fn tree_info(&self, pipe: u8, mgid: Mgid) -> TreeInfo {
        let Some(tree) = self.trees.get(&(pipe, mgid)) else {
            return TreeInfo::default();
        };
        let l1 = self
            .tree_nodes(pipe, mgid)
            .into_iter()
            .map(|h| {
                let n = &self.l1[h];
                match &n.kind {
                    L1Kind::Rid { node, xid, chain } => L1Info::Rid {
                        node: *node,
                        addr: n.addr,
                        rid: self.nodes[*node].rid,
                        xid: *xid,
                        chain_len: chain.len(),
                    },
                    L1Kind::Ecmp { group, xid } => L1Info::Ecmp {
                        group: *group,
                        addr: n.addr,
                        xid: *xid,
                    },
                }
            })
            .collect();
        TreeInfo {
            l1,
            len: tree.len.sw,
            tail: tree.len.hw,
            shrink_pending: tree.len.pending,
        }
    }
}
