// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! ECMP groups.
//!
//! A group holds up to 32 member nodes.  In every pipe one of its members
//! reaches, the group owns an L1-End block with one L1-End record per member
//! slot, and a pair of vector records naming the block and the mask of
//! members present in that pipe.  Every MGID the group is attached to has an
//! L1 ECMP node in each of those pipes, pointing at both vectors; the
//! dataplane uses the one selected by the device's table version.
//!
//! When a vector the dataplane is using has to change, the standby copy is
//! written first, the table version is flipped over to it, and the old copy
//! is only brought up to date once packets admitted under the old version
//! have drained.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Serialize;
use slog::{debug, info, warn};

use aal::{AsicOps, Mgid, RdmAddr, RdmRecord, Xid};

use crate::batch::WriteBatch;
use crate::chain::{L2Chain, L2Content};
use crate::config::MAX_ECMP_MEMBERS;
use crate::device::Device;
use crate::node::Attach;
use crate::rdm::{NodeType, Reservation};
use crate::tree::{L1Handle, L1Kind};
use crate::types::{McError, McResult};
use crate::{GroupHandle, NodeHandle};

#[derive(Debug)]
pub(crate) struct Member {
    pub node: NodeHandle,
    pub chains: BTreeMap<u8, L2Chain>,
}

#[derive(Debug)]
pub(crate) struct GroupPipe {
    /// Base of the L1-End block.
    pub block: RdmAddr,
    pub size: u8,
    /// The vector for table version `v` lives at `vectors + v`.
    pub vectors: RdmAddr,
    pub mask: u32,
    /// What each version's vector holds in hardware: block base and mask.
    pub hw: [(RdmAddr, u32); 2],
}

#[derive(Debug)]
pub(crate) struct GroupMgid {
    pub xid: Option<Xid>,
    pub l1: BTreeMap<u8, L1Handle>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EcmpState {
    Empty,
    SingleMember,
    MultiMember,
}

/// The kind of change most recently made to a group's membership.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EcmpTransition {
    AddFirstMember,
    AddMemberToHole,
    AddMemberToEnd,
    RemoveMember,
    /// Members changed content without joining or leaving.
    Refresh,
}

#[derive(Debug)]
pub(crate) struct EcmpGroup {
    pub ecmp_id: u16,
    pub members: Vec<Option<Member>>,
    pub valid_map: u32,
    pub allocated_sz: u8,
    pub pipes: BTreeMap<u8, GroupPipe>,
    pub mgids: BTreeMap<Mgid, GroupMgid>,
    pub last: Option<EcmpTransition>,
}

impl EcmpGroup {
    fn new(ecmp_id: u16) -> Self {
        EcmpGroup {
            ecmp_id,
            members: (0..MAX_ECMP_MEMBERS).map(|_| None).collect(),
            valid_map: 0,
            allocated_sz: 0,
            pipes: BTreeMap::new(),
            mgids: BTreeMap::new(),
            last: None,
        }
    }

    pub fn state(&self) -> EcmpState {
        match self.valid_map.count_ones() {
            0 => EcmpState::Empty,
            1 => EcmpState::SingleMember,
            _ => EcmpState::MultiMember,
        }
    }

    /// The longest chain of any member in a pipe.
    pub fn chain_len(&self, pipe: u8) -> u32 {
        self.members
            .iter()
            .flatten()
            .filter_map(|m| m.chains.get(&pipe).map(|c| c.len()))
            .max()
            .unwrap_or(0)
    }

    pub fn vectors(&self, pipe: u8) -> [RdmAddr; 2] {
        self.pipes
            .get(&pipe)
            .map(|gp| [gp.vectors, gp.vectors + 1])
            .unwrap_or_default()
    }

    /// Members with a chain in a pipe, as a slot mask.
    pub fn pipe_mask(&self, pipe: u8) -> u32 {
        self.members
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.as_ref().is_some_and(|m| m.chains.contains_key(&pipe))
            })
            .fold(0, |mask, (slot, _)| mask | (1 << slot))
    }

    pub fn slot_of(&self, node: NodeHandle) -> Option<u8> {
        self.members
            .iter()
            .position(|m| m.as_ref().is_some_and(|m| m.node == node))
            .map(|slot| slot as u8)
    }
}

/// The layout of a group in one pipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupPipeInfo {
    pub base: RdmAddr,
    pub size: u8,
    pub mask: u32,
    pub vectors: [RdmAddr; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub ecmp_id: u16,
    pub state: EcmpState,
    pub valid_map: u32,
    pub allocated_sz: u8,
    pub members: Vec<(u8, NodeHandle)>,
    pub pipes: BTreeMap<u8, GroupPipeInfo>,
    pub mgids: Vec<Mgid>,
    pub last_transition: Option<EcmpTransition>,
}

/// A member slot whose content is changing.
#[derive(Debug)]
pub(crate) struct SlotChange {
    pub slot: u8,
    /// The node in the slot afterwards; `None` empties it.
    pub node: Option<NodeHandle>,
    /// New chains for pipes the member joins or whose content changes.
    pub chains: BTreeMap<u8, L2Chain>,
    /// Pipes the member leaves.
    pub leaving: Vec<u8>,
}

#[derive(Debug)]
pub(crate) enum PipePlan {
    /// The group reaches this pipe for the first time.
    New {
        block: RdmAddr,
        vectors: RdmAddr,
        size: u8,
        mask: u32,
        /// An L1 ECMP node for every MGID the group is attached to.
        l1: Vec<(Mgid, RdmAddr)>,
    },
    /// The block is too small for the new mask and is replaced.
    Regrow { block: RdmAddr, size: u8, mask: u32 },
    /// The block is reused; some slots are rewritten.
    InPlace { mask: u32 },
    /// No member reaches this pipe anymore.
    Drop,
}

#[derive(Debug)]
pub(crate) struct GroupPlan {
    pub group: GroupHandle,
    pub slots: Vec<SlotChange>,
    pub valid_map: u32,
    pub size: u8,
    pub pipes: BTreeMap<u8, PipePlan>,
    pub transition: EcmpTransition,
}

impl GroupPlan {
    pub fn reserve(&mut self, res: &mut Reservation) -> McResult<()> {
        for (pipe, plan) in self.pipes.iter_mut() {
            match plan {
                PipePlan::New {
                    block,
                    vectors,
                    size,
                    l1,
                    ..
                } => {
                    *block = res.take(*pipe, NodeType::L1End, *size as u32)?;
                    *vectors = res.take(*pipe, NodeType::Vector, 2)?;
                    for (_, addr) in l1.iter_mut() {
                        *addr = res.take(*pipe, NodeType::L1Ecmp, 1)?;
                    }
                }
                PipePlan::Regrow { block, size, .. } => {
                    *block = res.take(*pipe, NodeType::L1End, *size as u32)?;
                }
                PipePlan::InPlace { .. } | PipePlan::Drop => {}
            }
        }
        for change in self.slots.iter_mut() {
            for (pipe, chain) in change.chains.iter_mut() {
                chain.reserve(res, *pipe)?;
            }
        }
        Ok(())
    }
}

fn mask_size(mask: u32) -> u8 {
    (32 - mask.leading_zeros()) as u8
}

impl<H: AsicOps> Device<H> {
    pub fn group(&self, group: GroupHandle) -> McResult<&EcmpGroup> {
        self.groups.get(group).ok_or_else(|| {
            McError::Missing(format!("no such group: {group:?}"))
        })
    }

    pub fn group_create(&mut self) -> McResult<GroupHandle> {
        let ecmp_id = self.ecmp_ids.alloc(1)? as u16;
        let group = self.groups.insert(EcmpGroup::new(ecmp_id));
        info!(self.log, "created ecmp group";
            "group" => ?group, "ecmp_id" => ecmp_id);
        Ok(group)
    }

    pub fn group_destroy(&mut self, group: GroupHandle) -> McResult<()> {
        let g = self.group(group)?;
        if g.valid_map != 0 {
            return Err(McError::Invalid(format!(
                "group {group:?} still has members"
            )));
        }
        if !g.mgids.is_empty() {
            return Err(McError::Invalid(format!(
                "group {group:?} is still attached to mgids"
            )));
        }
        let ecmp_id = g.ecmp_id;
        self.groups.remove(group);
        self.ecmp_ids.free(ecmp_id as u32, 1);
        info!(self.log, "destroyed ecmp group";
            "group" => ?group, "ecmp_id" => ecmp_id);
        Ok(())
    }

    pub fn group_info(&self, group: GroupHandle) -> McResult<GroupInfo> {
        let g = self.group(group)?;
        Ok(GroupInfo {
            ecmp_id: g.ecmp_id,
            state: g.state(),
            valid_map: g.valid_map,
            allocated_sz: g.allocated_sz,
            members: g
                .members
                .iter()
                .enumerate()
                .filter_map(|(slot, m)| {
                    m.as_ref().map(|m| (slot as u8, m.node))
                })
                .collect(),
            pipes: g
                .pipes
                .iter()
                .map(|(pipe, gp)| {
                    (
                        *pipe,
                        GroupPipeInfo {
                            base: gp.block,
                            size: gp.size,
                            mask: gp.mask,
                            vectors: [gp.vectors, gp.vectors + 1],
                        },
                    )
                })
                .collect(),
            mgids: g.mgids.keys().copied().collect(),
            last_transition: g.last,
        })
    }

    /// Plan a change to some of a group's member slots.  Each change names
    /// the slot, the node that will occupy it, and that node's chain content
    /// in every pipe it reaches.
    pub fn plan_group(
        &self,
        group: GroupHandle,
        changes: Vec<(u8, Option<NodeHandle>, BTreeMap<u8, Vec<L2Content>>)>,
    ) -> McResult<GroupPlan> {
        let g = self.group(group)?;
        let mut valid_map = g.valid_map;
        let mut adding = false;
        let mut removing = false;

        // Pipes each occupied slot reaches once the changes are made.
        let mut reach: BTreeMap<u8, BTreeSet<u8>> = BTreeMap::new();
        for (slot, m) in g.members.iter().enumerate() {
            if let Some(m) = m {
                reach.insert(slot as u8, m.chains.keys().copied().collect());
            }
        }

        let mut slots = Vec::new();
        for (slot, node, wanted) in changes {
            let current: BTreeMap<u8, Vec<L2Content>> = g
                .members
                .get(slot as usize)
                .and_then(|m| m.as_ref())
                .map(|m| {
                    m.chains.iter().map(|(p, c)| (*p, c.contents())).collect()
                })
                .unwrap_or_default();
            let mut chains = BTreeMap::new();
            let mut leaving = Vec::new();
            for (pipe, old) in &current {
                match wanted.get(pipe) {
                    None => leaving.push(*pipe),
                    Some(new) if new != old => {
                        chains.insert(*pipe, L2Chain::planned(new.clone()));
                    }
                    Some(_) => {}
                }
            }
            for (pipe, new) in &wanted {
                if !current.contains_key(pipe) {
                    chains.insert(*pipe, L2Chain::planned(new.clone()));
                }
            }
            match node {
                Some(_) => {
                    if valid_map & (1 << slot) == 0 {
                        adding = true;
                    }
                    valid_map |= 1 << slot;
                    reach.insert(slot, wanted.keys().copied().collect());
                }
                None => {
                    removing = true;
                    valid_map &= !(1 << slot);
                    reach.remove(&slot);
                }
            }
            slots.push(SlotChange {
                slot,
                node,
                chains,
                leaving,
            });
        }

        let size = mask_size(valid_map);
        let mut all_pipes: BTreeSet<u8> = g.pipes.keys().copied().collect();
        reach.values().for_each(|p| all_pipes.extend(p));

        let mut pipes = BTreeMap::new();
        for pipe in all_pipes {
            let mask = reach
                .iter()
                .filter(|(_, p)| p.contains(&pipe))
                .fold(0u32, |mask, (slot, _)| mask | (1 << *slot));
            let touched = slots.iter().any(|s| {
                s.chains.contains_key(&pipe) || s.leaving.contains(&pipe)
            });
            let plan = match g.pipes.get(&pipe) {
                None if mask == 0 => continue,
                None => PipePlan::New {
                    block: 0,
                    vectors: 0,
                    size,
                    mask,
                    l1: g.mgids.keys().map(|m| (*m, 0)).collect(),
                },
                Some(_) if mask == 0 => PipePlan::Drop,
                Some(gp) if mask_size(mask) > gp.size => PipePlan::Regrow {
                    block: 0,
                    size,
                    mask,
                },
                Some(gp) if mask != gp.mask || touched || gp.size > size => {
                    PipePlan::InPlace { mask }
                }
                Some(_) => continue,
            };
            pipes.insert(pipe, plan);
        }

        let grows = pipes.values().any(|p| {
            matches!(p, PipePlan::New { .. } | PipePlan::Regrow { .. })
        });
        let transition = if adding && g.valid_map == 0 {
            EcmpTransition::AddFirstMember
        } else if adding && grows {
            EcmpTransition::AddMemberToEnd
        } else if adding {
            EcmpTransition::AddMemberToHole
        } else if removing {
            EcmpTransition::RemoveMember
        } else {
            EcmpTransition::Refresh
        };

        Ok(GroupPlan {
            group,
            slots,
            valid_map,
            size,
            pipes,
            transition,
        })
    }

    fn write_l1_end(
        &self,
        batch: &mut WriteBatch,
        group: GroupHandle,
        pipe: u8,
        slot: u8,
    ) {
        let g = &self.groups[group];
        let (Some(gp), Some(Some(m))) =
            (g.pipes.get(&pipe), g.members.get(slot as usize))
        else {
            return;
        };
        let Some(chain) = m.chains.get(&pipe) else {
            return;
        };
        let record = RdmRecord::L1End {
            rid: self.nodes[m.node].rid,
            l2: chain.head(),
        };
        self.rdm_write(batch, pipe, gp.block + slot as RdmAddr, record);
    }

    /// Stage every loaded slot of a group's block in one pipe.
    fn write_block(&self, batch: &mut WriteBatch, group: GroupHandle, pipe: u8) {
        let mask = self.groups[group].pipe_mask(pipe);
        for slot in 0..MAX_ECMP_MEMBERS {
            if mask & (1 << slot) != 0 {
                self.write_l1_end(batch, group, pipe, slot);
            }
        }
    }

    fn write_vector(
        &mut self,
        batch: &mut WriteBatch,
        group: GroupHandle,
        pipe: u8,
        version: u8,
    ) {
        let Some(gp) = self.groups[group].pipes.get_mut(&pipe) else {
            return;
        };
        gp.hw[version as usize] = (gp.block, gp.mask);
        let addr = gp.vectors + version as RdmAddr;
        let record = RdmRecord::Vector {
            base: gp.block,
            mask: gp.mask,
        };
        self.rdm_write(batch, pipe, addr, record);
    }

    /// Carry out a reserved group plan.  Returns the pipes whose vectors
    /// have to be cut over to the new block or mask.
    pub fn apply_group(
        &mut self,
        batch: &mut WriteBatch,
        plan: GroupPlan,
    ) -> McResult<Vec<(GroupHandle, u8)>> {
        let GroupPlan {
            group,
            slots,
            valid_map,
            size,
            pipes,
            transition,
        } = plan;

        // Slots to rewrite in place, by pipe
        let mut rewrite: BTreeMap<u8, Vec<u8>> = BTreeMap::new();

        // Bring the members' chains up to date.  Anything replaced stays
        // allocated until the whole update has drained.
        for change in slots {
            let SlotChange {
                slot,
                node,
                chains,
                leaving,
            } = change;
            for (pipe, chain) in &chains {
                self.write_chain(batch, *pipe, chain);
                rewrite.entry(*pipe).or_default().push(slot);
            }
            let entry = &mut self.groups[group].members[slot as usize];
            match node {
                Some(node) => {
                    let m = entry.get_or_insert_with(|| Member {
                        node,
                        chains: BTreeMap::new(),
                    });
                    for (pipe, chain) in chains {
                        if let Some(old) = m.chains.insert(pipe, chain) {
                            batch.free_all(pipe, old.addrs());
                        }
                    }
                    for pipe in leaving {
                        if let Some(old) = m.chains.remove(&pipe) {
                            batch.free_all(pipe, old.addrs());
                        }
                    }
                    self.nodes[node].attach = Some(Attach::Group { group, slot });
                }
                None => {
                    if let Some(m) = entry.take() {
                        for (pipe, old) in m.chains {
                            batch.free_all(pipe, old.addrs());
                        }
                        if let Some(n) = self.nodes.get_mut(m.node) {
                            n.attach = None;
                        }
                    }
                }
            }
        }
        let g = &mut self.groups[group];
        g.valid_map = valid_map;
        g.allocated_sz = size;
        g.last = Some(transition);
        let mgids: Vec<Mgid> = g.mgids.keys().copied().collect();
        debug!(self.log, "ecmp update"; "group" => ?group,
            "transition" => %transition, "valid_map" => valid_map,
            "size" => size);

        // Longer chains mean longer trees: grow tails before any of the new
        // content can be reached.
        for (pipe, plan) in &pipes {
            if matches!(plan, PipePlan::InPlace { .. } | PipePlan::Regrow { .. })
            {
                for mgid in &mgids {
                    self.retail(batch, *pipe, *mgid, None);
                }
            }
        }

        let mut cutover = Vec::new();
        let mut reach_changed = false;
        for (pipe, plan) in pipes {
            match plan {
                PipePlan::New {
                    block,
                    vectors,
                    size,
                    mask,
                    l1,
                } => {
                    self.groups[group].pipes.insert(
                        pipe,
                        GroupPipe {
                            block,
                            size,
                            vectors,
                            mask,
                            hw: [(0, 0); 2],
                        },
                    );
                    self.write_block(batch, group, pipe);
                    self.write_vector(batch, group, pipe, 0);
                    self.write_vector(batch, group, pipe, 1);
                    for (mgid, addr) in l1 {
                        let xid = self.groups[group]
                            .mgids
                            .get(&mgid)
                            .and_then(|m| m.xid);
                        let h = self.link_l1(
                            batch,
                            pipe,
                            mgid,
                            addr,
                            L1Kind::Ecmp { group, xid },
                        );
                        if let Some(m) = self.groups[group].mgids.get_mut(&mgid) {
                            m.l1.insert(pipe, h);
                        }
                    }
                    reach_changed = true;
                }
                PipePlan::Regrow { block, size, mask } => {
                    let Some(gp) = self.groups[group].pipes.get_mut(&pipe) else {
                        continue;
                    };
                    let old = gp.block;
                    gp.block = block;
                    gp.size = size;
                    gp.mask = mask;
                    batch.free(pipe, old);
                    self.write_block(batch, group, pipe);
                    cutover.push((group, pipe));
                }
                PipePlan::InPlace { mask } => {
                    for slot in rewrite.get(&pipe).into_iter().flatten() {
                        self.write_l1_end(batch, group, pipe, *slot);
                    }
                    let Some(gp) = self.groups[group].pipes.get_mut(&pipe) else {
                        continue;
                    };
                    gp.mask = mask;
                    if gp.size > size {
                        if let Some(rest) =
                            self.rdm.split(pipe, gp.block, size as u32)?
                        {
                            batch.free(pipe, rest);
                        }
                        gp.size = size;
                    }
                    if gp.hw != [(gp.block, gp.mask); 2] {
                        cutover.push((group, pipe));
                    }
                }
                PipePlan::Drop => {
                    for mgid in &mgids {
                        let h = self.groups[group]
                            .mgids
                            .get_mut(mgid)
                            .and_then(|m| m.l1.remove(&pipe));
                        if let Some(h) = h {
                            self.unlink_l1(batch, h)?;
                        }
                    }
                    if let Some(gp) = self.groups[group].pipes.remove(&pipe) {
                        batch.free(pipe, gp.block);
                        batch.free(pipe, gp.vectors);
                    }
                    reach_changed = true;
                }
            }
        }
        if reach_changed {
            for mgid in mgids {
                self.sync_vectors(batch, mgid);
            }
        }
        Ok(cutover)
    }

    /// Poll the drain counter of a table version until it empties.  Gives up
    /// after the configured number of polls.
    fn wait_for_drain(&self, version: u8) {
        for _ in 0..self.config.drain_retry_limit {
            match self.hdl.version_counter(self.dev, version) {
                Ok(0) => return,
                Ok(_) => std::thread::sleep(self.config.drain_poll_interval()),
                Err(e) => {
                    warn!(self.log, "failed to read version counter";
                        "version" => version, "error" => %e);
                }
            }
        }
        warn!(self.log, "table version failed to drain; proceeding";
            "version" => version,
            "polls" => self.config.drain_retry_limit);
    }

    /// Push a batch, then move the named vectors over to their groups' new
    /// block and mask without letting the dataplane see a half-built block.
    pub fn cutover(
        &mut self,
        mut batch: WriteBatch,
        changes: Vec<(GroupHandle, u8)>,
        ctx: &str,
    ) -> McResult<()> {
        let mut live = Vec::new();
        for (group, pipe) in changes {
            if self.groups[group].mgids.is_empty() {
                // Nothing can be walking these vectors.
                self.write_vector(&mut batch, group, pipe, 0);
                self.write_vector(&mut batch, group, pipe, 1);
            } else {
                live.push((group, pipe));
            }
        }
        if live.is_empty() {
            return self.commit(batch, ctx);
        }

        let active = self.version;
        let standby = active ^ 1;
        let mut finish = WriteBatch::new();
        batch.hand_off(&mut finish);
        for (group, pipe) in &live {
            self.write_vector(&mut batch, *group, *pipe, standby);
        }
        self.commit(batch, ctx)?;

        if let Err(e) = self.hdl.table_version_flip(self.dev, standby) {
            // The old blocks are still what the dataplane reaches.
            self.leak(&finish.deferred, &e);
            return Err(McError::hw_after_mutation(ctx, e));
        }
        self.version = standby;
        info!(self.log, "flipped table version";
            "version" => standby, "vectors" => live.len());
        self.wait_for_drain(active);

        for (group, pipe) in &live {
            self.write_vector(&mut finish, *group, *pipe, active);
        }
        self.commit(finish, ctx)
    }

    fn reserve_group(&mut self, plan: &mut GroupPlan) -> McResult<()> {
        let mut res = Reservation::new(&mut self.rdm);
        plan.reserve(&mut res)?;
        res.commit();
        Ok(())
    }

    pub fn group_add_member(
        &mut self,
        group: GroupHandle,
        node: NodeHandle,
    ) -> McResult<()> {
        let g = self.group(group)?;
        let n = self.node(node)?;
        if let Some(attach) = &n.attach {
            return Err(McError::Exists(format!(
                "node {node:?} is already attached: {attach:?}"
            )));
        }
        let slot = (0..g.allocated_sz)
            .find(|s| g.valid_map & (1 << s) == 0)
            .unwrap_or(g.allocated_sz);
        if slot >= MAX_ECMP_MEMBERS {
            return Err(McError::NoResources(format!(
                "group {group:?} already has {MAX_ECMP_MEMBERS} members"
            )));
        }
        let contents = self.chain_contents(&n.ports, &n.lags);
        let mut plan =
            self.plan_group(group, vec![(slot, Some(node), contents)])?;
        self.reserve_group(&mut plan)?;

        let transition = plan.transition;
        let mut batch = WriteBatch::new();
        let changes = self.apply_group(&mut batch, plan)?;
        info!(self.log, "added ecmp member"; "group" => ?group,
            "node" => ?node, "slot" => slot, "transition" => %transition);
        self.cutover(batch, changes, "ecmp add member")
    }

    pub fn group_remove_member(
        &mut self,
        group: GroupHandle,
        node: NodeHandle,
    ) -> McResult<()> {
        let g = self.group(group)?;
        let slot = match &self.node(node)?.attach {
            Some(Attach::Group { group: ng, slot })
                if *ng == group && g.slot_of(node) == Some(*slot) =>
            {
                *slot
            }
            _ => {
                return Err(McError::Missing(format!(
                    "node {node:?} is not a member of group {group:?}"
                )))
            }
        };
        let mut plan =
            self.plan_group(group, vec![(slot, None, BTreeMap::new())])?;
        self.reserve_group(&mut plan)?;
        let mut batch = WriteBatch::new();
        let changes = self.apply_group(&mut batch, plan)?;
        info!(self.log, "removed ecmp member"; "group" => ?group,
            "node" => ?node, "slot" => slot);
        self.cutover(batch, changes, "ecmp remove member")
    }

    pub fn mgid_attach_group(
        &mut self,
        mgid: Mgid,
        group: GroupHandle,
        xid: Option<Xid>,
    ) -> McResult<()> {
        self.check_mgid(mgid)?;
        let g = self.group(group)?;
        if g.mgids.contains_key(&mgid) {
            return Err(McError::Exists(format!(
                "group {group:?} is already attached to mgid {mgid}"
            )));
        }
        let pipes: Vec<u8> = g.pipes.keys().copied().collect();
        let mut addrs = Vec::with_capacity(pipes.len());
        {
            let mut res = Reservation::new(&mut self.rdm);
            for pipe in &pipes {
                addrs.push((*pipe, res.take(*pipe, NodeType::L1Ecmp, 1)?));
            }
            res.commit();
        }

        let mut batch = WriteBatch::new();
        self.groups[group].mgids.insert(
            mgid,
            GroupMgid {
                xid,
                l1: BTreeMap::new(),
            },
        );
        for (pipe, addr) in addrs {
            let h = self.link_l1(
                &mut batch,
                pipe,
                mgid,
                addr,
                L1Kind::Ecmp { group, xid },
            );
            if let Some(m) = self.groups[group].mgids.get_mut(&mgid) {
                m.l1.insert(pipe, h);
            }
        }
        self.sync_vectors(&mut batch, mgid);
        info!(self.log, "attached ecmp group"; "mgid" => mgid,
            "group" => ?group, "pipes" => pipes.len());
        self.commit(batch, "mgid attach group")
    }

    pub fn mgid_detach_group(
        &mut self,
        mgid: Mgid,
        group: GroupHandle,
    ) -> McResult<()> {
        self.check_mgid(mgid)?;
        self.group(group)?;
        let Some(gm) = self.groups[group].mgids.remove(&mgid) else {
            return Err(McError::Missing(format!(
                "group {group:?} is not attached to mgid {mgid}"
            )));
        };
        let mut batch = WriteBatch::new();
        for h in gm.l1.into_values() {
            self.unlink_l1(&mut batch, h)?;
        }
        self.sync_vectors(&mut batch, mgid);
        info!(self.log, "detached ecmp group"; "mgid" => mgid,
            "group" => ?group);
        self.commit(batch, "mgid detach group")
    }
}
