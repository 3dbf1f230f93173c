// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Consistency checks across the software model, and rebuilding the
//! hardware tables that are derived from it.

use std::collections::BTreeSet;

use slog::{error, info};

use aal::{AsicOps, McWrite, Mgid, RdmAddr};

use crate::batch::WriteBatch;
use crate::chain::L2Content;
use crate::device::Device;
use crate::node::Attach;
use crate::rdm::NodeType;
use crate::tail::TailChange;
use crate::tree::{L1Handle, L1Kind};
use crate::types::{McError, McResult};

impl<H: AsicOps> Device<H> {
    fn check_block(
        &self,
        problems: &mut Vec<String>,
        pipe: u8,
        addr: RdmAddr,
        ty: NodeType,
        count: u32,
    ) {
        match self.rdm.block(pipe, addr) {
            Some(found) if found == (ty, count) => {}
            found => problems.push(format!(
                "pipe {pipe} addr {addr:#x}: expected {count} {ty}, \
                 allocator has {found:?}"
            )),
        }
    }

    fn audit_tree(
        &self,
        problems: &mut Vec<String>,
        pipe: u8,
        mgid: Mgid,
        listed: &mut BTreeSet<L1Handle>,
    ) {
        let here = format!("mgid {mgid} pipe {pipe}");
        let mut prev = None;
        for h in self.tree_nodes(pipe, mgid) {
            let Some(n) = self.l1.get(h) else {
                problems.push(format!("{here}: stale L1 handle {h:?}"));
                return;
            };
            if !listed.insert(h) {
                problems.push(format!("{here}: L1 {h:?} listed twice"));
                return;
            }
            if n.prev != prev {
                problems.push(format!("{here}: L1 {h:?} has a bad back link"));
            }
            if (n.pipe, n.mgid) != (pipe, mgid) {
                problems.push(format!(
                    "{here}: L1 {h:?} belongs to mgid {} pipe {}",
                    n.mgid, n.pipe
                ));
            }
            match &n.kind {
                L1Kind::Rid { node, chain, .. } => {
                    self.check_block(problems, pipe, n.addr, NodeType::L1Rid, 1);
                    for (addr, content) in &chain.entries {
                        let ty = match content {
                            L2Content::Port(_) => NodeType::Port,
                            L2Content::Lag(_) => NodeType::Lag,
                        };
                        self.check_block(problems, pipe, *addr, ty, 1);
                    }
                    let owned = match self.nodes.get(*node).map(|n| &n.attach) {
                        Some(Some(Attach::Mgid { mgid: m, l1, .. })) => {
                            *m == mgid && l1.get(&pipe) == Some(&h)
                        }
                        _ => false,
                    };
                    if !owned {
                        problems.push(format!(
                            "{here}: node {node:?} doesn't own L1 {h:?}"
                        ));
                    }
                }
                L1Kind::Ecmp { group, .. } => {
                    self.check_block(problems, pipe, n.addr, NodeType::L1Ecmp, 1);
                    let owned = self
                        .groups
                        .get(*group)
                        .and_then(|g| g.mgids.get(&mgid))
                        .is_some_and(|m| m.l1.get(&pipe) == Some(&h));
                    if !owned {
                        problems.push(format!(
                            "{here}: group {group:?} doesn't own L1 {h:?}"
                        ));
                    }
                }
            }
            prev = Some(h);
        }

        let Some(tree) = self.trees.get(&(pipe, mgid)) else {
            return;
        };
        let len = self.tree_len(pipe, mgid);
        if tree.len.sw != len {
            problems.push(format!(
                "{here}: tree length {} recorded, {len} found",
                tree.len.sw
            ));
        }
        let expected = self.tails.pick(len).0;
        let ok = match self.tails.change(tree.len.hw, len) {
            TailChange::None => true,
            TailChange::Shrink => tree.len.pending,
            TailChange::Grow(_) => false,
        };
        if !ok {
            problems.push(format!(
                "{here}: tail {:?} in use, {expected:?} wanted",
                tree.len.hw
            ));
        }
        if self.pvt.get(mgid) & (1 << self.phys(pipe)) == 0 {
            problems.push(format!("{here}: pipe missing from the pvt"));
        }
    }

    fn audit_groups(&self, problems: &mut Vec<String>) {
        for (group, g) in self.groups.iter() {
            let here = format!("group {group:?}");
            for (slot, m) in g.members.iter().enumerate() {
                let valid = g.valid_map & (1 << slot) != 0;
                if valid != m.is_some() {
                    problems.push(format!(
                        "{here}: slot {slot} validity doesn't match"
                    ));
                }
                let Some(m) = m else {
                    continue;
                };
                let attached = matches!(
                    self.nodes.get(m.node).and_then(|n| n.attach.as_ref()),
                    Some(Attach::Group { group: ng, slot: s })
                        if *ng == group && *s as usize == slot
                );
                if !attached {
                    problems.push(format!(
                        "{here}: member {:?} doesn't point back at slot {slot}",
                        m.node
                    ));
                }
            }
            let size = (32 - g.valid_map.leading_zeros()) as u8;
            if g.allocated_sz != size {
                problems.push(format!(
                    "{here}: allocated size {} for valid map {:#x}",
                    g.allocated_sz, g.valid_map
                ));
            }

            let reached: BTreeSet<u8> = self
                .pipes
                .keys()
                .copied()
                .filter(|p| g.pipe_mask(*p) != 0)
                .collect();
            let laid_out: BTreeSet<u8> = g.pipes.keys().copied().collect();
            if reached != laid_out {
                problems.push(format!(
                    "{here}: members reach pipes {reached:?}, blocks in \
                     {laid_out:?}"
                ));
            }
            for (pipe, gp) in &g.pipes {
                if gp.mask != g.pipe_mask(*pipe) {
                    problems.push(format!("{here} pipe {pipe}: stale mask"));
                }
                if (32 - gp.mask.leading_zeros()) as u8 > gp.size {
                    problems.push(format!(
                        "{here} pipe {pipe}: block too small for its mask"
                    ));
                }
                if gp.hw != [(gp.block, gp.mask); 2] {
                    problems.push(format!(
                        "{here} pipe {pipe}: vectors disagree: {:?}",
                        gp.hw
                    ));
                }
                self.check_block(
                    problems,
                    *pipe,
                    gp.block,
                    NodeType::L1End,
                    gp.size as u32,
                );
                self.check_block(problems, *pipe, gp.vectors, NodeType::Vector, 2);
            }
            for (mgid, gm) in &g.mgids {
                let pipes: BTreeSet<u8> = gm.l1.keys().copied().collect();
                if pipes != laid_out {
                    problems.push(format!(
                        "{here} mgid {mgid}: L1 nodes in {pipes:?}"
                    ));
                }
            }
        }
    }

    /// Cross-check the tree lists, groups, tails, vector shadows and the
    /// allocator against each other.
    pub fn audit(&self) -> McResult<()> {
        let mut problems = Vec::new();
        let mut listed = BTreeSet::new();
        for (pipe, mgid) in self.trees.keys().copied() {
            self.audit_tree(&mut problems, pipe, mgid, &mut listed);
        }
        for (h, n) in self.l1.iter() {
            if !listed.contains(&h) {
                problems.push(format!(
                    "L1 {h:?} (mgid {} pipe {}) isn't in its tree",
                    n.mgid, n.pipe
                ));
            }
        }
        self.audit_groups(&mut problems);
        if self.tvt.is_some() {
            let mgids: BTreeSet<Mgid> =
                self.trees.keys().map(|(_, mgid)| *mgid).collect();
            for mgid in mgids {
                let needed = self.derived_tvt(self.pvt.get(mgid));
                let have = self.tvt.as_ref().map(|t| t.get(mgid)).unwrap_or(0);
                if have & needed != needed {
                    problems.push(format!("mgid {mgid}: dies missing from tvt"));
                }
            }
        }

        if problems.is_empty() {
            return Ok(());
        }
        for p in &problems {
            error!(self.log, "audit: {p}");
        }
        Err(McError::Internal(format!(
            "{} inconsistencies: {}",
            problems.len(),
            problems.join("; ")
        )))
    }

    /// Recompute the vector shadows from the trees and rewrite every table
    /// the hardware derives from the software model.  ECMP vectors left
    /// disagreeing by a failed version flip are cut over again.
    pub fn rebuild_shadows(&mut self) -> McResult<()> {
        // Put back if the rewrite doesn't reach the device.
        let saved = (self.pvt.clone(), self.tvt.clone());
        self.pvt.clear();
        if let Some(tvt) = self.tvt.as_mut() {
            tvt.clear();
        }
        let mgids: BTreeSet<Mgid> = std::iter::once(0)
            .chain(self.trees.keys().map(|(_, mgid)| *mgid))
            .collect();
        for mgid in &mgids {
            let pvt = self.derived_pvt(*mgid);
            let tvt = self.derived_tvt(pvt) | if *mgid == 0 { 1 } else { 0 };
            self.pvt.set(*mgid, pvt);
            if let Some(t) = self.tvt.as_mut() {
                t.set(*mgid, tvt);
            }
        }

        let mut batch = WriteBatch::new();
        for row in 0..self.pvt.row_count() {
            let value = self.pvt.row(row).unwrap_or(0);
            self.write_all_subdevs(&mut batch, McWrite::PvtRow { row, value });
        }
        if let Some(tvt) = &self.tvt {
            for row in 0..tvt.row_count() {
                let value = tvt.row(row).unwrap_or(0);
                self.write_all_subdevs(
                    &mut batch,
                    McWrite::TvtRow { row, value },
                );
            }
        }
        for (pipe, mgid) in self.trees.keys() {
            self.write_mit(&mut batch, *pipe, *mgid);
        }
        for (lag_id, ports) in &self.lags {
            self.write_all_subdevs(
                &mut batch,
                McWrite::Lit {
                    lag_id: *lag_id,
                    ports: *ports,
                },
            );
        }
        for (port, backup) in &self.backups {
            self.write_all_subdevs(
                &mut batch,
                McWrite::Pmt {
                    port: *port,
                    backup: Some(*backup),
                },
            );
        }
        let writes = batch.writes.len();
        if let Err(e) = self.flush(batch) {
            (self.pvt, self.tvt) = saved;
            return Err(e.into());
        }
        info!(self.log, "rebuilt shadows";
            "mgids" => mgids.len(), "writes" => writes);

        let mut stale = Vec::new();
        for (group, g) in self.groups.iter() {
            for (pipe, gp) in &g.pipes {
                if gp.hw != [(gp.block, gp.mask); 2] {
                    stale.push((group, *pipe));
                }
            }
        }
        if !stale.is_empty() {
            info!(self.log, "finishing interrupted cutovers";
                "vectors" => stale.len());
            self.cutover(WriteBatch::new(), stale, "rebuild")?;
        }
        Ok(())
    }
}
