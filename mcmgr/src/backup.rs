// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Content changes that ripple through existing trees: port protection
//! (backup port) changes, LAG membership changes and node updates.
//!
//! Each works the same way.  The shadow the chain contents are computed from
//! is changed, every node it affects is re-planned, everything the new
//! chains need is reserved at once, and only then is anything written.  If
//! the reservation comes up short, the shadow is put back and nothing else
//! has changed.

use std::collections::BTreeMap;

use slog::info;

use aal::{AsicOps, DevPort, LagId, McWrite, PortBitmap};

use crate::batch::WriteBatch;
use crate::chain::L2Content;
use crate::device::Device;
use crate::ecmp::GroupPlan;
use crate::node::{Attach, NodePlan};
use crate::rdm::Reservation;
use crate::types::{McError, McResult};
use crate::{GroupHandle, NodeHandle};

#[derive(Debug, Default)]
pub(crate) struct RefreshPlan {
    pub nodes: Vec<NodePlan>,
    pub groups: Vec<GroupPlan>,
}

impl<H: AsicOps> Device<H> {
    /// Plan bringing every listed node's trees or group slots in line with
    /// its current content.
    pub fn plan_refresh(&self, nodes: &[NodeHandle]) -> McResult<RefreshPlan> {
        let mut plan = RefreshPlan::default();
        type SlotChanges =
            Vec<(u8, Option<NodeHandle>, BTreeMap<u8, Vec<L2Content>>)>;
        let mut groups: BTreeMap<GroupHandle, SlotChanges> = BTreeMap::new();
        for node in nodes {
            let n = self.node(*node)?;
            match &n.attach {
                Some(Attach::Mgid { .. }) => {
                    if let Some(np) = self.plan_node(*node, false)? {
                        if !np.pipes.is_empty() {
                            plan.nodes.push(np);
                        }
                    }
                }
                Some(Attach::Group { group, slot }) => {
                    let contents = self.chain_contents(&n.ports, &n.lags);
                    groups.entry(*group).or_default().push((
                        *slot,
                        Some(*node),
                        contents,
                    ));
                }
                None => {}
            }
        }
        for (group, changes) in groups {
            plan.groups.push(self.plan_group(group, changes)?);
        }
        Ok(plan)
    }

    pub fn reserve_refresh(&mut self, plan: &mut RefreshPlan) -> McResult<()> {
        let mut res = Reservation::new(&mut self.rdm);
        for np in plan.nodes.iter_mut() {
            np.reserve(&mut res)?;
        }
        for gp in plan.groups.iter_mut() {
            gp.reserve(&mut res)?;
        }
        res.commit();
        Ok(())
    }

    /// Carry out a reserved refresh.  `trailer` is written to every
    /// subdevice once the new structures are in place.
    pub fn apply_refresh_with(
        &mut self,
        mut batch: WriteBatch,
        plan: RefreshPlan,
        trailer: Option<McWrite>,
        ctx: &str,
    ) -> McResult<()> {
        let RefreshPlan { nodes, groups } = plan;
        for np in nodes {
            self.apply_node(&mut batch, np)?;
        }
        let mut cutover = Vec::new();
        for gp in groups {
            cutover.extend(self.apply_group(&mut batch, gp)?);
        }
        if let Some(write) = trailer {
            self.write_all_subdevs(&mut batch, write);
        }
        self.cutover(batch, cutover, ctx)
    }

    pub fn apply_refresh(
        &mut self,
        batch: WriteBatch,
        plan: RefreshPlan,
        ctx: &str,
    ) -> McResult<()> {
        self.apply_refresh_with(batch, plan, None, ctx)
    }

    /// Plan and reserve a refresh of `nodes`.  If either step fails, `undo`
    /// puts back the shadow change that prompted it.
    fn prepare_refresh(
        &mut self,
        nodes: &[NodeHandle],
        undo: impl FnOnce(&mut Self),
    ) -> McResult<RefreshPlan> {
        let planned = self.plan_refresh(nodes);
        let reserved = planned.and_then(|mut plan| {
            self.reserve_refresh(&mut plan).map(|_| plan)
        });
        if reserved.is_err() {
            undo(self);
        }
        reserved
    }

    /// Nodes replicating to a port, directly or through a LAG.
    fn nodes_using_port(&self, port: DevPort) -> Vec<NodeHandle> {
        self.nodes
            .iter()
            .filter(|(_, n)| {
                n.ports.contains(&port)
                    || n.lags.iter().any(|l| {
                        self.lags.get(l).is_some_and(|m| m.contains(port))
                    })
            })
            .map(|(h, _)| h)
            .collect()
    }

    pub fn backup_port_changed(
        &mut self,
        protected: DevPort,
        old: Option<DevPort>,
        new: Option<DevPort>,
    ) -> McResult<()> {
        self.check_port(protected)?;
        for port in old.iter().chain(new.iter()) {
            self.check_port(*port)?;
        }
        let current = self.backups.get(&protected).copied();
        if current != old {
            return Err(McError::Invalid(format!(
                "port {protected} is backed up by {current:?}, not {old:?}"
            )));
        }
        if old == new {
            return Ok(());
        }

        let set = |dev: &mut Self, backup: Option<DevPort>| match backup {
            Some(b) => {
                dev.backups.insert(protected, b);
            }
            None => {
                dev.backups.remove(&protected);
            }
        };
        set(self, new);
        let nodes = self.nodes_using_port(protected);
        let plan = self.prepare_refresh(&nodes, |dev| set(dev, old))?;

        info!(self.log, "backup port changed"; "port" => protected,
            "old" => ?old, "new" => ?new, "nodes" => nodes.len());
        self.apply_refresh_with(
            WriteBatch::new(),
            plan,
            Some(McWrite::Pmt {
                port: protected,
                backup: new,
            }),
            "backup port change",
        )
    }

    pub fn lag_update(
        &mut self,
        lag_id: LagId,
        ports: &[DevPort],
    ) -> McResult<()> {
        for port in ports {
            self.check_port(*port)?;
        }
        let members = PortBitmap::from_ports(ports);
        let old = self.lags.get(&lag_id).copied();
        if old.unwrap_or_default() == members {
            return Ok(());
        }

        let set = |dev: &mut Self, m: Option<PortBitmap>| match m {
            Some(m) if !m.is_empty() => {
                dev.lags.insert(lag_id, m);
            }
            _ => {
                dev.lags.remove(&lag_id);
            }
        };
        set(self, Some(members));
        let nodes: Vec<NodeHandle> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.lags.contains(&lag_id))
            .map(|(h, _)| h)
            .collect();
        let plan = self.prepare_refresh(&nodes, |dev| set(dev, old))?;

        info!(self.log, "lag membership changed"; "lag" => lag_id,
            "ports" => members.count(), "nodes" => nodes.len());
        self.apply_refresh_with(
            WriteBatch::new(),
            plan,
            Some(McWrite::Lit {
                lag_id,
                ports: members,
            }),
            "lag update",
        )
    }
}
