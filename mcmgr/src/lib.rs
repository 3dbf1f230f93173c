// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Multicast replication manager.
//!
//! For every multicast group id (MGID) the manager maintains, in each pipe of
//! a device, a tree of replication records that the dataplane walks to decide
//! which ports and LAGs get a copy of a packet.  It owns the replication data
//! memory those records live in, and makes every change to a live tree in an
//! order the dataplane can never observe half done.
//!
//! All access goes through a [`McSession`], which holds the manager's single
//! lock for as long as it lives.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, TryLockError};

use slog::{info, o};

use aal::{AsicOps, DevId, DevPort, Epoch, LagId, Mgid, Rid, Xid};

mod arena;
mod audit;
mod backup;
mod batch;
mod chain;
pub mod config;
mod device;
mod ecc;
mod ecmp;
mod freemap;
mod node;
mod pvt;
mod rdm;
mod tail;
mod tree;
pub mod types;

pub use config::{McConfig, RdmCapacity};
pub use ecc::TableKind;
pub use ecmp::{EcmpState, EcmpTransition, GroupInfo, GroupPipeInfo};
pub use node::{NodeAttachment, NodeInfo};
pub use rdm::{Deferred, NodeType, PoolUsage};
pub use tree::{L1Info, TreeInfo};
pub use types::{McError, McResult};

use device::Device;

arena::arena_key!(
    /// Refers to a RID node created by [`McSession::node_create`].
    NodeHandle
);
arena::arena_key!(
    /// Refers to an ECMP group created by [`McSession::group_create`].
    GroupHandle
);

/// The multicast manager for any number of devices.
pub struct McMgr<H: AsicOps> {
    log: slog::Logger,
    config: McConfig,
    devices: Mutex<BTreeMap<DevId, Device<H>>>,
}

impl<H: AsicOps> McMgr<H> {
    pub fn new(log: &slog::Logger, config: McConfig) -> McResult<Self> {
        config.validate()?;
        Ok(McMgr {
            log: log.new(o!("unit" => "mcmgr")),
            config,
            devices: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &McConfig {
        &self.config
    }

    /// Take the manager's lock, waiting for it if another caller holds it.
    pub fn session(&self) -> McSession<'_, H> {
        McSession {
            mgr: self,
            devices: self.devices.lock().unwrap(),
        }
    }

    /// Take the manager's lock only if nobody else holds it.
    pub fn try_session(&self) -> McResult<McSession<'_, H>> {
        match self.devices.try_lock() {
            Ok(devices) => Ok(McSession { mgr: self, devices }),
            Err(TryLockError::WouldBlock) => {
                Err(McError::Busy("another session is active".into()))
            }
            Err(TryLockError::Poisoned(_)) => {
                Err(McError::Internal("manager lock poisoned".into()))
            }
        }
    }
}

/// Exclusive access to the manager.  Every operation runs to completion
/// before the next one starts.
pub struct McSession<'a, H: AsicOps> {
    mgr: &'a McMgr<H>,
    devices: MutexGuard<'a, BTreeMap<DevId, Device<H>>>,
}

impl<H: AsicOps> McSession<'_, H> {
    fn device(&self, dev: DevId) -> McResult<&Device<H>> {
        self.devices
            .get(&dev)
            .ok_or_else(|| McError::Missing(format!("no such device: {dev}")))
    }

    fn device_mut(&mut self, dev: DevId) -> McResult<&mut Device<H>> {
        self.devices
            .get_mut(&dev)
            .ok_or_else(|| McError::Missing(format!("no such device: {dev}")))
    }

    /// Start managing a device.  Its pools and tails are laid out from the
    /// topology the handle reports.
    pub fn device_add(&mut self, dev: DevId, hdl: H) -> McResult<()> {
        if self.devices.contains_key(&dev) {
            return Err(McError::Exists(format!("device {dev} already added")));
        }
        let device = Device::new(&self.mgr.log, dev, hdl, &self.mgr.config)?;
        self.devices.insert(dev, device);
        Ok(())
    }

    /// Stop managing a device, dropping all of its state.  The hardware
    /// tables are left as they are.
    pub fn device_remove(&mut self, dev: DevId) -> McResult<()> {
        let device = self.devices.remove(&dev).ok_or_else(|| {
            McError::Missing(format!("no such device: {dev}"))
        })?;
        info!(self.mgr.log, "removed device"; "dev" => dev,
            "nodes" => device.nodes.len(),
            "groups" => device.groups.len());
        Ok(())
    }

    pub fn devices(&self) -> Vec<DevId> {
        self.devices.keys().copied().collect()
    }

    pub fn node_create(
        &mut self,
        dev: DevId,
        rid: Rid,
        ports: &[DevPort],
        lags: &[LagId],
    ) -> McResult<NodeHandle> {
        self.device_mut(dev)?.node_create(rid, ports, lags)
    }

    pub fn node_update(
        &mut self,
        dev: DevId,
        node: NodeHandle,
        ports: &[DevPort],
        lags: &[LagId],
    ) -> McResult<()> {
        self.device_mut(dev)?.node_update(node, ports, lags)
    }

    pub fn node_destroy(&mut self, dev: DevId, node: NodeHandle) -> McResult<()> {
        self.device_mut(dev)?.node_destroy(node)
    }

    pub fn node_get(&self, dev: DevId, node: NodeHandle) -> McResult<NodeInfo> {
        self.device(dev)?.node_get(node)
    }

    pub fn mgid_attach_node(
        &mut self,
        dev: DevId,
        mgid: Mgid,
        node: NodeHandle,
        xid: Option<Xid>,
    ) -> McResult<()> {
        self.device_mut(dev)?.mgid_attach_node(mgid, node, xid)
    }

    pub fn mgid_detach_node(
        &mut self,
        dev: DevId,
        mgid: Mgid,
        node: NodeHandle,
    ) -> McResult<()> {
        self.device_mut(dev)?.mgid_detach_node(mgid, node)
    }

    pub fn group_create(&mut self, dev: DevId) -> McResult<GroupHandle> {
        self.device_mut(dev)?.group_create()
    }

    pub fn group_destroy(
        &mut self,
        dev: DevId,
        group: GroupHandle,
    ) -> McResult<()> {
        self.device_mut(dev)?.group_destroy(group)
    }

    pub fn group_add_member(
        &mut self,
        dev: DevId,
        group: GroupHandle,
        node: NodeHandle,
    ) -> McResult<()> {
        self.device_mut(dev)?.group_add_member(group, node)
    }

    pub fn group_remove_member(
        &mut self,
        dev: DevId,
        group: GroupHandle,
        node: NodeHandle,
    ) -> McResult<()> {
        self.device_mut(dev)?.group_remove_member(group, node)
    }

    pub fn group_info(
        &self,
        dev: DevId,
        group: GroupHandle,
    ) -> McResult<GroupInfo> {
        self.device(dev)?.group_info(group)
    }

    pub fn mgid_attach_group(
        &mut self,
        dev: DevId,
        mgid: Mgid,
        group: GroupHandle,
        xid: Option<Xid>,
    ) -> McResult<()> {
        self.device_mut(dev)?.mgid_attach_group(mgid, group, xid)
    }

    pub fn mgid_detach_group(
        &mut self,
        dev: DevId,
        mgid: Mgid,
        group: GroupHandle,
    ) -> McResult<()> {
        self.device_mut(dev)?.mgid_detach_group(mgid, group)
    }

    /// Set the pipe mask of an MGID.  The mask is in physical pipes.
    pub fn pvt_update(
        &mut self,
        dev: DevId,
        mgid: Mgid,
        mask: u32,
    ) -> McResult<()> {
        self.device_mut(dev)?.pvt_update(mgid, mask)
    }

    pub fn tvt_update(
        &mut self,
        dev: DevId,
        mgid: Mgid,
        mask: u32,
    ) -> McResult<()> {
        self.device_mut(dev)?.tvt_update(mgid, mask)
    }

    pub fn pvt_get(&self, dev: DevId, mgid: Mgid) -> McResult<u32> {
        self.device(dev)?.pvt_get(mgid)
    }

    /// The die mask of an MGID, on families with a die vector table.
    pub fn tvt_get(&self, dev: DevId, mgid: Mgid) -> McResult<Option<u32>> {
        self.device(dev)?.tvt_get(mgid)
    }

    pub fn backup_port_changed(
        &mut self,
        dev: DevId,
        protected: DevPort,
        old: Option<DevPort>,
        new: Option<DevPort>,
    ) -> McResult<()> {
        self.device_mut(dev)?.backup_port_changed(protected, old, new)
    }

    /// Replace the members of a LAG.  An empty list removes it.
    pub fn lag_update(
        &mut self,
        dev: DevId,
        lag_id: LagId,
        ports: &[DevPort],
    ) -> McResult<()> {
        self.device_mut(dev)?.lag_update(lag_id, ports)
    }

    pub fn ecc_repair(
        &mut self,
        dev: DevId,
        kind: TableKind,
        index: u32,
    ) -> McResult<()> {
        self.device_mut(dev)?.ecc_repair(kind, index)
    }

    /// Report that the hardware has confirmed an epoch.
    pub fn on_epoch_advanced(&mut self, dev: DevId, epoch: Epoch) -> McResult<()> {
        self.device_mut(dev)?.on_epoch_advanced(epoch)
    }

    /// The epoch of the most recent write list sent to a device.
    pub fn last_epoch(&self, dev: DevId) -> McResult<Epoch> {
        Ok(self.device(dev)?.last_epoch)
    }

    /// The table version the device's dataplane is using.
    pub fn table_version(&self, dev: DevId) -> McResult<u8> {
        Ok(self.device(dev)?.version)
    }

    pub fn mgid_tree(
        &self,
        dev: DevId,
        pipe: u8,
        mgid: Mgid,
    ) -> McResult<TreeInfo> {
        let device = self.device(dev)?;
        device.check_pipe(pipe)?;
        device.check_mgid(mgid)?;
        Ok(device.tree_info(pipe, mgid))
    }

    pub fn rdm_usage(&self, dev: DevId) -> McResult<Vec<PoolUsage>> {
        Ok(self.device(dev)?.rdm_usage())
    }

    /// Deferred work waiting on an epoch.
    pub fn pending_frees(&self, dev: DevId) -> McResult<Vec<(Epoch, Deferred)>> {
        Ok(self.device(dev)?.pending())
    }

    /// How many deferred frees were lost to failed write lists.
    pub fn leaked_frees(&self, dev: DevId) -> McResult<usize> {
        Ok(self.device(dev)?.leaked)
    }

    /// Make the `n`th allocation from now fail.  `None` turns this off.
    pub fn rdm_chaos(&mut self, dev: DevId, n: Option<u32>) -> McResult<()> {
        self.device_mut(dev)?.set_rdm_chaos(n);
        Ok(())
    }

    pub fn audit(&self, dev: DevId) -> McResult<()> {
        self.device(dev)?.audit()
    }

    pub fn rebuild_shadows(&mut self, dev: DevId) -> McResult<()> {
        self.device_mut(dev)?.rebuild_shadows()
    }
}
