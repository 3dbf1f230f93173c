// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Per-device state, and the plumbing every operation shares: pipe mapping,
//! argument checks, flushing write batches and the epoch callback.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use slog::{debug, error, info, o, warn};

use aal::{
    port_is_valid, port_to_pipe, AsicOps, AsicResult, DevId, DevPort, Epoch,
    LagId, McWrite, Mgid, PortBitmap, RdmAddr, RdmRecord, TofinoFamily,
};

use crate::arena::Arena;
use crate::batch::{Undo, WriteBatch};
use crate::config::McConfig;
use crate::ecmp::EcmpGroup;
use crate::freemap::FreeMap;
use crate::node::Node;
use crate::pvt::VectorTable;
use crate::rdm::{Deferred, DeferredQueue, PoolUsage, RdmAllocator};
use crate::tail::TailTable;
use crate::tree::{L1Handle, L1Node, Tree};
use crate::types::{McError, McResult};
use crate::{GroupHandle, NodeHandle};

/// Where a logical pipe lives.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PipeInfo {
    pub phys: u8,
    pub subdev: u8,
}

pub(crate) struct Device<H: AsicOps> {
    pub log: slog::Logger,
    pub dev: DevId,
    pub hdl: H,
    pub family: TofinoFamily,
    pub config: McConfig,
    /// Active pipes, by logical pipe number.
    pub pipes: BTreeMap<u8, PipeInfo>,
    pub phys_to_log: BTreeMap<u8, u8>,
    pub subdevs: u8,

    pub rdm: RdmAllocator,
    pub deferred: DeferredQueue,
    /// Frees lost to write lists that never reached the hardware.
    pub leaked: usize,
    pub last_epoch: Epoch,
    pub tails: TailTable,
    pub pvt: VectorTable,
    pub tvt: Option<VectorTable>,

    pub nodes: Arena<NodeHandle, Node>,
    pub l1: Arena<L1Handle, L1Node>,
    pub groups: Arena<GroupHandle, EcmpGroup>,
    pub ecmp_ids: FreeMap,
    /// The L1 list of every live tree, by logical pipe and MGID.
    pub trees: BTreeMap<(u8, Mgid), Tree>,
    /// LAG membership shadow.
    pub lags: BTreeMap<LagId, PortBitmap>,
    /// Port protection shadow: protected port to backup port.
    pub backups: BTreeMap<DevPort, DevPort>,
    /// The table version the dataplane is using.
    pub version: u8,
}

impl<H: AsicOps> Device<H> {
    pub fn new(
        log: &slog::Logger,
        dev: DevId,
        hdl: H,
        config: &McConfig,
    ) -> McResult<Self> {
        config.validate()?;
        let log = log.new(o!("unit" => "mcmgr", "dev" => dev));
        let family = hdl.family(dev)?;
        let active = hdl.num_active_pipes(dev)?;
        let subdevs = hdl.num_subdevices(dev)?;
        let per_subdev = hdl.pipes_per_subdevice(dev)?;
        if per_subdev == 0 {
            return Err(McError::Invalid("device reports no pipes".into()));
        }

        let mut pipes = BTreeMap::new();
        let mut phys_to_log = BTreeMap::new();
        for pipe in 0..active {
            let phys = hdl.logical_to_physical_pipe(dev, pipe)?;
            let subdev = phys / per_subdev;
            if subdev >= subdevs || phys_to_log.insert(phys, pipe).is_some() {
                return Err(McError::Invalid(format!(
                    "bad mapping of logical pipe {pipe} to physical pipe \
                     {phys}"
                )));
            }
            pipes.insert(pipe, PipeInfo { phys, subdev });
        }

        let pvt = VectorTable::new(family.pvt_layout(), config.mgid_count);
        let tvt = family
            .tvt_layout()
            .map(|layout| VectorTable::new(layout, config.mgid_count));
        let widest = phys_to_log.keys().copied().max().unwrap_or(0);
        if !pvt.fits(1 << widest) {
            return Err(McError::Invalid(format!(
                "physical pipe {widest} doesn't fit the {family} pipe vector"
            )));
        }

        let tail_sizes = match (&config.tail_sizes, family.has_tails()) {
            (_, false) => Vec::new(),
            (Some(sizes), true) => sizes.clone(),
            (None, true) => family.default_tail_sizes(),
        };
        if config.tail_sizes.is_some() && !family.has_tails() {
            warn!(log, "{family} has no tail blocks; ignoring tail_sizes");
        }

        let rdm = RdmAllocator::new(&log, pipes.keys().copied(), &config.rdm);
        let tails = TailTable::new(tail_sizes, rdm.tail_base());
        let ecmp_ids = FreeMap::new(&log, "ecmp_id", 0, u16::MAX as u32 + 1);

        info!(log, "adding device";
            "family" => %family,
            "pipes" => active,
            "subdevices" => subdevs,
            "tails" => ?tails.sizes());

        let mut device = Device {
            log,
            dev,
            hdl,
            family,
            config: config.clone(),
            pipes,
            phys_to_log,
            subdevs,
            rdm,
            deferred: DeferredQueue::default(),
            leaked: 0,
            last_epoch: Epoch::default(),
            tails,
            pvt,
            tvt,
            nodes: Arena::new(),
            l1: Arena::new(),
            groups: Arena::new(),
            ecmp_ids,
            trees: BTreeMap::new(),
            lags: BTreeMap::new(),
            backups: BTreeMap::new(),
            version: 0,
        };

        let mut batch = WriteBatch::new();
        let pipes: Vec<u8> = device.pipes.keys().copied().collect();
        let blocks: Vec<(u8, RdmAddr)> = device.tails.blocks().collect();
        for pipe in pipes {
            for (size, base) in &blocks {
                device.rdm_write(
                    &mut batch,
                    pipe,
                    *base,
                    RdmRecord::Tail { size: *size },
                );
            }
        }
        // MGID 0 must never see an empty die map.
        device.program_tvt(&mut batch, 0, 0);
        device.flush(batch)?;
        Ok(device)
    }

    pub fn phys(&self, pipe: u8) -> u8 {
        self.pipes.get(&pipe).map(|p| p.phys).unwrap_or(pipe)
    }

    pub fn subdev(&self, pipe: u8) -> u8 {
        self.pipes.get(&pipe).map(|p| p.subdev).unwrap_or(0)
    }

    /// The logical pipe a port belongs to, if that pipe is active.
    pub fn port_pipe(&self, port: DevPort) -> Option<u8> {
        self.phys_to_log.get(&port_to_pipe(port)).copied()
    }

    pub fn check_mgid(&self, mgid: Mgid) -> McResult<()> {
        if (mgid as u32) < self.config.mgid_count {
            Ok(())
        } else {
            Err(McError::Invalid(format!("mgid {mgid} out of range")))
        }
    }

    pub fn check_pipe(&self, pipe: u8) -> McResult<()> {
        if self.pipes.contains_key(&pipe) {
            Ok(())
        } else {
            Err(McError::Invalid(format!("pipe {pipe} is not active")))
        }
    }

    pub fn check_port(&self, port: DevPort) -> McResult<()> {
        if port_is_valid(port) && self.port_pipe(port).is_some() {
            Ok(())
        } else {
            Err(McError::Invalid(format!("invalid port {port}")))
        }
    }

    /// Stage a write of one RDM record.
    pub fn rdm_write(
        &self,
        batch: &mut WriteBatch,
        pipe: u8,
        addr: RdmAddr,
        record: RdmRecord,
    ) {
        batch.push(
            self.subdev(pipe),
            McWrite::Rdm {
                pipe: self.phys(pipe),
                addr,
                record,
            },
        );
    }

    /// Stage a write that every subdevice carries a copy of.
    pub fn write_all_subdevs(&self, batch: &mut WriteBatch, write: McWrite) {
        for subdev in 0..self.subdevs {
            batch.push(subdev, write.clone());
        }
    }

    pub fn program_pvt(&mut self, batch: &mut WriteBatch, mgid: Mgid, mask: u32) {
        let old = self.pvt.get(mgid);
        if old == mask {
            return;
        }
        let (row, value) = self.pvt.set(mgid, mask);
        batch.undo.push(Undo::Pvt { mgid, old });
        debug!(self.log, "pvt update"; "mgid" => mgid,
            "mask" => common::mask_to_string(mask));
        self.write_all_subdevs(batch, McWrite::PvtRow { row, value });
    }

    pub fn program_tvt(&mut self, batch: &mut WriteBatch, mgid: Mgid, mask: u32) {
        let mask = if mgid == 0 { mask | 1 } else { mask };
        let Some(tvt) = self.tvt.as_mut() else {
            return;
        };
        let old = tvt.get(mgid);
        if old == mask {
            return;
        }
        let (row, value) = tvt.set(mgid, mask);
        batch.undo.push(Undo::Tvt { mgid, old });
        self.write_all_subdevs(batch, McWrite::TvtRow { row, value });
    }

    /// The pipe vector an MGID needs: every pipe holding a tree for it.
    pub fn derived_pvt(&self, mgid: Mgid) -> u32 {
        self.pipes
            .iter()
            .filter(|(pipe, _)| self.trees.contains_key(&(**pipe, mgid)))
            .fold(0, |mask, (_, info)| mask | (1 << info.phys))
    }

    pub fn derived_tvt(&self, pvt: u32) -> u32 {
        self.pipes
            .values()
            .filter(|info| pvt & (1 << info.phys) != 0)
            .fold(0, |mask, info| mask | (1 << info.subdev))
    }

    /// Bring an MGID's pipe and die vectors in line with its trees.
    pub fn sync_vectors(&mut self, batch: &mut WriteBatch, mgid: Mgid) {
        let pvt = self.derived_pvt(mgid);
        let tvt = self.derived_tvt(pvt);
        self.program_pvt(batch, mgid, pvt);
        self.program_tvt(batch, mgid, tvt);
    }

    pub fn pvt_update(&mut self, mgid: Mgid, mask: u32) -> McResult<()> {
        self.check_mgid(mgid)?;
        let active = self
            .pipes
            .values()
            .fold(0u32, |m, info| m | (1 << info.phys));
        if mask & !active != 0 {
            return Err(McError::Invalid(format!(
                "pipe mask {} includes inactive pipes",
                common::mask_to_string(mask)
            )));
        }
        let mut batch = WriteBatch::new();
        self.program_pvt(&mut batch, mgid, mask);
        self.flush(batch)?;
        Ok(())
    }

    pub fn tvt_update(&mut self, mgid: Mgid, mask: u32) -> McResult<()> {
        self.check_mgid(mgid)?;
        if self.tvt.is_none() {
            return Err(McError::Invalid(format!(
                "{} has no die vector table",
                self.family
            )));
        }
        if mask >> self.subdevs != 0 {
            return Err(McError::Invalid(format!(
                "die mask {} includes missing dies",
                common::mask_to_string(mask)
            )));
        }
        let mut batch = WriteBatch::new();
        self.program_tvt(&mut batch, mgid, mask);
        self.flush(batch)?;
        Ok(())
    }

    pub fn pvt_get(&self, mgid: Mgid) -> McResult<u32> {
        self.check_mgid(mgid)?;
        Ok(self.pvt.get(mgid))
    }

    pub fn tvt_get(&self, mgid: Mgid) -> McResult<Option<u32>> {
        self.check_mgid(mgid)?;
        Ok(self.tvt.as_ref().map(|t| t.get(mgid)))
    }

    fn send(&self, writes: Vec<(u8, McWrite)>) -> AsicResult<Epoch> {
        for (subdev, write) in writes {
            self.hdl.write_list_append(self.dev, subdev, write)?;
        }
        self.hdl.write_list_send(self.dev)
    }

    /// Push a batch to the hardware.  If the push fails, nothing in the batch
    /// reached the device: the table shadows are restored and the deferred
    /// work is dropped, leaking whatever it would have freed.
    pub fn flush(&mut self, batch: WriteBatch) -> AsicResult<Option<Epoch>> {
        if batch.is_empty() {
            return Ok(None);
        }
        let WriteBatch {
            writes,
            deferred,
            undo,
        } = batch;
        let count = writes.len();
        match self.send(writes) {
            Ok(epoch) => {
                debug!(self.log, "sent write list";
                    "writes" => count, "epoch" => %epoch);
                self.last_epoch = epoch;
                for item in deferred {
                    self.deferred.push(epoch, item);
                }
                Ok(Some(epoch))
            }
            Err(e) => {
                self.hdl.write_list_discard(self.dev);
                for u in undo.into_iter().rev() {
                    match u {
                        Undo::Pvt { mgid, old } => {
                            self.pvt.set(mgid, old);
                        }
                        Undo::Tvt { mgid, old } => {
                            if let Some(tvt) = self.tvt.as_mut() {
                                tvt.set(mgid, old);
                            }
                        }
                    }
                }
                self.leak(&deferred, &e);
                Err(e)
            }
        }
    }

    /// Give up on deferred frees whose writes never took effect.  The blocks
    /// may still be reachable, so they stay allocated.
    pub fn leak(&mut self, deferred: &[Deferred], err: &impl fmt::Display) {
        let lost = deferred
            .iter()
            .filter(|d| matches!(d, Deferred::Free { .. }))
            .count();
        if lost > 0 {
            error!(self.log, "leaking {lost} deferred frees"; "error" => %err);
            self.leaked += lost;
        }
    }

    /// Flush a batch that follows changes to the software model.
    pub fn commit(&mut self, batch: WriteBatch, ctx: &str) -> McResult<()> {
        self.flush(batch).map_err(|e| {
            error!(self.log, "hardware update failed after mutation";
                "op" => ctx, "error" => %e);
            McError::hw_after_mutation(ctx, e)
        })?;
        Ok(())
    }

    /// Called once the hardware confirms that every packet admitted before
    /// `epoch` has drained.  Releases deferred frees and installs smaller
    /// tails that were waiting on it.
    pub fn on_epoch_advanced(&mut self, epoch: Epoch) -> McResult<()> {
        let ready = self.deferred.drain_through(epoch);
        if ready.is_empty() {
            return Ok(());
        }
        debug!(self.log, "epoch advanced";
            "epoch" => %epoch, "ready" => ready.len());
        let mut batch = WriteBatch::new();
        let mut shrinks = BTreeSet::new();
        for item in ready {
            match item {
                Deferred::Free { pipe, addr } => {
                    if let Err(e) = self.rdm.release(pipe, addr) {
                        error!(self.log, "deferred free failed"; "error" => %e);
                    }
                }
                Deferred::Shrink { pipe, mgid, .. } => {
                    shrinks.insert((pipe, mgid));
                }
            }
        }
        for (pipe, mgid) in shrinks {
            self.apply_shrink(&mut batch, pipe, mgid);
        }
        self.commit(batch, "tail shrink")
    }

    pub fn set_rdm_chaos(&mut self, n: Option<u32>) {
        self.rdm.set_chaos(n);
    }

    pub fn rdm_usage(&self) -> Vec<PoolUsage> {
        self.rdm.usage()
    }

    pub fn pending(&self) -> Vec<(Epoch, Deferred)> {
        self.deferred.pending()
    }
}
