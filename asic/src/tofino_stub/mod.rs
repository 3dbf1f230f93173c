// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A software model of the replication engine.  Writes staged on the write
//! list are applied, in order, when the list is sent.  The model can walk a
//! tree the way the dataplane would and, when auditing is enabled, checks
//! after every individual write and version flip that everything reachable
//! from a tree root is fully formed.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use slog::{debug, o};

use crate::chaos::{unfurl, ChaosConfig};
use aal::{
    AsicError, AsicOps, AsicResult, DevId, DevPort, Epoch, LagId, McWrite,
    Mgid, PortBitmap, RdmAddr, RdmRecord, TofinoFamily,
};

pub mod multicast;
pub use multicast::{L2Hop, Replica, TreeWalk};

/// Shape of the modelled device.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AsicConfig {
    pub family: TofinoFamily,
    /// Number of active pipes.  Defaults to the family's maximum.
    pub pipes: Option<u8>,
    /// Number of dies.  Tofino3 models default to two, others to one.
    pub subdevices: Option<u8>,
    /// Logical to physical pipe map.  Defaults to the identity map.
    pub pipe_map: Option<Vec<u8>>,
    /// How many polls of the version counter it takes for the old table
    /// version to drain after a flip.
    pub drain_polls: u32,
    /// Check the reachable structures after every micro-step.
    pub audit: bool,
    /// Faults to inject into the transport.
    pub chaos: ChaosConfig,
}

impl Default for AsicConfig {
    fn default() -> Self {
        AsicConfig {
            family: TofinoFamily::Tofino2,
            pipes: None,
            subdevices: None,
            pipe_map: None,
            drain_polls: 2,
            audit: true,
            chaos: ChaosConfig::default(),
        }
    }
}

impl AsicConfig {
    pub fn new(family: TofinoFamily) -> Self {
        AsicConfig {
            family,
            ..Default::default()
        }
    }
}

pub struct StubHandle {
    dev: DevId,
    family: TofinoFamily,
    pipes: u8,
    subdevices: u8,
    pipe_map: Vec<u8>,
    drain_polls: u32,
    audit: bool,
    log: slog::Logger,
    chaos: Mutex<ChaosConfig>,
    state: Mutex<multicast::McModel>,
}

impl StubHandle {
    pub fn new(
        log: &slog::Logger,
        dev: DevId,
        config: &AsicConfig,
    ) -> AsicResult<Self> {
        let family = config.family;
        let pipes = config.pipes.unwrap_or(family.max_pipes());
        if pipes == 0 || pipes > family.max_pipes() {
            return Err(AsicError::InvalidArg(format!(
                "{family} supports at most {} pipes",
                family.max_pipes()
            )));
        }
        let subdevices = config.subdevices.unwrap_or(match family {
            TofinoFamily::Tofino3 => 2,
            _ => 1,
        });
        if subdevices == 0 || family.max_pipes() % subdevices != 0 {
            return Err(AsicError::InvalidArg(format!(
                "invalid subdevice count {subdevices}"
            )));
        }
        let pipe_map = match &config.pipe_map {
            Some(map) => {
                if map.len() != pipes as usize
                    || map.iter().any(|p| *p >= family.max_pipes())
                {
                    return Err(AsicError::InvalidArg(
                        "pipe map doesn't match the pipe count".into(),
                    ));
                }
                map.clone()
            }
            None => (0..pipes).collect(),
        };
        config.chaos.validate()?;

        let log = log.new(o!("unit" => "tofino_stub", "dev" => dev));
        debug!(log, "created stub asic";
            "family" => %family,
            "pipes" => pipes,
            "subdevices" => subdevices);

        Ok(StubHandle {
            dev,
            family,
            pipes,
            subdevices,
            pipe_map,
            drain_polls: config.drain_polls,
            audit: config.audit,
            log,
            chaos: Mutex::new(config.chaos.clone()),
            state: Mutex::new(multicast::McModel::new(subdevices)),
        })
    }

    fn check_dev(&self, dev: DevId) -> AsicResult<()> {
        if dev == self.dev {
            Ok(())
        } else {
            Err(AsicError::InvalidArg(format!("no such device: {dev}")))
        }
    }

    fn pipes_per_subdev(&self) -> u8 {
        self.family.max_pipes() / self.subdevices
    }

    /// Replace the fault-injection settings.
    pub fn set_chaos(&self, chaos: ChaosConfig) -> AsicResult<()> {
        chaos.validate()?;
        *self.chaos.lock().unwrap() = chaos;
        Ok(())
    }

    /// Change how many polls it takes for a table version to drain.
    pub fn set_drain_polls(&self, polls: u32) {
        self.state.lock().unwrap().drain_polls = Some(polls);
    }

    /// The table version the dataplane is currently using.
    pub fn version(&self) -> u8 {
        self.state.lock().unwrap().version
    }

    /// How many times the table version has been flipped.
    pub fn flips(&self) -> u32 {
        self.state.lock().unwrap().flips
    }

    /// The epoch of the most recently sent write list.
    pub fn epoch(&self) -> Epoch {
        Epoch(self.state.lock().unwrap().epoch)
    }

    /// How many writes have been applied to the model.
    pub fn writes_applied(&self) -> u64 {
        self.state.lock().unwrap().writes
    }

    /// Every problem the audit has found so far.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().unwrap().violations.clone()
    }

    pub fn record(&self, phys_pipe: u8, addr: RdmAddr) -> Option<RdmRecord> {
        self.state.lock().unwrap().rdm.get(&(phys_pipe, addr)).cloned()
    }

    pub fn mit_root(&self, phys_pipe: u8, mgid: Mgid) -> Option<RdmAddr> {
        self.state.lock().unwrap().mit.get(&(phys_pipe, mgid)).copied()
    }

    pub fn pvt_row(&self, subdev: u8, row: u32) -> u64 {
        let state = self.state.lock().unwrap();
        state.pvt[subdev as usize].get(&row).copied().unwrap_or(0)
    }

    pub fn tvt_row(&self, subdev: u8, row: u32) -> u64 {
        let state = self.state.lock().unwrap();
        state.tvt[subdev as usize].get(&row).copied().unwrap_or(0)
    }

    pub fn lit(&self, lag_id: LagId) -> PortBitmap {
        let state = self.state.lock().unwrap();
        state.lit.get(&lag_id).copied().unwrap_or_default()
    }

    pub fn pmt(&self, port: DevPort) -> Option<DevPort> {
        self.state.lock().unwrap().pmt.get(&port).copied()
    }

    /// Walk one MGID's tree in one physical pipe, as the dataplane would.
    pub fn walk(&self, phys_pipe: u8, mgid: Mgid) -> AsicResult<TreeWalk> {
        let state = self.state.lock().unwrap();
        state.walk(phys_pipe, mgid)
    }

    /// Simulate a memory error by scribbling over a tree root.
    pub fn corrupt_mit(&self, phys_pipe: u8, mgid: Mgid) {
        let mut state = self.state.lock().unwrap();
        state.mit.insert((phys_pipe, mgid), 0xdead);
    }

    /// Simulate a memory error in a pipe vector table row.
    pub fn corrupt_pvt_row(&self, subdev: u8, row: u32) {
        let mut state = self.state.lock().unwrap();
        state.pvt[subdev as usize].insert(row, u64::MAX);
    }

    /// Simulate a memory error in a die vector table row.
    pub fn corrupt_tvt_row(&self, subdev: u8, row: u32) {
        let mut state = self.state.lock().unwrap();
        state.tvt[subdev as usize].insert(row, u64::MAX);
    }

    /// Simulate a memory error in a LAG table row.
    pub fn corrupt_lit(&self, lag_id: LagId) {
        let mut state = self.state.lock().unwrap();
        state.lit.insert(lag_id, PortBitmap::from_ports(&[0, 1, 2]));
    }
}

impl AsicOps for StubHandle {
    fn family(&self, dev: DevId) -> AsicResult<TofinoFamily> {
        self.check_dev(dev)?;
        Ok(self.family)
    }

    fn num_active_pipes(&self, dev: DevId) -> AsicResult<u8> {
        self.check_dev(dev)?;
        Ok(self.pipes)
    }

    fn logical_to_physical_pipe(&self, dev: DevId, pipe: u8) -> AsicResult<u8> {
        self.check_dev(dev)?;
        self.pipe_map.get(pipe as usize).copied().ok_or_else(|| {
            AsicError::InvalidArg(format!("no such logical pipe: {pipe}"))
        })
    }

    fn num_subdevices(&self, dev: DevId) -> AsicResult<u8> {
        self.check_dev(dev)?;
        Ok(self.subdevices)
    }

    fn pipes_per_subdevice(&self, dev: DevId) -> AsicResult<u8> {
        self.check_dev(dev)?;
        Ok(self.pipes_per_subdev())
    }

    fn write_list_append(
        &self,
        dev: DevId,
        subdev: u8,
        write: McWrite,
    ) -> AsicResult<()> {
        self.check_dev(dev)?;
        unfurl!(self, write_list_append);
        if matches!(write, McWrite::PvtRow { .. } | McWrite::TvtRow { .. }) {
            unfurl!(self, vector_table_write);
        }
        if subdev >= self.subdevices {
            return Err(AsicError::InvalidArg(format!(
                "no such subdevice: {subdev}"
            )));
        }
        let pipe = match &write {
            McWrite::Rdm { pipe, .. } | McWrite::Mit { pipe, .. } => {
                Some(*pipe)
            }
            _ => None,
        };
        if let Some(pipe) = pipe {
            if !self.pipe_map.contains(&pipe) {
                return Err(AsicError::InvalidArg(format!(
                    "write to inactive pipe {pipe}"
                )));
            }
            if pipe / self.pipes_per_subdev() != subdev {
                return Err(AsicError::InvalidArg(format!(
                    "pipe {pipe} doesn't belong to subdevice {subdev}"
                )));
            }
        }
        self.state.lock().unwrap().staged.push((subdev, write));
        Ok(())
    }

    fn write_list_send(&self, dev: DevId) -> AsicResult<Epoch> {
        self.check_dev(dev)?;
        let mut state = self.state.lock().unwrap();
        if let Err(e) = self
            .chaos
            .lock()
            .unwrap()
            .write_list_send
            .unfurled(&self.log, "write_list_send")
        {
            state.staged.clear();
            return Err(e);
        }
        let staged = std::mem::take(&mut state.staged);
        for (subdev, write) in staged {
            state.apply(subdev, write);
            if self.audit {
                state.audit();
            }
        }
        state.epoch += 1;
        Ok(Epoch(state.epoch))
    }

    fn write_list_discard(&self, dev: DevId) {
        if dev == self.dev {
            self.state.lock().unwrap().staged.clear();
        }
    }

    fn table_version_flip(&self, dev: DevId, version: u8) -> AsicResult<()> {
        self.check_dev(dev)?;
        unfurl!(self, table_version_flip);
        if version > 1 {
            return Err(AsicError::InvalidArg(format!(
                "invalid table version {version}"
            )));
        }
        let mut state = self.state.lock().unwrap();
        if state.version != version {
            let old = state.version as usize;
            state.drain[old] = state.drain_polls.unwrap_or(self.drain_polls);
            state.version = version;
            state.flips += 1;
            if self.audit {
                state.audit();
            }
        }
        Ok(())
    }

    fn version_counter(&self, dev: DevId, version: u8) -> AsicResult<u32> {
        self.check_dev(dev)?;
        unfurl!(self, version_counter);
        let mut state = self.state.lock().unwrap();
        let slot = state.drain.get_mut(version as usize).ok_or_else(|| {
            AsicError::InvalidArg(format!("invalid table version {version}"))
        })?;
        let remaining = *slot;
        *slot = slot.saturating_sub(1);
        Ok(remaining)
    }
}
