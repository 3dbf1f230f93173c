// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Scenario files: a stub device description plus a list of operations to
//! run against it, in order.
//!
//! ```toml
//! [asic]
//! family = "tofino2"
//!
//! [[step]]
//! op = "node_create"
//! name = "a"
//! rid = 10
//! ports = [[0, 1], [1, 1]]
//!
//! [[step]]
//! op = "attach_node"
//! mgid = 5
//! node = "a"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use slog::{debug, info};

use aal::{make_port, AsicOps, DevPort, LagId, Mgid, Rid, Xid};
use asic::tofino_stub::{AsicConfig, StubHandle};
use mcmgr::{
    GroupHandle, GroupInfo, McConfig, McError, McMgr, McSession, NodeHandle,
    PoolUsage, TableKind, TreeInfo,
};

/// The only device a scenario drives.
pub const DEV: aal::DevId = 0;

/// A port, as `[pipe, index within the pipe]`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PortSpec(pub u8, pub u16);

impl From<PortSpec> for DevPort {
    fn from(p: PortSpec) -> Self {
        make_port(p.0, p.1)
    }
}

fn ports(specs: &[PortSpec]) -> Vec<DevPort> {
    specs.iter().map(|p| DevPort::from(*p)).collect()
}

#[derive(Debug, Clone, Deserialize, Serialize, strum::IntoStaticStr)]
#[serde(tag = "op", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Op {
    NodeCreate {
        name: String,
        rid: Rid,
        #[serde(default)]
        ports: Vec<PortSpec>,
        #[serde(default)]
        lags: Vec<LagId>,
    },
    NodeUpdate {
        name: String,
        #[serde(default)]
        ports: Vec<PortSpec>,
        #[serde(default)]
        lags: Vec<LagId>,
    },
    NodeDestroy {
        name: String,
    },
    AttachNode {
        mgid: Mgid,
        node: String,
        xid: Option<Xid>,
    },
    DetachNode {
        mgid: Mgid,
        node: String,
    },
    GroupCreate {
        name: String,
    },
    GroupDestroy {
        name: String,
    },
    AddMember {
        group: String,
        node: String,
    },
    RemoveMember {
        group: String,
        node: String,
    },
    AttachGroup {
        mgid: Mgid,
        group: String,
        xid: Option<Xid>,
    },
    DetachGroup {
        mgid: Mgid,
        group: String,
    },
    LagUpdate {
        lag: LagId,
        #[serde(default)]
        ports: Vec<PortSpec>,
    },
    BackupChanged {
        port: PortSpec,
        old: Option<PortSpec>,
        new: Option<PortSpec>,
    },
    PvtUpdate {
        mgid: Mgid,
        mask: u32,
    },
    TvtUpdate {
        mgid: Mgid,
        mask: u32,
    },
    EccRepair {
        table: TableKind,
        index: u32,
    },
    /// Confirm the most recent epoch, releasing deferred frees.
    Settle,
    Rebuild,
    Audit,
    /// Fail the nth allocation from now; omit `n` to stop.
    RdmChaos {
        n: Option<u32>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Step {
    #[serde(flatten)]
    pub op: Op,
    /// The step is expected to fail.
    #[serde(default)]
    pub fails: bool,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Scenario {
    pub asic: AsicConfig,
    /// Manager settings, taking the place of any given on the command line.
    pub config: Option<McConfig>,
    /// Settle after every step.
    pub auto_settle: bool,
    pub step: Vec<Step>,
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// One MGID's tree in one pipe.
#[derive(Debug, Serialize)]
pub struct TreeEntry {
    pub mgid: Mgid,
    pub pipe: u8,
    pub tree: TreeInfo,
}

#[derive(Debug, Serialize)]
pub struct GroupEntry {
    pub name: String,
    pub info: GroupInfo,
}

/// The state of the device once a scenario has run.
#[derive(Debug, Serialize)]
pub struct Report {
    pub steps: usize,
    pub expected_failures: usize,
    pub epoch: u64,
    pub table_version: u8,
    pub flips: u32,
    pub trees: Vec<TreeEntry>,
    pub groups: Vec<GroupEntry>,
    pub usage: Vec<PoolUsage>,
    pub pending_frees: usize,
    pub leaked_frees: usize,
    /// Problems the stub saw the dataplane run into.
    pub violations: Vec<String>,
}

struct Runner<'a> {
    log: &'a slog::Logger,
    stub: &'a StubHandle,
    nodes: BTreeMap<String, NodeHandle>,
    groups: BTreeMap<String, GroupHandle>,
    mgids: BTreeSet<Mgid>,
}

impl Runner<'_> {
    fn node(&self, name: &str) -> anyhow::Result<NodeHandle> {
        self.nodes
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("no node named {name:?}"))
    }

    fn group(&self, name: &str) -> anyhow::Result<GroupHandle> {
        self.groups
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("no group named {name:?}"))
    }

    // The outer error is a broken scenario; the inner one comes from the
    // manager and may be expected.
    fn apply(
        &mut self,
        s: &mut McSession<'_, Arc<StubHandle>>,
        op: &Op,
    ) -> anyhow::Result<Result<(), McError>> {
        let res = match op {
            Op::NodeCreate {
                name,
                rid,
                ports: p,
                lags,
            } => {
                if self.nodes.contains_key(name) {
                    bail!("node {name:?} already defined");
                }
                s.node_create(DEV, *rid, &ports(p), lags).map(|h| {
                    self.nodes.insert(name.clone(), h);
                })
            }
            Op::NodeUpdate {
                name,
                ports: p,
                lags,
            } => s.node_update(DEV, self.node(name)?, &ports(p), lags),
            Op::NodeDestroy { name } => {
                let h = self.node(name)?;
                s.node_destroy(DEV, h).map(|_| {
                    self.nodes.remove(name);
                })
            }
            Op::AttachNode { mgid, node, xid } => {
                self.mgids.insert(*mgid);
                s.mgid_attach_node(DEV, *mgid, self.node(node)?, *xid)
            }
            Op::DetachNode { mgid, node } => {
                s.mgid_detach_node(DEV, *mgid, self.node(node)?)
            }
            Op::GroupCreate { name } => {
                if self.groups.contains_key(name) {
                    bail!("group {name:?} already defined");
                }
                s.group_create(DEV).map(|h| {
                    self.groups.insert(name.clone(), h);
                })
            }
            Op::GroupDestroy { name } => {
                let h = self.group(name)?;
                s.group_destroy(DEV, h).map(|_| {
                    self.groups.remove(name);
                })
            }
            Op::AddMember { group, node } => {
                s.group_add_member(DEV, self.group(group)?, self.node(node)?)
            }
            Op::RemoveMember { group, node } => s.group_remove_member(
                DEV,
                self.group(group)?,
                self.node(node)?,
            ),
            Op::AttachGroup { mgid, group, xid } => {
                self.mgids.insert(*mgid);
                s.mgid_attach_group(DEV, *mgid, self.group(group)?, *xid)
            }
            Op::DetachGroup { mgid, group } => {
                s.mgid_detach_group(DEV, *mgid, self.group(group)?)
            }
            Op::LagUpdate { lag, ports: p } => {
                s.lag_update(DEV, *lag, &ports(p))
            }
            Op::BackupChanged { port, old, new } => s.backup_port_changed(
                DEV,
                (*port).into(),
                old.map(Into::into),
                new.map(Into::into),
            ),
            Op::PvtUpdate { mgid, mask } => {
                self.mgids.insert(*mgid);
                s.pvt_update(DEV, *mgid, *mask)
            }
            Op::TvtUpdate { mgid, mask } => s.tvt_update(DEV, *mgid, *mask),
            Op::EccRepair { table, index } => {
                s.ecc_repair(DEV, *table, *index)
            }
            Op::Settle => s.on_epoch_advanced(DEV, self.stub.epoch()),
            Op::Rebuild => s.rebuild_shadows(DEV),
            Op::Audit => s.audit(DEV),
            Op::RdmChaos { n } => s.rdm_chaos(DEV, *n),
        };
        Ok(res)
    }
}

/// Run a scenario from start to finish on a fresh stub device.
pub fn run(
    log: &slog::Logger,
    config: McConfig,
    scenario: &Scenario,
) -> anyhow::Result<Report> {
    let stub = Arc::new(StubHandle::new(log, DEV, &scenario.asic)?);
    let mgr = McMgr::new(log, config)?;
    mgr.session().device_add(DEV, stub.clone())?;

    let mut runner = Runner {
        log,
        stub: &stub,
        nodes: BTreeMap::new(),
        groups: BTreeMap::new(),
        mgids: BTreeSet::new(),
    };
    let mut expected_failures = 0;
    for (idx, step) in scenario.step.iter().enumerate() {
        let name: &'static str = (&step.op).into();
        let mut s = mgr.session();
        let res = runner
            .apply(&mut s, &step.op)
            .with_context(|| format!("step {idx} ({name})"))?;
        match (res, step.fails) {
            (Ok(()), false) => debug!(runner.log, "step done";
                "step" => idx, "op" => name),
            (Err(e), true) => {
                debug!(runner.log, "step failed as expected";
                    "step" => idx, "op" => name, "error" => %e);
                expected_failures += 1;
            }
            (Ok(()), true) => {
                bail!("step {idx} ({name}) succeeded but should have failed")
            }
            (Err(e), false) => {
                return Err(e).with_context(|| format!("step {idx} ({name})"))
            }
        }
        if scenario.auto_settle {
            s.on_epoch_advanced(DEV, stub.epoch())?;
        }
    }
    info!(log, "scenario complete"; "steps" => scenario.step.len());

    let s = mgr.session();
    let pipes = stub.num_active_pipes(DEV)?;
    let mut trees = Vec::new();
    for mgid in &runner.mgids {
        for pipe in 0..pipes {
            let tree = s.mgid_tree(DEV, pipe, *mgid)?;
            if !tree.l1.is_empty() {
                trees.push(TreeEntry {
                    mgid: *mgid,
                    pipe,
                    tree,
                });
            }
        }
    }
    let groups = runner
        .groups
        .iter()
        .map(|(name, g)| {
            Ok(GroupEntry {
                name: name.clone(),
                info: s.group_info(DEV, *g)?,
            })
        })
        .collect::<Result<Vec<_>, McError>>()?;

    Ok(Report {
        steps: scenario.step.len(),
        expected_failures,
        epoch: stub.epoch().0,
        table_version: s.table_version(DEV)?,
        flips: stub.flips(),
        trees,
        groups,
        usage: s.rdm_usage(DEV)?,
        pending_frees: s.pending_frees(DEV)?.len(),
        leaked_frees: s.leaked_frees(DEV)?,
        violations: stub.violations(),
    })
}
