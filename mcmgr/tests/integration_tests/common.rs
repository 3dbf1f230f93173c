// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::sync::Arc;

use slog::Drain;

use aal::{make_port, DevId, DevPort, Mgid, TofinoFamily};
use asic::tofino_stub::{AsicConfig, StubHandle, TreeWalk};
use mcmgr::{McConfig, McMgr, McSession, PoolUsage, RdmCapacity};

pub type TestResult = Result<(), anyhow::Error>;

pub const DEV: DevId = 0;

pub fn test_log() -> slog::Logger {
    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

/// A device port, by physical pipe and index within the pipe.
pub fn port(pipe: u8, local: u16) -> DevPort {
    make_port(pipe, local)
}

/// A config with small pools and a drain wait that doesn't sleep.
pub fn small_config() -> McConfig {
    McConfig {
        drain_retry_limit: 20,
        drain_poll_interval_us: 0,
        rdm: RdmCapacity::uniform(256),
        ..Default::default()
    }
}

/// A manager with one stub device attached.  The manager owns one reference
/// to the stub; the test keeps another to look at the modelled hardware.
pub struct Harness {
    pub mgr: McMgr<Arc<StubHandle>>,
    pub stub: Arc<StubHandle>,
}

impl Harness {
    pub fn new(asic: AsicConfig, config: McConfig) -> anyhow::Result<Self> {
        let log = test_log();
        let stub = Arc::new(StubHandle::new(&log, DEV, &asic)?);
        let mgr = McMgr::new(&log, config)?;
        mgr.session().device_add(DEV, stub.clone())?;
        Ok(Harness { mgr, stub })
    }

    pub fn family(family: TofinoFamily) -> anyhow::Result<Self> {
        Self::new(AsicConfig::new(family), small_config())
    }

    pub fn session(&self) -> McSession<'_, Arc<StubHandle>> {
        self.mgr.session()
    }

    /// Confirm the most recent epoch, releasing everything deferred so far.
    pub fn settle(&self) -> anyhow::Result<()> {
        let epoch = self.stub.epoch();
        self.session().on_epoch_advanced(DEV, epoch)?;
        Ok(())
    }

    pub fn walk(&self, phys_pipe: u8, mgid: Mgid) -> TreeWalk {
        self.stub.walk(phys_pipe, mgid).unwrap()
    }

    pub fn usage(&self) -> Vec<PoolUsage> {
        self.session().rdm_usage(DEV).unwrap()
    }

    /// The modelled hardware never saw a broken structure, and the software
    /// model is self-consistent.
    pub fn assert_clean(&self) {
        assert_eq!(self.stub.violations(), Vec::<String>::new());
        self.session().audit(DEV).unwrap();
    }
}

pub fn harness() -> anyhow::Result<Harness> {
    Harness::family(TofinoFamily::Tofino2)
}
