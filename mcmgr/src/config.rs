// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Configuration for the multicast manager.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rdm::NodeType;
use crate::types::{McError, McResult};

/// Number of MGIDs the replication engine supports.
pub const MGID_COUNT: u32 = 65536;

/// Maximum number of members in an ECMP group.
pub const MAX_ECMP_MEMBERS: u8 = 32;

/// Per-pipe sizes of the RDM pools, in records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RdmCapacity {
    pub l1_rid: u32,
    pub l1_ecmp: u32,
    pub l1_end: u32,
    pub vector: u32,
    pub port: u32,
    pub lag: u32,
}

impl Default for RdmCapacity {
    fn default() -> Self {
        RdmCapacity {
            l1_rid: 16384,
            l1_ecmp: 4096,
            l1_end: 8192,
            vector: 4096,
            port: 8192,
            lag: 8192,
        }
    }
}

impl RdmCapacity {
    /// A capacity with every pool the same size.
    pub fn uniform(size: u32) -> Self {
        RdmCapacity {
            l1_rid: size,
            l1_ecmp: size,
            l1_end: size,
            vector: size,
            port: size,
            lag: size,
        }
    }

    /// Size of a pool.  The tail region is sized from the tail table rather
    /// than configured here.
    pub fn size(&self, ty: NodeType) -> u32 {
        match ty {
            NodeType::L1Rid => self.l1_rid,
            NodeType::L1Ecmp => self.l1_ecmp,
            NodeType::L1End => self.l1_end,
            NodeType::Vector => self.vector,
            NodeType::Port => self.port,
            NodeType::Lag => self.lag,
            NodeType::Tail => 0,
        }
    }
}

/// The McConfig structure captures all of the run-time settings of the
/// manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct McConfig {
    /// Number of MGIDs to manage.
    pub mgid_count: u32,

    /// How many times to poll a table version's drain counter after a flip
    /// before giving up and proceeding.
    pub drain_retry_limit: u32,

    /// Delay between polls of the drain counter, in microseconds.
    pub drain_poll_interval_us: u64,

    /// Tail block sizes, overriding the device family's default table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail_sizes: Option<Vec<u8>>,

    /// RDM pool sizes, per pipe.
    pub rdm: RdmCapacity,
}

impl Default for McConfig {
    fn default() -> Self {
        McConfig {
            mgid_count: MGID_COUNT,
            drain_retry_limit: 1000,
            drain_poll_interval_us: 10,
            tail_sizes: None,
            rdm: RdmCapacity::default(),
        }
    }
}

impl McConfig {
    pub fn from_file(path: impl AsRef<Path>) -> McResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            McError::Invalid(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> McResult<Self> {
        let config: McConfig = toml::from_str(text)
            .map_err(|e| McError::Invalid(format!("parsing config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> McResult<()> {
        if self.mgid_count == 0 || self.mgid_count > MGID_COUNT {
            return Err(McError::Invalid(format!(
                "mgid_count must be between 1 and {MGID_COUNT}"
            )));
        }
        if let Some(sizes) = &self.tail_sizes {
            if sizes.windows(2).any(|w| w[0] >= w[1]) {
                return Err(McError::Invalid(
                    "tail sizes must be strictly ascending".into(),
                ));
            }
            if sizes.first().is_some_and(|s| *s < 2) {
                return Err(McError::Invalid(
                    "tail sizes must be at least 2".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_micros(self.drain_poll_interval_us)
    }
}
