// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Repair of single table entries after the hardware reports a corrected
//! memory error.  The entry is rewritten from the software shadow.

use serde::{Deserialize, Serialize};
use slog::{debug, warn};

use aal::{AsicOps, DevPort, LagId, McWrite, Mgid, PortBitmap};

use crate::batch::WriteBatch;
use crate::device::Device;
use crate::types::McResult;

/// The tables whose entries can be repaired.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    /// Tree roots.  The index is the physical pipe in bits 16 and up, and
    /// the MGID in the low 16 bits.
    Mit,
    /// Pipe vector table rows.
    Pvt,
    /// Die vector table rows.
    Tvt,
    /// LAG membership, by LAG id.
    Lit,
    /// Port protection, by port.
    Pmt,
}

impl<H: AsicOps> Device<H> {
    pub fn ecc_repair(&mut self, kind: TableKind, index: u32) -> McResult<()> {
        let mut batch = WriteBatch::new();
        let staged = match kind {
            TableKind::Mit => self.repair_mit(&mut batch, index),
            TableKind::Pvt => self.pvt.row(index).map(|value| {
                self.write_all_subdevs(
                    &mut batch,
                    McWrite::PvtRow { row: index, value },
                );
            }),
            TableKind::Tvt => {
                self.tvt.as_ref().and_then(|t| t.row(index)).map(|value| {
                    self.write_all_subdevs(
                        &mut batch,
                        McWrite::TvtRow { row: index, value },
                    );
                })
            }
            TableKind::Lit => LagId::try_from(index).ok().map(|lag_id| {
                let ports =
                    self.lags.get(&lag_id).copied().unwrap_or(PortBitmap::new());
                self.write_all_subdevs(
                    &mut batch,
                    McWrite::Lit { lag_id, ports },
                );
            }),
            TableKind::Pmt => DevPort::try_from(index)
                .ok()
                .filter(|port| self.check_port(*port).is_ok())
                .map(|port| {
                    let backup = self.backups.get(&port).copied();
                    self.write_all_subdevs(
                        &mut batch,
                        McWrite::Pmt { port, backup },
                    );
                }),
        };
        if staged.is_none() {
            // A spurious interrupt can report an index that doesn't exist.
            warn!(self.log, "ignoring ecc repair of bad index";
                "table" => %kind, "index" => index);
            return Ok(());
        }
        debug!(self.log, "ecc repair"; "table" => %kind, "index" => index);
        self.flush(batch)?;
        Ok(())
    }

    fn repair_mit(&self, batch: &mut WriteBatch, index: u32) -> Option<()> {
        let phys = u8::try_from(index >> 16).ok()?;
        let mgid = (index & 0xffff) as Mgid;
        let pipe = self.phys_to_log.get(&phys).copied()?;
        if self.check_mgid(mgid).is_err() {
            return None;
        }
        self.write_mit(batch, pipe, mgid);
        Some(())
    }
}
