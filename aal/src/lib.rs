// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The ASIC abstraction layer consumed by the multicast replication manager.
//!
//! The manager owns the replication trees, but it never touches the device
//! directly.  Everything it needs from the hardware side is described by the
//! [`AsicOps`] trait: a handful of topology queries, a write list onto which
//! typed register and RDM writes are staged and then pushed as a single
//! transaction, and the table-version flip used for double-buffered cutover.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod family;
pub use family::*;

mod ports;
pub use ports::*;

mod records;
pub use records::*;

/// Identifies a single device managed by the caller.
pub type DevId = u8;

/// A specialized Result type for ASIC operations
pub type AsicResult<T> = Result<T, AsicError>;

/// Error type conveying additional information about ASIC errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AsicError {
    /// An argument passed to the ASIC layer is invalid or inappropriate.  This
    /// indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// An Asic function was called before the ASIC layer was properly
    /// initialized.  Indicates misbehavior from the caller.
    #[error("ASIC layer uninitialized: {}", .0)]
    Uninitialized(String),
    /// This operation is unsupported by the ASIC model being used
    #[error("Operation unsupported by the ASIC")]
    OperationUnsupported,
    /// The ASIC layer detected some internal inconsistency
    #[error("Internal error: {}", .0)]
    Internal(String),
    /// An error derived from a purposely triggered synthetic fault for testing
    /// purposes.
    #[error("Synthetic ASIC error: {}", .0)]
    Synthetic(String),
    /// A general indication that a caller is trying to modify something that
    /// is not present.
    #[error("Missing: {}", .0)]
    Missing(String),
}

/// A token naming one RDM-change event.  Every successful write-list send
/// returns the epoch whose completion confirms that packets which could have
/// observed the structures replaced by that write list have drained.  Epochs
/// are strictly increasing per device.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
    Deserialize, Serialize,
)]
pub struct Epoch(pub u64);

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "epoch{}", self.0)
    }
}

/// The `AsicOps` trait contains every operation the multicast manager
/// consumes from the layers beneath it.
pub trait AsicOps {
    /// Reports the generation of the device.
    fn family(&self, dev: DevId) -> AsicResult<TofinoFamily>;

    /// Returns the number of active pipes on the device.
    fn num_active_pipes(&self, dev: DevId) -> AsicResult<u8>;

    /// Maps a logical pipe number to the physical pipe that backs it.
    fn logical_to_physical_pipe(&self, dev: DevId, pipe: u8) -> AsicResult<u8>;

    /// Returns the number of subdevices (dies) making up the device.
    fn num_subdevices(&self, dev: DevId) -> AsicResult<u8>;

    /// Returns the number of physical pipes on each subdevice.
    fn pipes_per_subdevice(&self, dev: DevId) -> AsicResult<u8>;

    /// Stage a single write on the device's write list.  Nothing reaches the
    /// hardware until the list is sent.
    fn write_list_append(
        &self,
        dev: DevId,
        subdev: u8,
        write: McWrite,
    ) -> AsicResult<()>;

    /// Push every staged write to the hardware as one transaction.
    fn write_list_send(&self, dev: DevId) -> AsicResult<Epoch>;

    /// Drop any writes staged since the last send.
    fn write_list_discard(&self, dev: DevId);

    /// Select which copy of the double-buffered tables the dataplane uses.
    fn table_version_flip(&self, dev: DevId, version: u8) -> AsicResult<()>;

    /// Returns the number of packets still in flight that were admitted under
    /// the given table version.
    fn version_counter(&self, dev: DevId, version: u8) -> AsicResult<u32>;
}

impl<T: AsicOps + ?Sized> AsicOps for Arc<T> {
    fn family(&self, dev: DevId) -> AsicResult<TofinoFamily> {
        (**self).family(dev)
    }

    fn num_active_pipes(&self, dev: DevId) -> AsicResult<u8> {
        (**self).num_active_pipes(dev)
    }

    fn logical_to_physical_pipe(&self, dev: DevId, pipe: u8) -> AsicResult<u8> {
        (**self).logical_to_physical_pipe(dev, pipe)
    }

    fn num_subdevices(&self, dev: DevId) -> AsicResult<u8> {
        (**self).num_subdevices(dev)
    }

    fn pipes_per_subdevice(&self, dev: DevId) -> AsicResult<u8> {
        (**self).pipes_per_subdevice(dev)
    }

    fn write_list_append(
        &self,
        dev: DevId,
        subdev: u8,
        write: McWrite,
    ) -> AsicResult<()> {
        (**self).write_list_append(dev, subdev, write)
    }

    fn write_list_send(&self, dev: DevId) -> AsicResult<Epoch> {
        (**self).write_list_send(dev)
    }

    fn write_list_discard(&self, dev: DevId) {
        (**self).write_list_discard(dev)
    }

    fn table_version_flip(&self, dev: DevId, version: u8) -> AsicResult<()> {
        (**self).table_version_flip(dev, version)
    }

    fn version_counter(&self, dev: DevId, version: u8) -> AsicResult<u32> {
        (**self).version_counter(dev, version)
    }
}
