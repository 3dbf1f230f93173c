// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;

use crate::{AsicError, AsicResult};

/// A device port number, as used by the replication engine.  The physical
/// pipe lives in bits 7 and above; the low 7 bits are the port's index within
/// that pipe.
pub type DevPort = u16;

/// Each pipe slice of a port bitmap covers this many ports.
pub const PORTS_PER_PIPE_SLICE: u16 = 72;

/// The widest pipe count of any supported device family.
pub const MAX_PIPES: usize = 8;

pub fn port_to_pipe(port: DevPort) -> u8 {
    (port >> 7) as u8
}

pub fn port_to_local_port(port: DevPort) -> u16 {
    port & 0x7F
}

pub fn make_port(pipe: u8, local: u16) -> DevPort {
    ((pipe as u16) << 7) | (local & 0x7F)
}

/// Returns true if the port's local index fits within a pipe slice of a port
/// bitmap.
pub fn port_is_valid(port: DevPort) -> bool {
    port_to_local_port(port) < PORTS_PER_PIPE_SLICE
        && (port_to_pipe(port) as usize) < MAX_PIPES
}

/// A port bitmap as held in an L2 port node or a LAG table row: one 72-bit
/// word per physical pipe slice.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PortBitmap {
    slices: [u128; MAX_PIPES],
}

impl PortBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bitmap from ports the caller has already checked with
    /// [`port_is_valid`].  Ports that don't fit are left out.
    pub fn from_ports<'a>(ports: impl IntoIterator<Item = &'a DevPort>) -> Self {
        let mut map = Self::new();
        for port in ports {
            let _ = map.set(*port);
        }
        map
    }

    pub fn set(&mut self, port: DevPort) -> AsicResult<()> {
        if !port_is_valid(port) {
            return Err(AsicError::InvalidArg(format!(
                "port {port} outside the port bitmap"
            )));
        }
        let pipe = port_to_pipe(port) as usize;
        self.slices[pipe] |= 1u128 << port_to_local_port(port);
        Ok(())
    }

    pub fn clear(&mut self, port: DevPort) {
        let pipe = port_to_pipe(port) as usize;
        let local = port_to_local_port(port);
        if local < PORTS_PER_PIPE_SLICE && pipe < MAX_PIPES {
            self.slices[pipe] &= !(1u128 << local);
        }
    }

    pub fn contains(&self, port: DevPort) -> bool {
        let pipe = port_to_pipe(port) as usize;
        let local = port_to_local_port(port);
        local < PORTS_PER_PIPE_SLICE
            && pipe < MAX_PIPES
            && self.slices[pipe] & (1u128 << local) != 0
    }

    /// The 72-bit word for a single physical pipe slice.
    pub fn slice(&self, pipe: u8) -> u128 {
        self.slices.get(pipe as usize).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.slices.iter().all(|s| *s == 0)
    }

    pub fn count(&self) -> usize {
        self.slices.iter().map(|s| s.count_ones() as usize).sum()
    }

    pub fn ports(&self) -> Vec<DevPort> {
        let mut list = Vec::new();
        for (pipe, slice) in self.slices.iter().enumerate() {
            for local in 0..PORTS_PER_PIPE_SLICE {
                if slice & (1u128 << local) != 0 {
                    list.push(make_port(pipe as u8, local));
                }
            }
        }
        list
    }
}

impl fmt::Debug for PortBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ports()).finish()
    }
}
