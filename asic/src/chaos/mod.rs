// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Fault injection for the software ASIC model.
//!
//! Every transport operation the replication manager consumes has its own
//! [`Chaos`] setting.  When one fires, the operation fails with
//! [`AsicError::Synthetic`] before it has any effect on the model.

use rand::random;
use serde::{Deserialize, Serialize};
use slog::Logger;

use aal::{AsicError, AsicResult};

/// When an operation should fail.
#[derive(Default, Debug, Serialize, Deserialize, Copy, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Chaos {
    #[default]
    Never,
    /// Fail each call with this probability, between 0.0 and 1.0.
    Probability(f64),
    /// Fail only the nth call from now, counting from 1.
    Nth(u32),
    Always,
}

impl Chaos {
    fn validate(&self, name: &str) -> AsicResult<()> {
        match self {
            Chaos::Probability(p) if !(0.0..=1.0).contains(p) => {
                Err(AsicError::InvalidArg(format!(
                    "{name}: probability {p} out of range"
                )))
            }
            Chaos::Nth(0) => Err(AsicError::InvalidArg(format!(
                "{name}: calls are counted from 1"
            ))),
            _ => Ok(()),
        }
    }

    /// Decide whether this call fails, returning a synthetic error if so.
    pub fn unfurled(&mut self, log: &Logger, message: &str) -> AsicResult<()> {
        let fire = match *self {
            Chaos::Never => false,
            Chaos::Always => true,
            // random() yields values in [0, 1), so 0.0 never fires
            Chaos::Probability(p) => p > random::<f64>(),
            Chaos::Nth(1) => {
                *self = Chaos::Never;
                true
            }
            Chaos::Nth(n) => {
                *self = Chaos::Nth(n - 1);
                false
            }
        };
        if fire {
            slog::error!(log, "chaos error: {}", message);
            return Err(AsicError::Synthetic(message.into()));
        }
        Ok(())
    }
}

/// Fault injection settings for each transport operation.
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ChaosConfig {
    pub write_list_append: Chaos,
    pub write_list_send: Chaos,
    pub table_version_flip: Chaos,
    pub version_counter: Chaos,
    /// Applies to appends of pipe and die vector table rows only.
    pub vector_table_write: Chaos,
}

impl ChaosConfig {
    /// Fail every operation with the same probability.
    pub fn uniform(p: f64) -> Self {
        Self {
            write_list_append: Chaos::Probability(p),
            write_list_send: Chaos::Probability(p),
            table_version_flip: Chaos::Probability(p),
            version_counter: Chaos::Probability(p),
            vector_table_write: Chaos::Probability(p),
        }
    }

    pub fn validate(&self) -> AsicResult<()> {
        self.write_list_append.validate("write_list_append")?;
        self.write_list_send.validate("write_list_send")?;
        self.table_version_flip.validate("table_version_flip")?;
        self.version_counter.validate("version_counter")?;
        self.vector_table_write.validate("vector_table_write")
    }
}

/// Roll the dice for one operation, returning early with the synthetic
/// error if it fires.  The `$name` is a [`ChaosConfig`] member, and the
/// `handle` must have `chaos` and `log` members.
macro_rules! unfurl {
    ($handle:ident, $name:ident) => {
        $handle
            .chaos
            .lock()
            .unwrap()
            .$name
            .unfurled(&$handle.log, stringify!($name))?
    };
}
pub(crate) use unfurl;
