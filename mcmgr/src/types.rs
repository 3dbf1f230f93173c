// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the multicast manager.

use std::convert;

use aal::AsicError;

pub type McResult<T> = Result<T, McError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum McError {
    #[error("ASIC error: {0}")]
    Switch(AsicError),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("Not enough resources: {0}")]
    NoResources(String),
    #[error("Resource is missing: {0}")]
    Missing(String),
    #[error("Resource already exists: {0}")]
    Exists(String),
    #[error("Manager is busy: {0}")]
    Busy(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl convert::From<AsicError> for McError {
    fn from(err: AsicError) -> Self {
        McError::Switch(err)
    }
}

impl McError {
    /// Wrap a hardware failure that happened after the software model had
    /// already been changed.
    pub(crate) fn hw_after_mutation(ctx: &str, err: AsicError) -> Self {
        McError::Internal(format!("{ctx}: {err}"))
    }
}
