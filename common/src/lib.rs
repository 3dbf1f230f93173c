// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Utilities shared by the multicast manager crates.

pub mod logging;

/// Render a bitmask of pipes (or dies) as a compact list, e.g. `{0,2,3}`.
pub fn mask_to_string(mask: u32) -> String {
    let bits: Vec<String> = (0..32)
        .filter(|b| mask & (1 << b) != 0)
        .map(|b| b.to_string())
        .collect();
    format!("{{{}}}", bits.join(","))
}

#[test]
fn test_mask_to_string() {
    assert_eq!(mask_to_string(0), "{}");
    assert_eq!(mask_to_string(0b1011), "{0,1,3}");
}
