// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use pretty_assertions::assert_eq;

use aal::TofinoFamily;
use asic::tofino_stub::AsicConfig;
use mcmgr::{L1Info, McConfig};

use crate::integration_tests::common::{
    harness, port, small_config, Harness, TestResult, DEV,
};

#[test]
fn test_tail_follows_longest_chain() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    s.lag_update(DEV, 1, &[port(0, 5)])?;
    s.lag_update(DEV, 2, &[port(0, 6)])?;
    let a = s.node_create(DEV, 1, &[port(0, 1)], &[])?;
    let b = s.node_create(DEV, 2, &[port(0, 2)], &[1])?;
    let c = s.node_create(DEV, 3, &[port(0, 3)], &[1, 2])?;

    s.mgid_attach_node(DEV, 20, a, None)?;
    let tree = s.mgid_tree(DEV, 0, 20)?;
    assert_eq!((tree.len, tree.tail), (1, None));

    s.mgid_attach_node(DEV, 20, b, None)?;
    let tree = s.mgid_tree(DEV, 0, 20)?;
    assert_eq!((tree.len, tree.tail), (2, Some(2)));
    drop(s);
    assert_eq!(h.walk(0, 20).tail, Some(2));

    let mut s = h.session();
    s.mgid_attach_node(DEV, 20, c, None)?;
    let tree = s.mgid_tree(DEV, 0, 20)?;
    assert_eq!((tree.len, tree.tail), (3, Some(4)));
    drop(s);
    assert_eq!(h.walk(0, 20).tail, Some(4));
    h.assert_clean();

    // A shorter tree keeps the larger tail until the epoch completes.
    let mut s = h.session();
    s.mgid_detach_node(DEV, 20, c)?;
    let tree = s.mgid_tree(DEV, 0, 20)?;
    assert_eq!((tree.len, tree.tail, tree.shrink_pending), (2, Some(4), true));
    drop(s);
    assert_eq!(h.walk(0, 20).tail, Some(4));
    h.assert_clean();

    h.settle()?;
    let tree = h.session().mgid_tree(DEV, 0, 20)?;
    assert_eq!((tree.len, tree.tail, tree.shrink_pending), (2, Some(2), false));
    assert_eq!(h.walk(0, 20).tail, Some(2));

    // Down to a single port node: no tail at all.
    h.session().mgid_detach_node(DEV, 20, b)?;
    h.settle()?;
    let tree = h.session().mgid_tree(DEV, 0, 20)?;
    assert_eq!((tree.len, tree.tail), (1, None));
    assert_eq!(h.walk(0, 20).tail, None);
    h.assert_clean();
    Ok(())
}

#[test]
fn test_shrinking_node_update() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    s.lag_update(DEV, 1, &[port(0, 5)])?;
    s.lag_update(DEV, 2, &[port(0, 6)])?;
    let a = s.node_create(DEV, 1, &[port(0, 1)], &[1, 2])?;
    s.mgid_attach_node(DEV, 21, a, None)?;
    assert_eq!(s.mgid_tree(DEV, 0, 21)?.tail, Some(4));

    s.node_update(DEV, a, &[port(0, 1)], &[])?;
    let tree = s.mgid_tree(DEV, 0, 21)?;
    assert_eq!((tree.len, tree.tail, tree.shrink_pending), (1, Some(4), true));

    // Growing again before the epoch cancels the shrink.
    s.node_update(DEV, a, &[port(0, 1)], &[1])?;
    let tree = s.mgid_tree(DEV, 0, 21)?;
    assert_eq!((tree.len, tree.tail, tree.shrink_pending), (2, Some(4), true));
    drop(s);

    h.settle()?;
    let tree = h.session().mgid_tree(DEV, 0, 21)?;
    assert_eq!((tree.len, tree.tail, tree.shrink_pending), (2, Some(2), false));
    assert_eq!(h.walk(0, 21).tail, Some(2));
    h.assert_clean();
    Ok(())
}

#[test]
fn test_back_to_back_shrinks() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    for lag in 1..=4u8 {
        s.lag_update(DEV, lag, &[port(0, 10 + lag as u16)])?;
    }
    let x = s.node_create(DEV, 1, &[port(0, 1)], &[1, 2, 3, 4])?;
    let w = s.node_create(DEV, 2, &[port(0, 2)], &[1, 2])?;
    let y = s.node_create(DEV, 3, &[port(0, 3)], &[])?;
    for node in [y, w, x] {
        s.mgid_attach_node(DEV, 24, node, None)?;
    }
    assert_eq!(s.mgid_tree(DEV, 0, 24)?.tail, Some(8));
    drop(s);
    h.settle()?;

    h.session().mgid_detach_node(DEV, 24, x)?;
    let first = h.stub.epoch();
    h.session().mgid_detach_node(DEV, 24, w)?;
    let second = h.stub.epoch();
    assert!(first < second);

    // Only x's chain has drained.  w's chain of three is still reachable
    // through the write list that removed it.
    h.session().on_epoch_advanced(DEV, first)?;
    let tree = h.session().mgid_tree(DEV, 0, 24)?;
    assert_eq!((tree.len, tree.tail, tree.shrink_pending), (1, Some(4), true));
    assert_eq!(h.walk(0, 24).tail, Some(4));
    h.assert_clean();

    h.session().on_epoch_advanced(DEV, second)?;
    let tree = h.session().mgid_tree(DEV, 0, 24)?;
    assert_eq!((tree.len, tree.tail, tree.shrink_pending), (1, None, false));
    assert_eq!(h.walk(0, 24).tail, None);
    h.assert_clean();
    Ok(())
}

#[test]
fn test_chain_longer_than_255() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    let lags: Vec<u8> = (0..=255u8).collect();
    for lag in &lags {
        s.lag_update(DEV, *lag, &[port(0, 8 + (*lag as u16 % 32))])?;
    }
    let a = s.node_create(DEV, 1, &[port(0, 1)], &lags)?;
    s.mgid_attach_node(DEV, 7, a, None)?;
    let tree = s.mgid_tree(DEV, 0, 7)?;
    assert_eq!((tree.len, tree.tail), (257, Some(32)));
    assert!(matches!(tree.l1[..], [L1Info::Rid { chain_len: 257, .. }]));
    drop(s);
    assert_eq!(h.walk(0, 7).tail, Some(32));
    h.assert_clean();
    Ok(())
}

#[test]
fn test_tree_longer_than_largest_tail() -> TestResult {
    let config = McConfig {
        tail_sizes: Some(vec![2, 4]),
        ..small_config()
    };
    let h = Harness::new(AsicConfig::new(TofinoFamily::Tofino2), config)?;
    let mut s = h.session();
    for lag in 1..=5u8 {
        s.lag_update(DEV, lag, &[port(0, 10 + lag as u16)])?;
    }
    let a = s.node_create(DEV, 1, &[port(0, 1)], &[1, 2, 3, 4, 5])?;
    s.mgid_attach_node(DEV, 22, a, None)?;
    let tree = s.mgid_tree(DEV, 0, 22)?;
    assert_eq!((tree.len, tree.tail), (6, Some(4)));
    drop(s);
    assert_eq!(h.walk(0, 22).tail, Some(4));
    h.assert_clean();
    Ok(())
}

#[test]
fn test_ecmp_members_count_toward_tail() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    s.lag_update(DEV, 3, &[port(1, 7)])?;
    let m = s.node_create(DEV, 1, &[port(1, 1)], &[3])?;
    let g = s.group_create(DEV)?;
    s.group_add_member(DEV, g, m)?;
    s.mgid_attach_group(DEV, 30, g, None)?;
    let tree = s.mgid_tree(DEV, 1, 30)?;
    assert_eq!((tree.len, tree.tail), (2, Some(2)));
    drop(s);
    assert_eq!(h.walk(1, 30).tail, Some(2));
    h.assert_clean();
    Ok(())
}

#[test]
fn test_no_tails_on_tofino1() -> TestResult {
    let config = McConfig {
        tail_sizes: Some(vec![2, 4]),
        ..small_config()
    };
    let h = Harness::new(AsicConfig::new(TofinoFamily::Tofino1), config)?;
    let mut s = h.session();
    s.lag_update(DEV, 1, &[port(0, 5)])?;
    s.lag_update(DEV, 2, &[port(0, 6)])?;
    let a = s.node_create(DEV, 1, &[port(0, 1)], &[1, 2])?;
    s.mgid_attach_node(DEV, 23, a, None)?;
    let tree = s.mgid_tree(DEV, 0, 23)?;
    assert_eq!((tree.len, tree.tail), (3, None));
    drop(s);
    assert_eq!(h.walk(0, 23).tail, None);
    h.assert_clean();
    Ok(())
}
