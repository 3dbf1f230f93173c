// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt::Debug;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use aal::{Epoch, TofinoFamily};
use asic::chaos::{Chaos, ChaosConfig};
use asic::tofino_stub::{AsicConfig, StubHandle};
use mcmgr::{
    Deferred, GroupHandle, GroupInfo, McConfig, McError, McResult, McSession,
    NodeType, RdmCapacity,
};

use crate::integration_tests::common::{
    harness, port, small_config, Harness, TestResult, DEV,
};

type Session<'a> = McSession<'a, Arc<StubHandle>>;

/// Run `op` with the `n`th allocation failing, for n = 1, 2, ... until it
/// succeeds.  Every failed attempt must leave the pools and whatever
/// `snapshot` captures exactly as they were.  Returns the number of failed
/// attempts.
fn sweep<T, S, F>(h: &Harness, snapshot: S, mut op: F) -> anyhow::Result<u32>
where
    T: PartialEq + Debug,
    S: Fn(&Session<'_>) -> McResult<T>,
    F: FnMut(&mut Session<'_>) -> McResult<()>,
{
    for n in 1..100 {
        let mut s = h.session();
        let state = snapshot(&s)?;
        let usage = s.rdm_usage(DEV)?;
        s.rdm_chaos(DEV, Some(n))?;
        let res = op(&mut s);
        s.rdm_chaos(DEV, None)?;
        match res {
            Ok(()) => {
                drop(s);
                h.assert_clean();
                return Ok(n - 1);
            }
            Err(McError::NoResources(_)) => {
                assert_eq!(s.rdm_usage(DEV)?, usage, "attempt {n}");
                assert_eq!(snapshot(&s)?, state, "attempt {n}");
                drop(s);
                h.assert_clean();
            }
            Err(e) => return Err(e.into()),
        }
    }
    anyhow::bail!("operation never succeeded")
}

fn group_state(
    s: &Session<'_>,
    g: GroupHandle,
) -> McResult<(GroupInfo, u32, u32)> {
    Ok((s.group_info(DEV, g)?, s.pvt_get(DEV, 20)?, s.pvt_get(DEV, 21)?))
}

#[test]
fn test_attach_without_resources() -> TestResult {
    let h = harness()?;
    let (a, b) = {
        let mut s = h.session();
        s.lag_update(DEV, 1, &[port(2, 9)])?;
        let a = s.node_create(DEV, 1, &[port(0, 1), port(1, 1)], &[1])?;
        let b = s.node_create(DEV, 2, &[port(0, 2)], &[])?;
        s.mgid_attach_node(DEV, 10, b, None)?;
        (a, b)
    };

    let failures = sweep(
        &h,
        |s| {
            Ok((
                s.node_get(DEV, a)?,
                s.pvt_get(DEV, 10)?,
                (0..4)
                    .map(|pipe| s.mgid_tree(DEV, pipe, 10))
                    .collect::<McResult<Vec<_>>>()?,
            ))
        },
        |s| s.mgid_attach_node(DEV, 10, a, None),
    )?;
    // An L1 node in each of three pipes, two port nodes and a LAG node.
    assert_eq!(failures, 6);
    assert_eq!(h.session().pvt_get(DEV, 10)?, 0b111);
    assert!(h.session().node_get(DEV, b)?.attached.is_some());
    Ok(())
}

#[test]
fn test_update_without_resources() -> TestResult {
    let h = harness()?;
    let a = {
        let mut s = h.session();
        let a = s.node_create(DEV, 1, &[port(0, 1)], &[])?;
        s.mgid_attach_node(DEV, 11, a, None)?;
        a
    };
    let failures = sweep(
        &h,
        |s| Ok((s.node_get(DEV, a)?, s.pvt_get(DEV, 11)?)),
        |s| s.node_update(DEV, a, &[port(0, 1), port(3, 1)], &[]),
    )?;
    assert!(failures > 0);
    assert_eq!(h.session().pvt_get(DEV, 11)?, 0b1001);
    Ok(())
}

#[test]
fn test_group_changes_without_resources() -> TestResult {
    let h = harness()?;
    let (g, nodes) = {
        let mut s = h.session();
        let g = s.group_create(DEV)?;
        let nodes = (0..3u16)
            .map(|i| s.node_create(DEV, i, &[port(i as u8, 1)], &[]))
            .collect::<McResult<Vec<_>>>()?;
        s.group_add_member(DEV, g, nodes[0])?;
        (g, nodes)
    };

    let failures = sweep(
        &h,
        |s| group_state(s, g),
        |s| s.mgid_attach_group(DEV, 20, g, None),
    )?;
    assert!(failures > 0);
    let failures = sweep(
        &h,
        |s| group_state(s, g),
        |s| s.group_add_member(DEV, g, nodes[1]),
    )?;
    assert!(failures > 0);
    let failures = sweep(
        &h,
        |s| group_state(s, g),
        |s| s.mgid_attach_group(DEV, 21, g, None),
    )?;
    assert!(failures > 0);
    let failures = sweep(
        &h,
        |s| group_state(s, g),
        |s| s.group_add_member(DEV, g, nodes[2]),
    )?;
    assert!(failures > 0);
    assert_eq!(h.session().group_info(DEV, g)?.valid_map, 0b111);
    assert_eq!(h.session().pvt_get(DEV, 21)?, 0b111);

    // Shrinking a group's blocks needs nothing new.
    let failures = sweep(
        &h,
        |s| group_state(s, g),
        |s| s.group_remove_member(DEV, g, nodes[2]),
    )?;
    assert_eq!(failures, 0);
    Ok(())
}

#[test]
fn test_pool_exhaustion() -> TestResult {
    let config = McConfig {
        rdm: RdmCapacity::uniform(4),
        ..small_config()
    };
    let h = Harness::new(AsicConfig::new(TofinoFamily::Tofino2), config)?;
    let mut s = h.session();
    let nodes = (0..5u16)
        .map(|i| s.node_create(DEV, i, &[port(0, i)], &[]))
        .collect::<McResult<Vec<_>>>()?;
    for (i, node) in nodes[..4].iter().enumerate() {
        s.mgid_attach_node(DEV, i as u16, *node, None)?;
    }
    assert!(matches!(
        s.mgid_attach_node(DEV, 4, nodes[4], None),
        Err(McError::NoResources(_))
    ));

    // A freed L1 node isn't reusable until the epoch completes.
    s.mgid_detach_node(DEV, 0, nodes[0])?;
    assert!(matches!(
        s.mgid_attach_node(DEV, 4, nodes[4], None),
        Err(McError::NoResources(_))
    ));
    drop(s);
    h.settle()?;
    h.session().mgid_attach_node(DEV, 4, nodes[4], None)?;

    let rid = h
        .usage()
        .into_iter()
        .find(|u| u.pipe == 0 && u.node_type == NodeType::L1Rid)
        .unwrap();
    assert_eq!((rid.size, rid.free), (4, 0));
    h.assert_clean();
    Ok(())
}

#[test]
fn test_deferred_frees_wait_for_epoch() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    let a = s.node_create(DEV, 1, &[port(1, 1)], &[])?;
    s.mgid_attach_node(DEV, 3, a, None)?;
    s.mgid_detach_node(DEV, 3, a)?;
    let epoch = s.last_epoch(DEV)?;
    assert_eq!(epoch, h.stub.epoch());
    let pending = s.pending_frees(DEV)?;
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|(e, d)| {
        *e == epoch && matches!(d, Deferred::Free { pipe: 1, .. })
    }));

    // An earlier epoch doesn't cover the detach.
    s.on_epoch_advanced(DEV, Epoch(epoch.0 - 1))?;
    assert_eq!(s.pending_frees(DEV)?.len(), 2);
    s.on_epoch_advanced(DEV, epoch)?;
    assert!(s.pending_frees(DEV)?.is_empty());
    // A repeated callback is harmless.
    s.on_epoch_advanced(DEV, epoch)?;
    drop(s);
    assert!(h.usage().iter().all(|u| u.free == u.size));
    Ok(())
}

#[test]
fn test_failed_send_leaks_frees() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    let a = s.node_create(DEV, 1, &[port(0, 1)], &[])?;
    s.mgid_attach_node(DEV, 7, a, None)?;
    drop(s);
    let root = h.stub.mit_root(0, 7);

    h.stub.set_chaos(ChaosConfig {
        write_list_send: Chaos::Always,
        ..Default::default()
    })?;
    let mut s = h.session();
    assert!(matches!(
        s.mgid_detach_node(DEV, 7, a),
        Err(McError::Internal(_))
    ));
    assert_eq!(s.leaked_frees(DEV)?, 2);
    assert!(s.pending_frees(DEV)?.is_empty());
    assert_eq!(s.node_get(DEV, a)?.attached, None);
    // The shadow still describes what the hardware holds.
    assert_eq!(s.pvt_get(DEV, 7)?, 0b1);
    drop(s);
    assert_eq!(h.stub.mit_root(0, 7), root);
    assert_eq!(h.stub.violations(), Vec::<String>::new());

    h.stub.set_chaos(ChaosConfig::default())?;
    h.session().rebuild_shadows(DEV)?;
    assert_eq!(h.session().pvt_get(DEV, 7)?, 0);
    assert_eq!(h.stub.pvt_row(0, 0), 0);
    h.assert_clean();
    Ok(())
}

#[test]
fn test_failed_append_is_a_switch_error() -> TestResult {
    let h = harness()?;
    h.stub.set_chaos(ChaosConfig {
        write_list_append: Chaos::Always,
        ..Default::default()
    })?;
    let mut s = h.session();
    // Nothing to write, so nothing to fail.
    s.lag_update(DEV, 3, &[])?;
    assert!(matches!(
        s.pvt_update(DEV, 3, 0b1),
        Err(McError::Switch(_))
    ));
    assert_eq!(s.pvt_get(DEV, 3)?, 0);
    Ok(())
}

#[test]
fn test_device_add_fails_cleanly() -> TestResult {
    let log = crate::integration_tests::common::test_log();
    let stub = Arc::new(StubHandle::new(
        &log,
        DEV,
        &AsicConfig::new(TofinoFamily::Tofino2),
    )?);
    stub.set_chaos(ChaosConfig {
        write_list_send: Chaos::Always,
        ..Default::default()
    })?;
    let mgr = mcmgr::McMgr::new(&log, small_config())?;
    let mut s = mgr.session();
    assert!(matches!(
        s.device_add(DEV, stub.clone()),
        Err(McError::Switch(_))
    ));
    assert!(s.devices().is_empty());

    stub.set_chaos(ChaosConfig::default())?;
    s.device_add(DEV, stub)?;
    assert_eq!(s.devices(), vec![DEV]);
    Ok(())
}
