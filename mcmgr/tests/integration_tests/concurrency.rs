// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::sync::Arc;
use std::thread;

use pretty_assertions::assert_eq;

use aal::TofinoFamily;
use asic::tofino_stub::{AsicConfig, StubHandle};
use mcmgr::{McError, McMgr};

use crate::integration_tests::common::{
    harness, port, small_config, test_log, TestResult, DEV,
};

#[test]
fn test_try_session_while_busy() -> TestResult {
    let h = harness()?;
    let s = h.session();
    thread::scope(|scope| {
        let busy = scope.spawn(|| h.mgr.try_session().map(|_| ()));
        assert!(matches!(busy.join().unwrap(), Err(McError::Busy(_))));
    });
    drop(s);
    assert!(h.mgr.try_session().is_ok());
    Ok(())
}

// Each thread attaches its own nodes to one shared MGID.  However the
// sessions interleave, every node ends up in the tree exactly once and the
// hardware never sees a half-built list.
#[test]
fn test_sessions_serialize() -> TestResult {
    let h = harness()?;
    let mgid = 500;
    thread::scope(|scope| {
        for t in 0..4u16 {
            let h = &h;
            scope.spawn(move || {
                for i in 0..8u16 {
                    let mut s = h.session();
                    let rid = t * 100 + i;
                    let node = s
                        .node_create(DEV, rid, &[port(t as u8, i)], &[])
                        .unwrap();
                    s.mgid_attach_node(DEV, mgid, node, None).unwrap();
                }
            });
        }
    });

    let mut s = h.session();
    for pipe in 0..4 {
        assert_eq!(s.mgid_tree(DEV, pipe, mgid)?.l1.len(), 8);
    }
    assert_eq!(s.pvt_get(DEV, mgid)?, 0b1111);
    drop(s);
    for pipe in 0..4 {
        assert_eq!(h.walk(pipe, mgid).l1.len(), 8);
    }
    h.assert_clean();
    Ok(())
}

#[test]
fn test_many_devices() -> TestResult {
    let log = test_log();
    let mgr = McMgr::new(&log, small_config())?;
    let t2 = Arc::new(StubHandle::new(
        &log,
        0,
        &AsicConfig::new(TofinoFamily::Tofino2),
    )?);
    let t3 = Arc::new(StubHandle::new(
        &log,
        1,
        &AsicConfig::new(TofinoFamily::Tofino3),
    )?);

    let mut s = mgr.session();
    s.device_add(0, t2.clone())?;
    s.device_add(1, t3.clone())?;
    assert!(matches!(
        s.device_add(1, t3.clone()),
        Err(McError::Exists(_))
    ));
    assert_eq!(s.devices(), vec![0, 1]);

    // Devices are independent: the same MGID can differ on each.
    let a = s.node_create(0, 1, &[port(0, 1)], &[])?;
    let b = s.node_create(1, 1, &[port(7, 1)], &[])?;
    s.mgid_attach_node(0, 9, a, None)?;
    s.mgid_attach_node(1, 9, b, None)?;
    assert_eq!(s.pvt_get(0, 9)?, 0b1);
    assert_eq!(s.pvt_get(1, 9)?, 1 << 7);

    s.device_remove(0)?;
    assert!(matches!(s.device_remove(0), Err(McError::Missing(_))));
    assert!(matches!(s.node_get(0, a), Err(McError::Missing(_))));
    assert_eq!(s.devices(), vec![1]);
    s.audit(1)?;

    // A removed device can come back, starting from scratch.
    s.device_add(0, t2)?;
    assert_eq!(s.pvt_get(0, 9)?, 0);
    Ok(())
}
