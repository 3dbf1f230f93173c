// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use pretty_assertions::assert_eq;

use aal::PortBitmap;
use asic::tofino_stub::{L2Hop, Replica};
use mcmgr::{EcmpTransition, McError};

use crate::integration_tests::common::{harness, port, TestResult, DEV};

#[test]
fn test_backup_port_adds_pipe() -> TestResult {
    let h = harness()?;
    let protected = port(0, 1);
    let backup = port(2, 1);
    let mut s = h.session();
    let a = s.node_create(DEV, 4, &[protected], &[])?;
    s.mgid_attach_node(DEV, 12, a, None)?;
    assert_eq!(s.pvt_get(DEV, 12)?, 0b001);

    s.backup_port_changed(DEV, protected, None, Some(backup))?;
    assert_eq!(s.pvt_get(DEV, 12)?, 0b101);
    assert_eq!(s.node_get(DEV, a)?.pipes, vec![0, 2]);
    drop(s);

    // The backup pipe replicates to the protected port; the port mirror
    // table steers those copies out the backup.
    assert_eq!(
        h.walk(2, 12).l1,
        vec![Replica::Rid {
            rid: 4,
            xid: None,
            l2: vec![L2Hop::Ports(PortBitmap::from_ports(&[protected]))],
        }]
    );
    assert_eq!(h.stub.pmt(protected), Some(backup));
    h.assert_clean();

    let mut s = h.session();
    assert!(matches!(
        s.backup_port_changed(DEV, protected, None, Some(port(3, 1))),
        Err(McError::Invalid(_))
    ));
    assert!(matches!(
        s.backup_port_changed(DEV, protected, Some(port(3, 1)), None),
        Err(McError::Invalid(_))
    ));
    assert!(matches!(
        s.backup_port_changed(DEV, protected, Some(backup), Some(port(0, 100))),
        Err(McError::Invalid(_))
    ));
    // Repeating the current state is fine.
    s.backup_port_changed(DEV, protected, Some(backup), Some(backup))?;

    s.backup_port_changed(DEV, protected, Some(backup), None)?;
    assert_eq!(s.pvt_get(DEV, 12)?, 0b001);
    assert!(s.mgid_tree(DEV, 2, 12)?.l1.is_empty());
    drop(s);
    assert_eq!(h.stub.pmt(protected), None);
    h.assert_clean();
    Ok(())
}

#[test]
fn test_backup_in_same_pipe() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    let a = s.node_create(DEV, 4, &[port(1, 1)], &[])?;
    s.mgid_attach_node(DEV, 12, a, None)?;
    let tree = s.mgid_tree(DEV, 1, 12)?;

    s.backup_port_changed(DEV, port(1, 1), None, Some(port(1, 2)))?;
    assert_eq!(s.pvt_get(DEV, 12)?, 0b10);
    assert_eq!(s.mgid_tree(DEV, 1, 12)?, tree);
    drop(s);
    assert_eq!(h.stub.pmt(port(1, 1)), Some(port(1, 2)));
    h.assert_clean();
    Ok(())
}

#[test]
fn test_backup_for_group_member() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    let g = s.group_create(DEV)?;
    let m = s.node_create(DEV, 8, &[port(1, 1)], &[])?;
    s.group_add_member(DEV, g, m)?;
    s.mgid_attach_group(DEV, 13, g, None)?;
    assert_eq!(s.pvt_get(DEV, 13)?, 0b0010);

    s.backup_port_changed(DEV, port(1, 1), None, Some(port(3, 1)))?;
    let info = s.group_info(DEV, g)?;
    assert_eq!(info.last_transition, Some(EcmpTransition::Refresh));
    assert_eq!(info.pipes.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(s.pvt_get(DEV, 13)?, 0b1010);
    drop(s);

    match &h.walk(3, 13).l1[..] {
        [Replica::Ecmp { members, .. }] => assert_eq!(
            members,
            &vec![(
                0,
                8,
                vec![L2Hop::Ports(PortBitmap::from_ports(&[port(1, 1)]))]
            )]
        ),
        other => panic!("unexpected tree {other:?}"),
    }
    h.assert_clean();
    Ok(())
}

#[test]
fn test_backup_without_resources() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    let a = s.node_create(DEV, 4, &[port(0, 1)], &[])?;
    s.mgid_attach_node(DEV, 12, a, None)?;
    let before = s.rdm_usage(DEV)?;

    s.rdm_chaos(DEV, Some(1))?;
    assert!(matches!(
        s.backup_port_changed(DEV, port(0, 1), None, Some(port(2, 1))),
        Err(McError::NoResources(_))
    ));
    s.rdm_chaos(DEV, None)?;
    assert_eq!(s.rdm_usage(DEV)?, before);
    assert_eq!(s.pvt_get(DEV, 12)?, 0b001);
    drop(s);
    assert_eq!(h.stub.pmt(port(0, 1)), None);
    h.assert_clean();

    // Nothing was recorded, so the same change can be made again.
    h.session()
        .backup_port_changed(DEV, port(0, 1), None, Some(port(2, 1)))?;
    assert_eq!(h.session().pvt_get(DEV, 12)?, 0b101);
    Ok(())
}

#[test]
fn test_lag_membership() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    s.lag_update(DEV, 1, &[port(0, 5), port(1, 5)])?;
    let a = s.node_create(DEV, 2, &[], &[1])?;
    s.mgid_attach_node(DEV, 14, a, None)?;
    assert_eq!(s.pvt_get(DEV, 14)?, 0b0011);
    drop(s);
    assert_eq!(
        h.walk(0, 14).l1,
        vec![Replica::Rid {
            rid: 2,
            xid: None,
            l2: vec![L2Hop::Lag(1)],
        }]
    );
    assert_eq!(
        h.stub.lit(1),
        PortBitmap::from_ports(&[port(0, 5), port(1, 5)])
    );

    let mut s = h.session();
    s.lag_update(DEV, 1, &[port(1, 5)])?;
    assert_eq!(s.pvt_get(DEV, 14)?, 0b0010);
    assert!(s.mgid_tree(DEV, 0, 14)?.l1.is_empty());

    s.lag_update(DEV, 1, &[port(1, 5), port(2, 5)])?;
    assert_eq!(s.pvt_get(DEV, 14)?, 0b0110);

    assert!(matches!(
        s.lag_update(DEV, 1, &[port(7, 5)]),
        Err(McError::Invalid(_))
    ));
    assert_eq!(s.pvt_get(DEV, 14)?, 0b0110);

    // An empty LAG takes the trees with it, but the node stays attached.
    s.lag_update(DEV, 1, &[])?;
    assert_eq!(s.pvt_get(DEV, 14)?, 0);
    assert!(s.node_get(DEV, a)?.attached.is_some());
    drop(s);
    assert!(h.stub.lit(1).is_empty());
    h.assert_clean();

    h.session().lag_update(DEV, 1, &[port(3, 5)])?;
    assert_eq!(h.session().pvt_get(DEV, 14)?, 0b1000);
    assert_eq!(h.walk(3, 14).l1.len(), 1);
    h.assert_clean();
    Ok(())
}

#[test]
fn test_lag_member_backup() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    s.lag_update(DEV, 9, &[port(0, 5)])?;
    let a = s.node_create(DEV, 2, &[], &[9])?;
    s.mgid_attach_node(DEV, 15, a, None)?;
    assert_eq!(s.pvt_get(DEV, 15)?, 0b0001);

    // The LAG's member is protected by a port in pipe 3, so the LAG is
    // carried there too.
    s.backup_port_changed(DEV, port(0, 5), None, Some(port(3, 5)))?;
    assert_eq!(s.pvt_get(DEV, 15)?, 0b1001);
    drop(s);
    assert_eq!(h.walk(3, 15).l1.len(), 1);
    h.assert_clean();
    Ok(())
}
