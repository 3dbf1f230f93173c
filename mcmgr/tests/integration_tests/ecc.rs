// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use pretty_assertions::assert_eq;

use aal::{PortBitmap, TofinoFamily};
use mcmgr::{McError, TableKind};

use crate::integration_tests::common::{harness, port, Harness, TestResult, DEV};

#[test]
fn test_repair_tree_root() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    let a = s.node_create(DEV, 1, &[port(1, 1)], &[])?;
    s.mgid_attach_node(DEV, 15, a, None)?;
    drop(s);
    let root = h.stub.mit_root(1, 15);
    assert!(root.is_some());

    h.stub.corrupt_mit(1, 15);
    assert!(h.stub.walk(1, 15).is_err());

    h.session().ecc_repair(DEV, TableKind::Mit, (1 << 16) | 15)?;
    assert_eq!(h.stub.mit_root(1, 15), root);
    assert_eq!(h.walk(1, 15).l1.len(), 1);
    Ok(())
}

#[test]
fn test_repair_vector_rows() -> TestResult {
    let h = Harness::family(TofinoFamily::Tofino3)?;
    let mut s = h.session();
    let a = s.node_create(DEV, 1, &[port(4, 1)], &[])?;
    s.mgid_attach_node(DEV, 6, a, None)?;
    drop(s);
    let pvt = h.stub.pvt_row(1, 0);
    let tvt = h.stub.tvt_row(1, 0);

    h.stub.corrupt_pvt_row(1, 0);
    h.stub.corrupt_tvt_row(1, 0);
    let mut s = h.session();
    s.ecc_repair(DEV, TableKind::Pvt, 0)?;
    s.ecc_repair(DEV, TableKind::Tvt, 0)?;
    drop(s);
    assert_eq!(h.stub.pvt_row(1, 0), pvt);
    assert_eq!(h.stub.tvt_row(1, 0), tvt);
    assert_eq!(pvt, (1 << 4) << 48);
    Ok(())
}

#[test]
fn test_repair_lag_and_backup() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    s.lag_update(DEV, 4, &[port(0, 9)])?;
    s.backup_port_changed(DEV, port(0, 9), None, Some(port(2, 9)))?;
    drop(s);

    h.stub.corrupt_lit(4);
    h.session().ecc_repair(DEV, TableKind::Lit, 4)?;
    assert_eq!(h.stub.lit(4), PortBitmap::from_ports(&[port(0, 9)]));

    // A LAG the manager doesn't know is repaired to empty.
    h.stub.corrupt_lit(5);
    h.session().ecc_repair(DEV, TableKind::Lit, 5)?;
    assert!(h.stub.lit(5).is_empty());

    h.session()
        .ecc_repair(DEV, TableKind::Pmt, port(0, 9) as u32)?;
    assert_eq!(h.stub.pmt(port(0, 9)), Some(port(2, 9)));
    Ok(())
}

#[test]
fn test_repair_bad_index() -> TestResult {
    let h = harness()?;
    let writes = h.stub.writes_applied();
    let mut s = h.session();
    s.ecc_repair(DEV, TableKind::Mit, 9 << 16)?;
    s.ecc_repair(DEV, TableKind::Pvt, 1 << 20)?;
    s.ecc_repair(DEV, TableKind::Tvt, 0)?;
    s.ecc_repair(DEV, TableKind::Lit, 300)?;
    s.ecc_repair(DEV, TableKind::Pmt, 0xffff)?;
    assert!(matches!(
        s.ecc_repair(3, TableKind::Pvt, 0),
        Err(McError::Missing(_))
    ));
    drop(s);
    assert_eq!(h.stub.writes_applied(), writes);
    Ok(())
}

#[test]
fn test_table_kind_names() {
    assert_eq!(TableKind::Pvt.to_string(), "pvt");
    assert_eq!("mit".parse::<TableKind>().unwrap(), TableKind::Mit);
    assert!("rdm".parse::<TableKind>().is_err());
}

#[test]
fn test_rebuild_shadows() -> TestResult {
    let h = Harness::family(TofinoFamily::Tofino3)?;
    let mut s = h.session();
    s.lag_update(DEV, 2, &[port(1, 3)])?;
    let a = s.node_create(DEV, 1, &[port(0, 1)], &[2])?;
    let b = s.node_create(DEV, 2, &[port(5, 1)], &[])?;
    s.mgid_attach_node(DEV, 30, a, None)?;
    s.mgid_attach_node(DEV, 31, b, None)?;

    // Overrides are discarded in favor of what the trees need.
    s.pvt_update(DEV, 30, 0b1111)?;
    s.pvt_update(DEV, 32, 0b1)?;
    s.tvt_update(DEV, 30, 0b11)?;
    drop(s);
    h.stub.corrupt_lit(2);

    h.session().rebuild_shadows(DEV)?;
    let mut s = h.session();
    assert_eq!(s.pvt_get(DEV, 30)?, 0b0011);
    assert_eq!(s.pvt_get(DEV, 31)?, 1 << 5);
    assert_eq!(s.pvt_get(DEV, 32)?, 0);
    assert_eq!(s.tvt_get(DEV, 30)?, Some(0b01));
    assert_eq!(s.tvt_get(DEV, 31)?, Some(0b10));
    assert_eq!(s.tvt_get(DEV, 0)?, Some(0b01));
    drop(s);
    assert_eq!(h.walk(5, 31).l1.len(), 1);
    assert_eq!(h.stub.lit(2), PortBitmap::from_ports(&[port(1, 3)]));
    h.assert_clean();
    Ok(())
}

#[test]
fn test_audit_catches_shadow_damage() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    let a = s.node_create(DEV, 1, &[port(2, 1)], &[])?;
    s.mgid_attach_node(DEV, 40, a, None)?;
    s.audit(DEV)?;

    // Clearing a pipe the tree lives in leaves the model inconsistent.
    s.pvt_update(DEV, 40, 0)?;
    assert!(matches!(s.audit(DEV), Err(McError::Internal(_))));
    s.rebuild_shadows(DEV)?;
    s.audit(DEV)?;
    assert_eq!(s.pvt_get(DEV, 40)?, 0b100);
    Ok(())
}
