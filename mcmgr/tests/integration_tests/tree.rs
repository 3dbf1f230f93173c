// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeSet;

use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use aal::{PortBitmap, RdmRecord, TofinoFamily};
use asic::tofino_stub::{AsicConfig, L2Hop, Replica};
use mcmgr::{Deferred, L1Info, McConfig, McError, NodeAttachment, NodeType};

use crate::integration_tests::common::{
    harness, port, small_config, Harness, TestResult, DEV,
};

#[test]
fn test_attach_detach_two_pipes() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    let a = s.node_create(DEV, 10, &[port(0, 1), port(1, 1)], &[])?;
    s.mgid_attach_node(DEV, 5, a, None)?;

    for pipe in [0, 1] {
        let tree = s.mgid_tree(DEV, pipe, 5)?;
        assert_eq!(tree.l1.len(), 1);
        assert!(matches!(
            tree.l1[0],
            L1Info::Rid { node, rid: 10, chain_len: 1, .. } if node == a
        ));
        assert_eq!(tree.tail, None);
    }
    assert!(s.mgid_tree(DEV, 2, 5)?.l1.is_empty());
    assert_eq!(s.pvt_get(DEV, 5)?, 0b011);
    assert_eq!(
        s.node_get(DEV, a)?.attached,
        Some(NodeAttachment::Mgid { mgid: 5, xid: None })
    );
    drop(s);

    assert_eq!(
        h.walk(0, 5).l1,
        vec![Replica::Rid {
            rid: 10,
            xid: None,
            l2: vec![L2Hop::Ports(PortBitmap::from_ports(&[port(0, 1)]))],
        }]
    );
    h.assert_clean();

    let before = h.usage();
    let mut s = h.session();
    s.mgid_detach_node(DEV, 5, a)?;
    assert_eq!(s.pvt_get(DEV, 5)?, 0);
    assert!(s.mgid_tree(DEV, 0, 5)?.l1.is_empty());
    assert!(s.mgid_tree(DEV, 1, 5)?.l1.is_empty());

    // The L1 node and port node in each pipe wait for the epoch.
    let pending = s.pending_frees(DEV)?;
    let frees = pending
        .iter()
        .filter(|(_, d)| matches!(d, Deferred::Free { .. }))
        .count();
    assert_eq!(frees, 4);
    drop(s);
    assert_eq!(h.usage(), before);
    assert_eq!(h.stub.mit_root(0, 5), None);

    h.settle()?;
    let used_rid: u32 = h
        .usage()
        .iter()
        .filter(|u| u.node_type == NodeType::L1Rid)
        .map(|u| u.size - u.free)
        .sum();
    assert_eq!(used_rid, 0);
    assert!(h.session().pending_frees(DEV)?.is_empty());
    h.assert_clean();
    Ok(())
}

#[test]
fn test_new_node_goes_to_head() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    let a = s.node_create(DEV, 1, &[port(0, 1)], &[])?;
    let b = s.node_create(DEV, 2, &[port(0, 2)], &[])?;
    let c = s.node_create(DEV, 3, &[port(0, 3)], &[])?;
    s.mgid_attach_node(DEV, 40, a, None)?;
    s.mgid_attach_node(DEV, 40, b, Some(7))?;
    s.mgid_attach_node(DEV, 40, c, None)?;

    let rids: Vec<_> = s
        .mgid_tree(DEV, 0, 40)?
        .l1
        .iter()
        .map(|l1| match l1 {
            L1Info::Rid { rid, .. } => *rid,
            L1Info::Ecmp { .. } => panic!("unexpected ecmp node"),
        })
        .collect();
    assert_eq!(rids, vec![3, 2, 1]);

    // Unlink from the middle, then the head, then the last node.
    s.mgid_detach_node(DEV, 40, b)?;
    drop(s);
    let walk = h.walk(0, 40);
    assert_eq!(walk.l1.len(), 2);
    h.assert_clean();

    let mut s = h.session();
    s.mgid_detach_node(DEV, 40, c)?;
    s.mgid_detach_node(DEV, 40, a)?;
    assert!(s.mgid_tree(DEV, 0, 40)?.l1.is_empty());
    drop(s);
    h.assert_clean();
    Ok(())
}

#[test]
fn test_xid_is_written() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    let a = s.node_create(DEV, 9, &[port(2, 4)], &[])?;
    s.mgid_attach_node(DEV, 100, a, Some(0x55))?;
    let addr = match s.mgid_tree(DEV, 2, 100)?.l1[0] {
        L1Info::Rid { addr, .. } => addr,
        L1Info::Ecmp { .. } => panic!("unexpected ecmp node"),
    };
    drop(s);
    assert!(matches!(
        h.stub.record(2, addr),
        Some(RdmRecord::L1Rid { rid: 9, xid: Some(0x55), .. })
    ));
    assert_eq!(h.stub.mit_root(2, 100), Some(addr));
    Ok(())
}

#[test]
fn test_attach_errors() -> TestResult {
    let config = McConfig {
        mgid_count: 1024,
        ..small_config()
    };
    let h = Harness::new(AsicConfig::new(TofinoFamily::Tofino2), config)?;
    let mut s = h.session();
    let a = s.node_create(DEV, 1, &[port(0, 1)], &[])?;

    assert!(matches!(
        s.mgid_attach_node(DEV, 1024, a, None),
        Err(McError::Invalid(_))
    ));
    assert_eq!(s.node_get(DEV, a)?.attached, None);

    s.mgid_attach_node(DEV, 3, a, None)?;
    assert!(matches!(
        s.mgid_attach_node(DEV, 4, a, None),
        Err(McError::Exists(_))
    ));
    assert!(matches!(
        s.mgid_detach_node(DEV, 4, a),
        Err(McError::Missing(_))
    ));
    assert!(matches!(s.node_destroy(DEV, a), Err(McError::Invalid(_))));

    // Pipe 7 doesn't exist on this device, and index 100 doesn't fit a pipe
    // slice.
    assert!(matches!(
        s.node_create(DEV, 2, &[port(7, 0)], &[]),
        Err(McError::Invalid(_))
    ));
    assert!(matches!(
        s.node_create(DEV, 2, &[port(0, 100)], &[]),
        Err(McError::Invalid(_))
    ));
    assert!(matches!(s.mgid_tree(DEV, 6, 3), Err(McError::Invalid(_))));
    assert!(matches!(s.pvt_get(7, 3), Err(McError::Missing(_))));

    s.mgid_detach_node(DEV, 3, a)?;
    s.node_destroy(DEV, a)?;
    assert!(matches!(s.node_get(DEV, a), Err(McError::Missing(_))));

    // A recycled slot doesn't revive the old handle.
    let b = s.node_create(DEV, 2, &[], &[])?;
    assert_ne!(a, b);
    assert!(matches!(
        s.mgid_attach_node(DEV, 3, a, None),
        Err(McError::Missing(_))
    ));
    Ok(())
}

#[test]
fn test_empty_node_has_no_tree() -> TestResult {
    let h = harness()?;
    let mut s = h.session();
    let a = s.node_create(DEV, 1, &[], &[])?;
    s.mgid_attach_node(DEV, 8, a, None)?;
    assert_eq!(s.pvt_get(DEV, 8)?, 0);
    assert!(s.node_get(DEV, a)?.pipes.is_empty());

    // Giving it a port builds the tree.
    s.node_update(DEV, a, &[port(3, 0)], &[])?;
    assert_eq!(s.pvt_get(DEV, 8)?, 0b1000);
    assert_eq!(s.mgid_tree(DEV, 3, 8)?.l1.len(), 1);

    // Moving the port to another pipe moves the tree.
    s.node_update(DEV, a, &[port(1, 0)], &[])?;
    assert_eq!(s.pvt_get(DEV, 8)?, 0b0010);
    assert!(s.mgid_tree(DEV, 3, 8)?.l1.is_empty());
    drop(s);
    h.assert_clean();
    Ok(())
}

// Attach and detach nodes at random.  After every step, the list in each pipe
// holds exactly the attached nodes that reach that pipe.
#[test]
fn test_random_attach_detach() -> TestResult {
    let h = harness()?;
    let mut rng = StdRng::seed_from_u64(0x6d636d67);
    let mgid = 77;
    let initial = h.usage();

    let mut nodes = Vec::new();
    {
        let mut s = h.session();
        for rid in 0..12u16 {
            let count = rng.gen_range(1..4);
            let ports: Vec<_> = (0..count)
                .map(|_| port(rng.gen_range(0..4), rng.gen_range(0..72)))
                .collect();
            nodes.push(s.node_create(DEV, rid, &ports, &[])?);
        }
    }

    let mut attached = BTreeSet::new();
    for step in 0..200 {
        let node = *nodes.choose(&mut rng).unwrap();
        {
            let mut s = h.session();
            if attached.remove(&node) {
                s.mgid_detach_node(DEV, mgid, node)?;
            } else {
                s.mgid_attach_node(DEV, mgid, node, None)?;
                attached.insert(node);
            }

            let mut pvt = 0;
            for pipe in 0..4u8 {
                let mut expected = 0;
                for n in &attached {
                    if s.node_get(DEV, *n)?.pipes.contains(&pipe) {
                        expected += 1;
                    }
                }
                let tree = s.mgid_tree(DEV, pipe, mgid)?;
                assert_eq!(tree.l1.len(), expected, "step {step} pipe {pipe}");
                assert_eq!(h.walk(pipe, mgid).l1.len(), expected);
                if expected > 0 {
                    pvt |= 1 << pipe;
                }
            }
            assert_eq!(s.pvt_get(DEV, mgid)?, pvt);
        }
        if rng.gen_bool(0.3) {
            h.settle()?;
        }
    }
    h.assert_clean();

    {
        let mut s = h.session();
        for node in &attached {
            s.mgid_detach_node(DEV, mgid, *node)?;
        }
    }
    h.settle()?;
    assert_eq!(h.usage(), initial);
    h.assert_clean();
    Ok(())
}
