// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::io::stdout;
use std::io::Write;

use colored::Colorize;
use tabwriter::TabWriter;

use mcmgr::L1Info;

use crate::scenario::Report;

fn opt<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn trees(report: &Report) -> anyhow::Result<()> {
    let mut tw = TabWriter::new(stdout());
    writeln!(
        tw,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        "MGID".underline(),
        "Pipe".underline(),
        "Kind".underline(),
        "Owner".underline(),
        "XID".underline(),
        "Chain".underline(),
        "Tail".underline(),
    )?;
    for entry in &report.trees {
        let tail = match (entry.tree.tail, entry.tree.shrink_pending) {
            (t, true) => format!("{} (shrinking)", opt(t)),
            (t, false) => opt(t),
        };
        for (idx, l1) in entry.tree.l1.iter().enumerate() {
            // The tail belongs to the tree, so show it once.
            let tail = if idx == 0 { tail.as_str() } else { "" };
            match l1 {
                L1Info::Rid {
                    node,
                    rid,
                    xid,
                    chain_len,
                    ..
                } => writeln!(
                    tw,
                    "{}\t{}\trid\t{node:?} (rid {rid})\t{}\t{chain_len}\t{tail}",
                    entry.mgid,
                    entry.pipe,
                    opt(*xid),
                )?,
                L1Info::Ecmp { group, xid, .. } => writeln!(
                    tw,
                    "{}\t{}\tecmp\t{group:?}\t{}\t-\t{tail}",
                    entry.mgid,
                    entry.pipe,
                    opt(*xid),
                )?,
            }
        }
    }
    tw.flush()?;
    Ok(())
}

fn groups(report: &Report) -> anyhow::Result<()> {
    let mut tw = TabWriter::new(stdout());
    writeln!(
        tw,
        "{}\t{}\t{}\t{}\t{}\t{}",
        "Group".underline(),
        "ECMP ID".underline(),
        "State".underline(),
        "Members".underline(),
        "Pipes".underline(),
        "Last change".underline(),
    )?;
    for g in &report.groups {
        let pipes: Vec<String> = g
            .info
            .pipes
            .iter()
            .map(|(pipe, p)| format!("{pipe}:{}", p.size))
            .collect();
        writeln!(
            tw,
            "{}\t{}\t{}\t{:#x}/{}\t{}\t{}",
            g.name,
            g.info.ecmp_id,
            g.info.state,
            g.info.valid_map,
            g.info.allocated_sz,
            pipes.join(","),
            opt(g.info.last_transition),
        )?;
    }
    tw.flush()?;
    Ok(())
}

fn usage(report: &Report) -> anyhow::Result<()> {
    let mut tw = TabWriter::new(stdout());
    writeln!(
        tw,
        "{}\t{}\t{}\t{}",
        "Pipe".underline(),
        "Pool".underline(),
        "Used".underline(),
        "Size".underline(),
    )?;
    for u in report.usage.iter().filter(|u| u.free != u.size) {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}",
            u.pipe,
            u.node_type,
            u.size - u.free,
            u.size
        )?;
    }
    tw.flush()?;
    Ok(())
}

pub fn display(report: &Report) -> anyhow::Result<()> {
    println!(
        "{} steps ({} failed as expected), epoch {}, table version {} \
         after {} flips",
        report.steps,
        report.expected_failures,
        report.epoch,
        report.table_version,
        report.flips
    );
    println!();
    trees(report)?;
    if !report.groups.is_empty() {
        println!();
        groups(report)?;
    }
    println!();
    usage(report)?;
    if report.pending_frees > 0 || report.leaked_frees > 0 {
        println!(
            "\n{} frees waiting on an epoch, {} leaked",
            report.pending_frees, report.leaked_frees
        );
    }
    for v in &report.violations {
        println!("{} {v}", "violation:".red());
    }
    Ok(())
}
