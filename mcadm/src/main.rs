// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::path::PathBuf;

use structopt::*;

use aal::TofinoFamily;
use common::logging::LogFormat;
use mcmgr::McConfig;

mod report;
mod scenario;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "mcadm",
    about = "runs multicast replication scenarios against a model of the \
             Tofino replication engine"
)]
struct GlobalOpts {
    #[structopt(short, long, help = "manager configuration file (TOML)")]
    config: Option<PathBuf>,

    #[structopt(
        long,
        default_value = "human",
        help = "log format: human or json"
    )]
    log_format: LogFormat,

    #[structopt(long, help = "append log records to this file")]
    log_file: Option<String>,

    #[structopt(subcommand)]
    cmd: Commands,
}

#[derive(Debug, StructOpt)]
enum Commands {
    /// Run a scenario file and display the resulting device state.
    Run {
        /// Emit the report as JSON rather than tables.
        #[structopt(short = "j", long)]
        json: bool,
        /// The scenario to run.
        scenario: PathBuf,
    },
    /// Print the default manager configuration.
    Defaults {
        /// Resolve family-specific settings, such as the tail table.
        #[structopt(short, long)]
        family: Option<TofinoFamily>,
    },
}

fn load_config(path: &Option<PathBuf>) -> anyhow::Result<McConfig> {
    match path {
        Some(path) => Ok(McConfig::from_file(path)?),
        None => Ok(McConfig::default()),
    }
}

fn defaults(family: Option<TofinoFamily>) -> anyhow::Result<()> {
    let mut config = McConfig::default();
    if let Some(family) = family {
        if family.has_tails() {
            config.tail_sizes = Some(family.default_tail_sizes());
        }
    }
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = GlobalOpts::from_args();
    let log = common::logging::init("mcadm", &opts.log_file, opts.log_format)?;

    match opts.cmd {
        Commands::Run { json, scenario: path } => {
            let scenario = scenario::Scenario::from_file(&path)?;
            let config = match &scenario.config {
                Some(config) => config.clone(),
                None => load_config(&opts.config)?,
            };
            let report = scenario::run(&log, config, &scenario)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report::display(&report)?;
            }
            if !report.violations.is_empty() {
                anyhow::bail!(
                    "the dataplane model saw {} violations",
                    report.violations.len()
                );
            }
            Ok(())
        }
        Commands::Defaults { family } => defaults(family),
    }
}
