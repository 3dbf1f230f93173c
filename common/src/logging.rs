// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use slog::{o, Drain};

/// How log records are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Unstructured text, intended for a human at a terminal.
    Human,
    /// Bunyan-formatted json, intended for log processing tools.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Human => write!(f, "human"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Build the root logger for a program.  If `log_file` is set, records are
/// appended to that file; otherwise they go to stdout.
pub fn init(
    name: &'static str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let drain = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            build_drain(name, file, log_format)
        }
        None => build_drain(name, std::io::stdout(), log_format),
    };

    // Bunyan records carry the name already.
    Ok(match log_format {
        LogFormat::Human => slog::Logger::root(drain, o!("name" => name)),
        LogFormat::Json => slog::Logger::root(drain, o!()),
    })
}

fn build_drain<W>(
    name: &'static str,
    writer: W,
    log_format: LogFormat,
) -> slog::Fuse<slog_async::Async>
where
    W: std::io::Write + Send + 'static,
{
    match log_format {
        LogFormat::Human => {
            let decorator = slog_term::PlainDecorator::new(writer);
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            slog_async::Async::new(drain).build().fuse()
        }
        LogFormat::Json => {
            let drain = slog_bunyan::with_name(name, writer).build().fuse();
            slog_async::Async::new(drain).build().fuse()
        }
    }
}
