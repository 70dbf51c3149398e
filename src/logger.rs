/*
 * This file is part of gpuprov.
 *
 * Copyright (C) 2025 gpuprov contributors
 *
 * gpuprov is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * gpuprov is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with gpuprov. If not, see <https://www.gnu.org/licenses/>.
 */

//! Logging bootstrap
//!
//! Logs go to the systemd journal when its socket exists, otherwise to
//! stderr. stdout is reserved for the report.

use std::path::Path;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use gp_core::constants::{env, paths};

/// Where log records end up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSink {
    Journald,
    Stderr,
}

impl LogSink {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSink::Journald => "systemd journal",
            LogSink::Stderr => "stderr",
        }
    }
}

/// Filter directive from `GPUPROV_LOG`, or the level implied by `--quiet`
pub fn filter_directive(from_env: Option<String>, quiet: bool) -> String {
    match from_env.filter(|v| !v.trim().is_empty()) {
        Some(directive) => directive,
        None if quiet => "warn".to_string(),
        None => "info".to_string(),
    }
}

fn init_stderr(directive: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_env_filter(EnvFilter::new(directive))
        .init();
}

pub fn init_logging(quiet: bool) -> LogSink {
    let directive = filter_directive(std::env::var(env::LOG).ok(), quiet);

    if !Path::new(paths::JOURNALD_SOCKET).exists() {
        init_stderr(&directive);
        return LogSink::Stderr;
    }
    match tracing_journald::layer() {
        Ok(journald_layer) => {
            tracing_subscriber::registry()
                .with(journald_layer)
                .with(EnvFilter::new(&directive))
                .init();
            LogSink::Journald
        }
        Err(e) => {
            eprintln!("Failed to create journald layer: {}, falling back to stderr", e);
            init_stderr(&directive);
            LogSink::Stderr
        }
    }
}
