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

use clap::Parser;
use tracing::{debug, error};

use gp_core::constants::exit;
use gpuprov::cli::Cli;
use gpuprov::commands::{execute, CommandError};
use gpuprov::logger::init_logging;

fn main() {
    let cli = Cli::parse();
    let sink = init_logging(cli.quiet);
    debug!("gpuprov {} logging to {}", env!("CARGO_PKG_VERSION"), sink.as_str());

    let code = match execute(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<CommandError>()
                .map(CommandError::exit_code)
                .unwrap_or(exit::FAIL)
        }
    };
    std::process::exit(code);
}
