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

//! gpuprov - GPU provisioning command line tool
//!
//! Wires the `gp-core` engine to the real host: argument parsing, logging,
//! command dispatch and report emission.

pub mod cli;
pub mod commands;
pub mod logger;
pub mod output;
