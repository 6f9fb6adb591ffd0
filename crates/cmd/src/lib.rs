// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The `bucketql` command line: configuration and subcommands.

pub mod commands;
pub mod config;
