// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

pub mod add_table;
pub mod clear_cache;
pub mod query;
pub mod resolve;
pub mod tables;

pub use add_table::add_table_command;
pub use clear_cache::clear_cache_command;
pub use query::{OutputFormat, query_command};
pub use resolve::resolve_command;
pub use tables::tables_command;

use crate::config::Config;
use anyhow::Result;
use objcache::DownloadCache;
use resolver::{Engine, Orchestrator};
use std::sync::Arc;

/// A query engine resolving through `cache` with the configured options.
pub fn engine_for(config: &Config, cache: Arc<DownloadCache>) -> Result<Engine> {
    let orchestrator = Orchestrator::new(cache, config.resolve_options());
    Ok(Engine::new(orchestrator)?)
}
