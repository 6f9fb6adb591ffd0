// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::config::Config;
use anyhow::{Result, anyhow};
use objcache::DownloadCache;
use resolver::Orchestrator;
use std::io::Write;
use std::sync::Arc;

/// Download whatever `table` needs and print its local-only definition.
pub async fn resolve_command(
    config: &Config,
    cache: Arc<DownloadCache>,
    table: &str,
    out: &mut impl Write,
) -> Result<()> {
    let catalog = config.load_catalog()?;

    if let Some(rejected) = catalog.rejected().iter().find(|r| r.name == table) {
        return Err(rejected.to_error().into());
    }
    let entry = catalog
        .get(table)
        .ok_or_else(|| anyhow!("table '{table}' is not defined in the catalog"))?;

    let orchestrator = Orchestrator::new(cache, config.resolve_options());
    let resolved = orchestrator.resolve(table, entry).await?;
    writeln!(out, "{}", resolved.final_query_text)?;
    Ok(())
}
