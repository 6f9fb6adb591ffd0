// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::commands::engine_for;
use crate::config::Config;
use anyhow::Result;
use clap::ValueEnum;
use diagnostics::*;
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::arrow::util::pretty::pretty_format_batches;
use objcache::DownloadCache;
use std::io::Write;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Bordered table
    #[default]
    Table,
    /// Row count only
    Count,
}

/// Load the catalog into a fresh engine and run `sql` against it.
///
/// Tables that fail to resolve are logged and left out; the query only
/// fails if it names one of them.
pub async fn query_command(
    config: &Config,
    cache: Arc<DownloadCache>,
    sql: &str,
    format: OutputFormat,
    out: &mut impl Write,
) -> Result<()> {
    let catalog = config.load_catalog()?;
    let engine = engine_for(config, cache)?;

    let report = engine.load_catalog(&catalog).await;
    for (table, err) in &report.failed {
        let code = err.code();
        let reason = err.to_string();
        warn!("Table {table} unavailable ({code}): {reason}", table: table, code: code, reason: reason);
    }

    let batches = engine.query(sql)?;
    match format {
        OutputFormat::Table => {
            let rendered = pretty_format_batches(&batches)?;
            writeln!(out, "{rendered}")?;
        }
        OutputFormat::Count => {
            let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
            writeln!(out, "{rows}")?;
        }
    }
    Ok(())
}
