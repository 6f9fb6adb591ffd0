// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cmd::commands::{self, OutputFormat};
use cmd::config::Config;
use resolver::Format;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "bucketql")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Configuration file (YAML)
    #[arg(short, long, global = true, env = "BUCKETQL_CONFIG")]
    config: Option<PathBuf>,
    /// Catalog file, overriding the configured one
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    /// Log resolutions and downloads (same as BUCKETQL_LOG=info)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tables defined in the catalog
    Tables,
    /// Resolve one table and print its local query
    Resolve {
        /// Table name
        table: String,
    },
    /// Resolve the catalog and run a SQL query
    Query {
        /// SQL text
        sql: String,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Add or replace a bucket/prefix table in the catalog
    AddTable {
        /// Table name
        name: String,
        #[arg(long)]
        bucket: String,
        #[arg(long, default_value = "")]
        prefix: String,
        /// parquet, csv or json
        #[arg(long, default_value = "parquet", value_parser = parse_format)]
        format: Format,
    },
    /// Delete cached downloads
    ClearCache {
        /// Only remove files older than this many seconds
        #[arg(long)]
        older_than: Option<u64>,
    },
}

fn parse_format(name: &str) -> std::result::Result<Format, String> {
    Format::parse(name).ok_or_else(|| format!("unsupported format '{name}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if cli.catalog.is_some() {
        config.catalog = cli.catalog.clone();
    }
    diagnostics::init_with_default(cli.verbose || config.verbose);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let catalog = config.catalog_path();

    match &cli.command {
        Commands::Tables => commands::tables_command(&catalog, &mut out).await,
        Commands::Resolve { table } => {
            let cache = config.open_cache()?;
            commands::resolve_command(&config, cache, table, &mut out).await
        }
        Commands::Query { sql, format } => {
            let cache = config.open_cache()?;
            commands::query_command(&config, cache, sql, *format, &mut out).await
        }
        Commands::AddTable {
            name,
            bucket,
            prefix,
            format,
        } => commands::add_table_command(&catalog, name, bucket, prefix, *format, &mut out).await,
        Commands::ClearCache { older_than } => {
            let age = older_than.map(Duration::from_secs);
            commands::clear_cache_command(&config, age, &mut out).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add_table() -> Result<()> {
        let cli = Cli::try_parse_from([
            "bucketql", "add-table", "web_logs", "--bucket", "logs", "--prefix", "web/", "--format", "csv",
        ])?;
        match cli.command {
            Commands::AddTable { name, format, .. } => {
                assert_eq!(name, "web_logs");
                assert_eq!(format, Format::Csv);
            }
            _ => panic!("wrong subcommand"),
        }
        assert!(Cli::try_parse_from(["bucketql", "add-table", "t", "--bucket", "b", "--format", "xml"]).is_err());
        Ok(())
    }

    #[test]
    fn test_parse_query_format() -> Result<()> {
        let cli = Cli::try_parse_from(["bucketql", "-v", "query", "SELECT 1", "--format", "count"])?;
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Query { format: OutputFormat::Count, .. }));
        Ok(())
    }
}
