// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use diagnostics::*;
use resolver::{Catalog, Format};
use std::io::Write;
use std::path::Path;

/// Add (or replace) a bucket/prefix table and save the catalog.
pub async fn add_table_command(
    catalog_path: &Path,
    name: &str,
    bucket: &str,
    prefix: &str,
    format: Format,
    out: &mut impl Write,
) -> Result<()> {
    let mut catalog = Catalog::load(catalog_path)?;
    let replaced = catalog.get(name).is_some();
    catalog.insert_bucket_table(name, bucket, prefix, format)?;
    catalog.save(catalog_path)?;

    let shown = catalog_path.display().to_string();
    info!("Saved catalog {shown}", shown: shown);
    let verb = if replaced { "Replaced" } else { "Added" };
    let format = format.as_str();
    writeln!(out, "{verb} table {name}: s3://{bucket}/{prefix} ({format})")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use resolver::CatalogEntry;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_add_table_creates_and_replaces() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempdir()?;
        let path = tmp.path().join("catalog.yml");
        std::fs::write(&path, "smoke:\n  type: dummy\nodd:\n  colour: blue\n")?;

        let mut out = Vec::new();
        add_table_command(&path, "web_logs", "logs", "web/", Format::Csv, &mut out).await?;
        add_table_command(&path, "web_logs", "logs", "web/2025/", Format::Csv, &mut out).await?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("Added table web_logs"));
        assert!(text.contains("Replaced table web_logs: s3://logs/web/2025/ (csv)"));

        let catalog = Catalog::load(&path)?;
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.get("web_logs"),
            Some(&CatalogEntry::BucketPrefix {
                bucket: "logs".into(),
                prefix: "web/2025/".into(),
                format: Format::Csv,
            })
        );
        // Entries this version does not understand survive the rewrite.
        assert_eq!(catalog.rejected().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_add_table_rejects_bad_name() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempdir()?;
        let path = tmp.path().join("catalog.yml");
        let mut out = Vec::new();
        let result = add_table_command(&path, "1st-table", "logs", "", Format::Parquet, &mut out).await;
        assert!(result.is_err());
        assert!(!path.exists());
        Ok(())
    }
}
