// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use resolver::{Catalog, CatalogEntry};
use std::io::Write;
use std::path::Path;

fn describe(entry: &CatalogEntry) -> String {
    match entry {
        CatalogEntry::BucketPrefix {
            bucket,
            prefix,
            format,
        } => {
            let format = format.as_str();
            format!("s3://{bucket}/{prefix} ({format})")
        }
        CatalogEntry::DirectQuery(template) => template.source().to_string(),
        CatalogEntry::Dummy => "3 fixed rows".to_string(),
    }
}

/// List catalog tables, one per line: name, kind, definition.
pub async fn tables_command(catalog_path: &Path, out: &mut impl Write) -> Result<()> {
    let catalog = Catalog::load(catalog_path)?;

    if catalog.is_empty() && catalog.rejected().is_empty() {
        let shown = catalog_path.display();
        writeln!(out, "No tables defined in {shown}")?;
        return Ok(());
    }

    for (name, entry) in catalog.tables() {
        let kind = entry.kind();
        let detail = describe(entry);
        writeln!(out, "{name}\t{kind}\t{detail}")?;
    }
    for rejected in catalog.rejected() {
        let name = &rejected.name;
        let reason = &rejected.reason;
        writeln!(out, "{name}\trejected\t{reason}")?;
    }
    Ok(())
}
