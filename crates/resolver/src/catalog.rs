// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Table catalog: a YAML mapping from table name to entry
//!
//! ```yaml
//! web_logs:
//!   bucket: logs
//!   prefix: web/
//!   format: csv
//! recent_errors:
//!   query: SELECT * FROM read_json_auto('s3://logs/errors/*.json') WHERE level = 'error'
//! smoke:
//!   type: dummy
//! ```
//!
//! Entries are validated one at a time: a malformed entry is recorded in
//! [`Catalog::rejected`] and the rest of the catalog still loads.

use crate::error::{ResolveError, Result};
use diagnostics::*;
use objcache::{QueryTemplate, RemoteReference};
use serde::{Deserialize, Serialize};
use serde_yaml_ng::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// File format of a bucket/prefix table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Parquet,
    Csv,
    Json,
}

impl Format {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "parquet" => Some(Format::Parquet),
            "csv" => Some(Format::Csv),
            "json" => Some(Format::Json),
            _ => None,
        }
    }

    /// Format implied by a file extension; unknown extensions read as parquet.
    #[must_use]
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "csv" | "tsv" => Format::Csv,
            "json" | "ndjson" | "jsonl" => Format::Json,
            _ => Format::Parquet,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Parquet => "parquet",
            Format::Csv => "csv",
            Format::Json => "json",
        }
    }

    #[must_use]
    pub fn extension(self) -> &'static str {
        self.as_str()
    }

    /// DuckDB table function reading a list of files of this format.
    #[must_use]
    pub fn reader_function(self) -> &'static str {
        match self {
            Format::Parquet => "read_parquet",
            Format::Csv => "read_csv_auto",
            Format::Json => "read_json_auto",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEntry {
    /// Every object under `prefix` with the format's extension.
    BucketPrefix {
        bucket: String,
        prefix: String,
        format: Format,
    },
    /// A query template with embedded remote references.
    DirectQuery(QueryTemplate),
    /// Fixed in-memory rows, no storage access.
    Dummy,
}

impl CatalogEntry {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CatalogEntry::BucketPrefix { .. } => "bucket",
            CatalogEntry::DirectQuery(_) => "query",
            CatalogEntry::Dummy => "dummy",
        }
    }
}

/// A catalog entry that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEntry {
    pub name: String,
    pub reason: String,
    raw: Value,
}

impl RejectedEntry {
    /// The rejection as a typed error, reported like any other failed table.
    #[must_use]
    pub fn to_error(&self) -> ResolveError {
        ResolveError::table(&self.name, objcache::Error::malformed(&self.name, &self.reason))
    }
}

/// On-disk shape of one entry. Which fields are present selects the kind.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    query: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
}

impl RawEntry {
    fn into_entry(self, storage_hosts: &[String]) -> std::result::Result<CatalogEntry, String> {
        match self {
            RawEntry {
                kind: Some(kind),
                bucket: None,
                prefix: None,
                format: None,
                query: None,
            } => match kind.as_str() {
                "dummy" => Ok(CatalogEntry::Dummy),
                other => Err(format!("unknown entry type '{other}'")),
            },
            RawEntry {
                query: Some(query),
                bucket: None,
                prefix: None,
                format: None,
                kind: None,
            } => QueryTemplate::parse_with_hosts(&query, storage_hosts)
                .map(CatalogEntry::DirectQuery)
                .map_err(|e| e.to_string()),
            RawEntry {
                bucket: Some(bucket),
                prefix,
                format,
                query: None,
                kind: None,
            } => {
                let format = match format {
                    Some(name) => Format::parse(&name).ok_or_else(|| {
                        format!("unsupported format '{name}' (expected parquet, csv or json)")
                    })?,
                    None => Format::default(),
                };
                let prefix = prefix.unwrap_or_default();
                _ = RemoteReference::bucket_prefix(&bucket, &prefix, format.extension())
                    .map_err(|e| e.to_string())?;
                Ok(CatalogEntry::BucketPrefix {
                    bucket,
                    prefix,
                    format,
                })
            }
            _ => Err("entry must have exactly one of: bucket/prefix/format, query, type: dummy".into()),
        }
    }

    fn from_entry(entry: &CatalogEntry) -> Self {
        match entry {
            CatalogEntry::BucketPrefix {
                bucket,
                prefix,
                format,
            } => RawEntry {
                bucket: Some(bucket.clone()),
                prefix: Some(prefix.clone()),
                format: Some(format.as_str().to_string()),
                ..RawEntry::default()
            },
            CatalogEntry::DirectQuery(template) => RawEntry {
                query: Some(template.source().to_string()),
                ..RawEntry::default()
            },
            CatalogEntry::Dummy => RawEntry {
                kind: Some("dummy".to_string()),
                ..RawEntry::default()
            },
        }
    }
}

/// Table names become view names; keep them plain SQL identifiers.
#[must_use]
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    tables: BTreeMap<String, CatalogEntry>,
    rejected: Vec<RejectedEntry>,
}

impl Catalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a YAML file. A missing or empty file is an empty catalog.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_hosts(path, &[])
    }

    /// Load from a YAML file, treating path-style http(s) URLs on
    /// `storage_hosts` as object references.
    pub fn load_with_hosts(path: &Path, storage_hosts: &[String]) -> Result<Self> {
        let shown = path.display().to_string();
        if !path.exists() {
            warn!("Catalog file {shown} not found, starting with an empty catalog", shown: shown);
            return Ok(Self::new());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ResolveError::Catalog(format!("cannot read {shown}: {e}")))?;
        let catalog = Self::parse_with_hosts(&text, storage_hosts)?;

        let tables = catalog.len();
        let rejected = catalog.rejected.len();
        info!("Loaded catalog {shown}: {tables} tables, {rejected} rejected", shown: shown, tables: tables, rejected: rejected);
        Ok(catalog)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with_hosts(text, &[])
    }

    pub fn parse_with_hosts(text: &str, storage_hosts: &[String]) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::new());
        }
        let raw: Option<BTreeMap<String, Value>> = serde_yaml_ng::from_str(text)
            .map_err(|e| ResolveError::Catalog(format!("catalog must be a mapping of table names: {e}")))?;

        let mut catalog = Self::new();
        for (name, value) in raw.unwrap_or_default() {
            match Self::parse_entry(&name, value.clone(), storage_hosts) {
                Ok(entry) => {
                    _ = catalog.tables.insert(name, entry);
                }
                Err(reason) => {
                    warn!("Rejected catalog entry {name}: {reason}", name: name, reason: reason);
                    catalog.rejected.push(RejectedEntry {
                        name,
                        reason,
                        raw: value,
                    });
                }
            }
        }
        Ok(catalog)
    }

    fn parse_entry(
        name: &str,
        value: Value,
        storage_hosts: &[String],
    ) -> std::result::Result<CatalogEntry, String> {
        if !is_valid_table_name(name) {
            return Err(format!("'{name}' is not a valid table name"));
        }
        let raw: RawEntry = serde_yaml_ng::from_value(value).map_err(|e| e.to_string())?;
        raw.into_entry(storage_hosts)
    }

    /// Write every table, including rejected entries as they were read.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out: BTreeMap<&str, Value> = BTreeMap::new();
        for rejected in &self.rejected {
            _ = out.insert(&rejected.name, rejected.raw.clone());
        }
        for (name, entry) in &self.tables {
            let value = serde_yaml_ng::to_value(RawEntry::from_entry(entry))
                .map_err(|e| ResolveError::Catalog(e.to_string()))?;
            _ = out.insert(name, value);
        }

        let text = serde_yaml_ng::to_string(&out).map_err(|e| ResolveError::Catalog(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| {
            ResolveError::Catalog(format!("cannot write {}: {e}", path.display()))
        })
    }

    /// Add or replace a table.
    pub fn insert(&mut self, name: &str, entry: CatalogEntry) -> Result<()> {
        if !is_valid_table_name(name) {
            return Err(ResolveError::Catalog(format!("'{name}' is not a valid table name")));
        }
        self.rejected.retain(|r| r.name != name);
        _ = self.tables.insert(name.to_string(), entry);
        Ok(())
    }

    /// Add or replace a bucket/prefix table.
    pub fn insert_bucket_table(&mut self, name: &str, bucket: &str, prefix: &str, format: Format) -> Result<()> {
        _ = RemoteReference::bucket_prefix(bucket, prefix, format.extension())
            .map_err(|e| ResolveError::table(name, e))?;
        self.insert(
            name,
            CatalogEntry::BucketPrefix {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                format,
            },
        )
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &CatalogEntry)> {
        self.tables.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    #[must_use]
    pub fn rejected(&self) -> &[RejectedEntry] {
        &self.rejected
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
