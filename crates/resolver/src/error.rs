// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use thiserror::Error;

/// Failure to turn one catalog entry into a registered table.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Table '{table}': {source}")]
    Table {
        table: String,
        #[source]
        source: objcache::Error,
    },

    #[error("Table '{table}', reference {reference}: {source}")]
    Reference {
        table: String,
        reference: String,
        #[source]
        source: objcache::Error,
    },

    #[error("Table '{table}': resolution did not finish within {timeout:?}")]
    DeadlineExceeded { table: String, timeout: Duration },

    #[error("Table '{table}': query engine rejected the view: {reason}")]
    Engine { table: String, reason: String },

    #[error("Catalog error: {0}")]
    Catalog(String),
}

impl ResolveError {
    pub fn table<S: Into<String>>(table: S, source: objcache::Error) -> Self {
        ResolveError::Table {
            table: table.into(),
            source,
        }
    }

    /// Machine-readable code; wrapped storage errors keep their own code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::Table { source, .. } | ResolveError::Reference { source, .. } => source.code(),
            ResolveError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            ResolveError::Engine { .. } => "ENGINE",
            ResolveError::Catalog(_) => "CATALOG",
        }
    }

    /// Name of the table that failed, if the error is about one table.
    #[must_use]
    pub fn table_name(&self) -> Option<&str> {
        match self {
            ResolveError::Table { table, .. }
            | ResolveError::Reference { table, .. }
            | ResolveError::DeadlineExceeded { table, .. }
            | ResolveError::Engine { table, .. } => Some(table),
            ResolveError::Catalog(_) => None,
        }
    }
}

/// Failure of a query against the engine.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The query names a table that failed to resolve.
    #[error("Table '{table}' is unavailable ({code}): {cause}")]
    TableUnavailable {
        table: String,
        code: &'static str,
        cause: String,
    },

    #[error("Query failed: {0}")]
    Execution(#[from] duckdb::Error),
}

pub type Result<T> = std::result::Result<T, ResolveError>;
