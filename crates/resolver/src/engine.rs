// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! DuckDB views over resolved catalog tables
//!
//! Every successfully resolved table becomes `CREATE OR REPLACE VIEW`. A
//! table that fails is kept out of the namespace, and its failure is
//! remembered so that queries naming it report the cause instead of a
//! generic "table not found".

use crate::catalog::Catalog;
use crate::error::{QueryError, ResolveError};
use crate::orchestrator::{Orchestrator, ResolvedTable};
use diagnostics::*;
use duckdb::Connection;
use duckdb::arrow::record_batch::RecordBatch;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Outcome of loading a catalog.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub registered: Vec<String>,
    pub failed: Vec<(String, ResolveError)>,
}

impl LoadReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct TableFailure {
    code: &'static str,
    cause: String,
}

pub struct Engine {
    conn: Mutex<Connection>,
    orchestrator: Orchestrator,
    registered: Mutex<BTreeMap<String, ResolvedTable>>,
    failures: Mutex<BTreeMap<String, TableFailure>>,
}

impl Engine {
    pub fn new(orchestrator: Orchestrator) -> Result<Self, QueryError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            orchestrator,
            registered: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(BTreeMap::new()),
        })
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Resolve every entry in parallel and register the ones that succeed.
    /// Entries rejected while parsing the catalog are reported as failures.
    pub async fn load_catalog(&self, catalog: &Catalog) -> LoadReport {
        let mut report = LoadReport::default();

        for rejected in catalog.rejected() {
            let err = rejected.to_error();
            self.record_failure(&rejected.name, &err);
            report.failed.push((rejected.name.clone(), err));
        }

        for (name, result) in self.orchestrator.resolve_all(catalog).await {
            match result.and_then(|table| self.register(&table)) {
                Ok(()) => report.registered.push(name),
                Err(err) => {
                    self.record_failure(&name, &err);
                    report.failed.push((name, err));
                }
            }
        }

        let registered = report.registered.len();
        let failed = report.failed.len();
        info!("Catalog loaded: {registered} tables registered, {failed} failed", registered: registered, failed: failed);
        report
    }

    /// Advance the cache generation, then resolve and register again.
    pub async fn reload(&self, catalog: &Catalog) -> LoadReport {
        _ = self.orchestrator.cache().reload();

        // Tables no longer in the catalog leave the namespace.
        let stale: Vec<String> = self
            .registered()
            .keys()
            .filter(|name| catalog.get(name).is_none())
            .cloned()
            .collect();
        for name in stale {
            self.drop_view(&name);
            _ = self.registered().remove(&name);
        }
        self.failures().clear();

        self.load_catalog(catalog).await
    }

    /// Create or replace the view for one resolved table.
    pub fn register(&self, table: &ResolvedTable) -> Result<(), ResolveError> {
        let name = table.name.as_str();
        let sql = format!(
            "CREATE OR REPLACE VIEW {} AS {}",
            quote_identifier(name),
            table.final_query_text
        );
        self.connection()
            .execute_batch(&sql)
            .map_err(|e| ResolveError::Engine {
                table: table.name.clone(),
                reason: e.to_string(),
            })?;

        _ = self.failures().remove(name);
        _ = self.registered().insert(table.name.clone(), table.clone());
        debug!("Registered view {name}", name: name);
        Ok(())
    }

    fn record_failure(&self, name: &str, err: &ResolveError) {
        // Never leave a stale definition behind for a table that failed.
        if self.registered().remove(name).is_some() {
            self.drop_view(name);
        }
        _ = self.failures().insert(
            name.to_string(),
            TableFailure {
                code: err.code(),
                cause: err.to_string(),
            },
        );
    }

    fn drop_view(&self, name: &str) {
        let sql = format!("DROP VIEW IF EXISTS {}", quote_identifier(name));
        if let Err(e) = self.connection().execute_batch(&sql) {
            let reason = e.to_string();
            warn!("Could not drop view {name}: {reason}", name: name, reason: reason);
        }
    }

    /// Run `sql` and collect the result as Arrow record batches.
    pub fn query(&self, sql: &str) -> Result<Vec<RecordBatch>, QueryError> {
        self.run(sql).map_err(|e| self.explain_failure(sql, e))
    }

    fn run(&self, sql: &str) -> duckdb::Result<Vec<RecordBatch>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(sql)?;
        let batches: Vec<RecordBatch> = stmt.query_arrow([])?.collect();
        Ok(batches)
    }

    /// Number of rows `sql` returns.
    pub fn count(&self, sql: &str) -> Result<usize, QueryError> {
        Ok(self.query(sql)?.iter().map(RecordBatch::num_rows).sum())
    }

    fn explain_failure(&self, sql: &str, err: duckdb::Error) -> QueryError {
        let failures = self.failures();
        let mentioned = identifiers(sql);
        failures
            .iter()
            .find(|(name, _)| mentioned.iter().any(|m| m.eq_ignore_ascii_case(name)))
            .map_or(QueryError::Execution(err), |(name, failure)| {
                QueryError::TableUnavailable {
                    table: name.clone(),
                    code: failure.code,
                    cause: failure.cause.clone(),
                }
            })
    }

    /// Names of registered views.
    #[must_use]
    pub fn tables(&self) -> Vec<String> {
        self.registered().keys().cloned().collect()
    }

    #[must_use]
    pub fn resolved(&self, name: &str) -> Option<ResolvedTable> {
        self.registered().get(name).cloned()
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registered(&self) -> MutexGuard<'_, BTreeMap<String, ResolvedTable>> {
        self.registered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failures(&self) -> MutexGuard<'_, BTreeMap<String, TableFailure>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Identifier-like words of `sql`, with surrounding double quotes removed.
fn identifiers(sql: &str) -> Vec<&str> {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '"'))
        .map(|word| word.trim_matches('"'))
        .filter(|word| !word.is_empty())
        .collect()
}
