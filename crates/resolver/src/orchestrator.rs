// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Resolution of catalog entries into SQL over local files
//!
//! Each reference goes through list, match, fetch, and escape in that order.
//! Wildcard matches are fetched concurrently (bounded by
//! `max_parallel_fetches`) and put back into key order once every fetch has
//! finished. A failure anywhere aborts the whole entry.

use crate::catalog::{Catalog, CatalogEntry, Format};
use crate::error::{ResolveError, Result};
use diagnostics::*;
use futures::{StreamExt, TryStreamExt, stream};
use objcache::{
    DownloadCache, Generation, LiteralEscaper, PathStyle, PatternMatcher, ReferenceContext,
    RemoteReference,
};
use std::sync::Arc;
use std::time::Duration;

/// Definition used for `type: dummy` entries.
pub const DUMMY_QUERY: &str =
    "SELECT * FROM (VALUES (1, 'alpha'), (2, 'beta'), (3, 'gamma')) AS t(id, name)";

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Upper bound on one entry's resolution; `None` waits indefinitely.
    pub deadline: Option<Duration>,
    /// Concurrent fetches within one wildcard expansion.
    pub max_parallel_fetches: usize,
    pub path_style: PathStyle,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            deadline: Some(Duration::from_secs(300)),
            max_parallel_fetches: 8,
            path_style: PathStyle::host(),
        }
    }
}

/// A catalog entry rewritten to read only local files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTable {
    pub name: String,
    pub final_query_text: String,
}

pub struct Orchestrator {
    cache: Arc<DownloadCache>,
    options: ResolveOptions,
    escaper: LiteralEscaper,
}

impl Orchestrator {
    #[must_use]
    pub fn new(cache: Arc<DownloadCache>, options: ResolveOptions) -> Self {
        let escaper = LiteralEscaper::new(options.path_style);
        Self {
            cache,
            options,
            escaper,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<DownloadCache> {
        &self.cache
    }

    /// Resolve one entry under the configured deadline. If the deadline
    /// passes, in-flight listings and fetches are dropped, which discards
    /// their partial files and releases their per-key locks.
    pub async fn resolve(&self, name: &str, entry: &CatalogEntry) -> Result<ResolvedTable> {
        let generation = self.cache.generation();
        let work = self.resolve_entry(name, entry, generation);

        let resolved = match self.options.deadline {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| ResolveError::DeadlineExceeded {
                    table: name.to_string(),
                    timeout: limit,
                })?,
            None => work.await,
        };

        match &resolved {
            Ok(_) => info!("Resolved table {name}", name: name),
            Err(e) => {
                let reason = e.to_string();
                warn!("Failed to resolve table {name}: {reason}", name: name, reason: reason);
            }
        }
        resolved
    }

    /// Resolve every catalog entry concurrently. One entry's failure does
    /// not affect the others.
    pub async fn resolve_all(&self, catalog: &Catalog) -> Vec<(String, Result<ResolvedTable>)> {
        let work = catalog.tables().map(|(name, entry)| async move {
            (name.to_string(), self.resolve(name, entry).await)
        });
        futures::future::join_all(work).await
    }

    async fn resolve_entry(
        &self,
        name: &str,
        entry: &CatalogEntry,
        generation: Generation,
    ) -> Result<ResolvedTable> {
        let final_query_text = match entry {
            CatalogEntry::Dummy => DUMMY_QUERY.to_string(),

            CatalogEntry::BucketPrefix {
                bucket,
                prefix,
                format,
            } => {
                let reference = RemoteReference::bucket_prefix(bucket, prefix, format.extension())
                    .map_err(|e| ResolveError::table(name, e))?;
                let literals = self
                    .resolve_reference(&reference, generation)
                    .await
                    .map_err(|e| ResolveError::table(name, e))?;
                format!(
                    "SELECT * FROM {}({})",
                    format.reader_function(),
                    list_literal(&literals)
                )
            }

            CatalogEntry::DirectQuery(template) => {
                let mut replacements = Vec::with_capacity(template.references().len());
                for reference in template.references() {
                    let literals = self
                        .resolve_reference(reference, generation)
                        .await
                        .map_err(|source| ResolveError::Reference {
                            table: name.to_string(),
                            reference: reference.raw_text.clone(),
                            source,
                        })?;
                    replacements.push(substitution(reference, &literals));
                }
                template
                    .render(&replacements)
                    .map_err(|e| ResolveError::table(name, e))?
            }
        };

        Ok(ResolvedTable {
            name: name.to_string(),
            final_query_text,
        })
    }

    /// Escaped local paths for one reference, in key order.
    async fn resolve_reference(
        &self,
        reference: &RemoteReference,
        generation: Generation,
    ) -> objcache::Result<Vec<String>> {
        let bucket = reference.bucket.as_str();

        let Some(wildcard) = &reference.wildcard else {
            let cached = self
                .cache
                .resolve_key(bucket, &reference.key, generation)
                .await?;
            return Ok(vec![self.escaper.escape(&cached.local_path)?]);
        };

        let listing = self
            .cache
            .lister()
            .list(bucket, reference.list_prefix())
            .await?;
        let matched = PatternMatcher::new(wildcard).filter(listing);
        if matched.is_empty() {
            return Err(objcache::Error::NoObjectsMatched {
                bucket: bucket.to_string(),
                pattern: reference.key.clone(),
            });
        }
        let count = matched.len();
        let pattern = reference.key.as_str();
        debug!("Pattern {bucket}/{pattern} matched {count} objects", bucket: bucket, pattern: pattern, count: count);

        let mut fetched: Vec<_> = stream::iter(matched)
            .map(|object| async move { self.cache.resolve(&object, generation).await })
            .buffer_unordered(self.options.max_parallel_fetches.max(1))
            .try_collect()
            .await?;
        fetched.sort_by(|a, b| a.key.cmp(&b.key));

        fetched
            .iter()
            .map(|cached| self.escaper.escape(&cached.local_path))
            .collect()
    }
}

fn list_literal(literals: &[String]) -> String {
    format!("[{}]", literals.join(", "))
}

/// Text standing in for a reference literal. Single objects stay a plain
/// literal; wildcard expansions become a list, wrapped in a reader function
/// when the literal was used directly as a relation.
fn substitution(reference: &RemoteReference, literals: &[String]) -> String {
    if !reference.is_pattern() {
        return literals.join(", ");
    }
    match reference.context {
        ReferenceContext::FunctionArgument => list_literal(literals),
        ReferenceContext::TableLiteral => {
            let format = reference
                .extension()
                .map_or(Format::Parquet, Format::from_extension);
            format!("{}({})", format.reader_function(), list_literal(literals))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use objcache::{
        CacheOptions, ListPage, ObjectBody, ObjectLister, ObjectStorage, ObjectStoreStorage,
        QueryTemplate, RetryPolicy,
    };
    use object_store::memory::InMemory;
    use object_store::path::Path as StorePath;
    use object_store::{ObjectStore, PutPayload};
    use std::collections::HashMap;
    use std::sync::Mutex;

    async fn logs_storage(objects: &[(&str, &str)]) -> ObjectStoreStorage {
        let store = Arc::new(InMemory::new());
        for (key, body) in objects {
            _ = store
                .put(&StorePath::from(*key), PutPayload::from(body.as_bytes().to_vec()))
                .await
                .unwrap();
        }
        ObjectStoreStorage::new().with_store("logs", store)
    }

    async fn orchestrator(objects: &[(&str, &str)]) -> Orchestrator {
        orchestrator_over(Arc::new(logs_storage(objects).await))
    }

    fn orchestrator_over(storage: Arc<dyn ObjectStorage>) -> Orchestrator {
        let lister = ObjectLister::new(storage, RetryPolicy::none());
        let cache = DownloadCache::open(CacheOptions::default(), lister).unwrap();
        Orchestrator::new(
            Arc::new(cache),
            ResolveOptions {
                path_style: PathStyle::Posix,
                ..ResolveOptions::default()
            },
        )
    }

    fn local(orch: &Orchestrator, key: &str) -> String {
        let path = orch.cache().root().join("logs").join(key);
        format!("'{}'", path.display())
    }

    #[tokio::test]
    async fn test_bucket_prefix_matches_format_only() {
        let orch = orchestrator(&[("web/a.csv", "0123456789"), ("web/b.json", "{\"x\": 1}")]).await;
        let entry = CatalogEntry::BucketPrefix {
            bucket: "logs".into(),
            prefix: "web/".into(),
            format: Format::Csv,
        };
        let table = orch.resolve("web_logs", &entry).await.unwrap();
        assert_eq!(table.name, "web_logs");
        assert_eq!(
            table.final_query_text,
            format!("SELECT * FROM read_csv_auto([{}])", local(&orch, "web/a.csv"))
        );
        assert_eq!(orch.cache().stats().fetches, 1);
    }

    /// Holds each GET for a per-key delay and records the order in which
    /// downloads were handed back.
    struct DelayedStorage {
        inner: ObjectStoreStorage,
        delays: HashMap<&'static str, Duration>,
        served: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStorage for DelayedStorage {
        async fn list_page(&self, bucket: &str, prefix: &str, token: Option<&str>) -> objcache::Result<ListPage> {
            self.inner.list_page(bucket, prefix, token).await
        }

        async fn get(&self, bucket: &str, key: &str) -> objcache::Result<ObjectBody> {
            if let Some(delay) = self.delays.get(key) {
                tokio::time::sleep(*delay).await;
            }
            self.served.lock().unwrap().push(key.to_string());
            self.inner.get(bucket, key).await
        }
    }

    #[tokio::test]
    async fn test_wildcard_expansion_is_sorted() {
        let storage = Arc::new(DelayedStorage {
            inner: logs_storage(&[("c.csv", "c"), ("a.csv", "a"), ("b.csv", "b")]).await,
            delays: HashMap::from([
                ("a.csv", Duration::from_millis(200)),
                ("b.csv", Duration::from_millis(100)),
            ]),
            served: Mutex::new(Vec::new()),
        });
        let orch = orchestrator_over(storage.clone());
        let template = QueryTemplate::parse("SELECT * FROM scan('s3://logs/*.csv') WHERE 1 = 1").unwrap();
        let table = orch
            .resolve("t", &CatalogEntry::DirectQuery(template))
            .await
            .unwrap();

        // Downloads finished in reverse key order.
        assert_eq!(*storage.served.lock().unwrap(), vec!["c.csv", "b.csv", "a.csv"]);
        assert_eq!(
            table.final_query_text,
            format!(
                "SELECT * FROM scan([{}, {}, {}]) WHERE 1 = 1",
                local(&orch, "a.csv"),
                local(&orch, "b.csv"),
                local(&orch, "c.csv")
            )
        );
    }

    #[tokio::test]
    async fn test_table_literal_and_single_object() {
        let orch = orchestrator(&[("x.json", "{}"), ("y.json", "{}"), ("one.parquet", "p")]).await;
        let template = QueryTemplate::parse(
            "SELECT * FROM 's3://logs/*.json' UNION ALL SELECT * FROM 's3://logs/one.parquet'",
        )
        .unwrap();
        let table = orch
            .resolve("t", &CatalogEntry::DirectQuery(template))
            .await
            .unwrap();
        assert_eq!(
            table.final_query_text,
            format!(
                "SELECT * FROM read_json_auto([{}, {}]) UNION ALL SELECT * FROM {}",
                local(&orch, "x.json"),
                local(&orch, "y.json"),
                local(&orch, "one.parquet")
            )
        );
    }

    #[tokio::test]
    async fn test_zero_matches_is_an_error() {
        let orch = orchestrator(&[("web/b.json", "{}")]).await;
        let entry = CatalogEntry::BucketPrefix {
            bucket: "logs".into(),
            prefix: "web".into(),
            format: Format::Csv,
        };
        let err = orch.resolve("empty", &entry).await.unwrap_err();
        assert_eq!(err.code(), "NO_OBJECTS_MATCHED");
        assert_eq!(err.table_name(), Some("empty"));
    }

    #[tokio::test]
    async fn test_failing_reference_is_identified() {
        let orch = orchestrator(&[("a.csv", "a")]).await;
        let template =
            QueryTemplate::parse("SELECT * FROM 's3://logs/a.csv', 's3://missing/b.csv'").unwrap();
        let err = orch
            .resolve("t", &CatalogEntry::DirectQuery(template))
            .await
            .unwrap_err();
        match err {
            ResolveError::Reference { reference, source, .. } => {
                assert_eq!(reference, "'s3://missing/b.csv'");
                assert!(matches!(source, objcache::Error::BucketNotFound { .. }));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_dummy_needs_no_storage() {
        let orch = orchestrator(&[]).await;
        let table = orch.resolve("smoke", &CatalogEntry::Dummy).await.unwrap();
        assert_eq!(table.final_query_text, DUMMY_QUERY);
        assert_eq!(orch.cache().stats(), objcache::CacheStats::default());
    }

    #[tokio::test]
    async fn test_resolve_all_isolates_failures() {
        let orch = orchestrator(&[("a.csv", "a")]).await;
        let catalog = Catalog::parse(
            "good:\n  bucket: logs\n  format: csv\nbad:\n  bucket: nowhere\nsmoke:\n  type: dummy\n",
        )
        .unwrap();
        let results = orch.resolve_all(&catalog).await;
        let outcome: Vec<_> = results.iter().map(|(n, r)| (n.as_str(), r.is_ok())).collect();
        assert_eq!(outcome, vec![("bad", false), ("good", true), ("smoke", true)]);
    }
}
