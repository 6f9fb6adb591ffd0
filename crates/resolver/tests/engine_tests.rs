// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests: catalog, in-memory object storage, download cache and
//! DuckDB views.

use async_trait::async_trait;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload};
use objcache::{
    CacheOptions, DownloadCache, ListPage, ObjectBody, ObjectLister, ObjectStorage,
    ObjectStoreStorage, RetryPolicy,
};
use resolver::{Catalog, CatalogEntry, Engine, Orchestrator, QueryError, ResolveOptions};
use std::sync::Arc;
use std::time::Duration;

const CATALOG: &str = r#"
web_logs:
  bucket: logs
  prefix: web/
  format: csv
smoke:
  type: dummy
late_visits:
  query: "SELECT name FROM read_csv_auto('s3://logs/web/*.csv') WHERE id > 1"
missing_bucket:
  bucket: nowhere
  format: csv
two_wildcards:
  query: "SELECT * FROM 's3://logs/*/x/*.csv'"
"#;

async fn put(store: &InMemory, key: &str, body: &str) -> Result<(), Box<dyn std::error::Error>> {
    _ = store
        .put(&StorePath::from(key), PutPayload::from(body.as_bytes().to_vec()))
        .await?;
    Ok(())
}

async fn seeded_store() -> Result<Arc<InMemory>, Box<dyn std::error::Error>> {
    let store = Arc::new(InMemory::new());
    put(&store, "web/a.csv", "id,name\n1,alpha\n2,beta\n").await?;
    put(&store, "web/b.csv", "id,name\n3,gamma\n").await?;
    put(&store, "web/ignored.json", "{\"id\": 9}").await?;
    Ok(store)
}

fn engine_over(storage: Arc<dyn ObjectStorage>, options: ResolveOptions) -> Result<Engine, Box<dyn std::error::Error>> {
    let lister = ObjectLister::new(storage, RetryPolicy::none());
    let cache = DownloadCache::open(CacheOptions::default(), lister)?;
    Ok(Engine::new(Orchestrator::new(Arc::new(cache), options))?)
}

#[tokio::test]
async fn test_catalog_load_and_query() -> Result<(), Box<dyn std::error::Error>> {
    let store = seeded_store().await?;
    let storage = Arc::new(ObjectStoreStorage::new().with_store("logs", store));
    let engine = engine_over(storage, ResolveOptions::default())?;
    let catalog = Catalog::parse(CATALOG)?;

    let report = engine.load_catalog(&catalog).await;
    let mut registered = report.registered.clone();
    registered.sort();
    assert_eq!(registered, vec!["late_visits", "smoke", "web_logs"]);

    let mut failed: Vec<_> = report
        .failed
        .iter()
        .map(|(name, err)| (name.as_str(), err.code()))
        .collect();
    failed.sort_unstable();
    assert_eq!(
        failed,
        vec![
            ("missing_bucket", "BUCKET_NOT_FOUND"),
            ("two_wildcards", "MALFORMED_REFERENCE")
        ]
    );

    assert_eq!(engine.count("SELECT * FROM smoke")?, 3);
    assert_eq!(engine.count("SELECT * FROM web_logs")?, 3);
    assert_eq!(engine.count("SELECT * FROM late_visits")?, 2);

    let resolved = engine.resolved("web_logs").ok_or("web_logs not registered")?;
    assert!(resolved.final_query_text.starts_with("SELECT * FROM read_csv_auto(["));
    assert!(!resolved.final_query_text.contains("s3://"));
    Ok(())
}

#[tokio::test]
async fn test_failed_table_reports_cause() -> Result<(), Box<dyn std::error::Error>> {
    let store = seeded_store().await?;
    let storage = Arc::new(ObjectStoreStorage::new().with_store("logs", store));
    let engine = engine_over(storage, ResolveOptions::default())?;
    _ = engine.load_catalog(&Catalog::parse(CATALOG)?).await;

    match engine.query("SELECT count(*) FROM missing_bucket") {
        Err(QueryError::TableUnavailable { table, code, cause }) => {
            assert_eq!(table, "missing_bucket");
            assert_eq!(code, "BUCKET_NOT_FOUND");
            assert!(cause.contains("nowhere"));
        }
        other => panic!("expected TableUnavailable, got {other:?}"),
    }

    assert!(matches!(
        engine.query("SELECT * FROM never_defined"),
        Err(QueryError::Execution(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_reload_sees_new_objects() -> Result<(), Box<dyn std::error::Error>> {
    let store = seeded_store().await?;
    let storage = Arc::new(ObjectStoreStorage::new().with_store("logs", store.clone()));
    let engine = engine_over(storage, ResolveOptions::default())?;

    let mut catalog = Catalog::new();
    catalog.insert_bucket_table("web_logs", "logs", "web", resolver::Format::Csv)?;
    _ = engine.load_catalog(&catalog).await;
    assert_eq!(engine.count("SELECT * FROM web_logs")?, 3);

    put(&store, "web/c.csv", "id,name\n4,delta\n5,epsilon\n").await?;
    catalog.insert("smoke", CatalogEntry::Dummy)?;
    let report = engine.reload(&catalog).await;
    assert!(report.is_complete());
    assert_eq!(engine.count("SELECT * FROM web_logs")?, 5);
    assert_eq!(engine.tables(), vec!["smoke", "web_logs"]);

    let stats = engine.orchestrator().cache().stats();
    assert_eq!(stats.fetches, 3);
    assert_eq!(stats.hits, 2);
    Ok(())
}

/// Storage whose listings never finish in time.
struct StalledStorage;

#[async_trait]
impl ObjectStorage for StalledStorage {
    async fn list_page(&self, _bucket: &str, _prefix: &str, _token: Option<&str>) -> objcache::Result<ListPage> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ListPage::default())
    }

    async fn get(&self, bucket: &str, key: &str) -> objcache::Result<ObjectBody> {
        Err(objcache::Error::download(bucket, key, "stalled", false))
    }
}

#[tokio::test]
async fn test_deadline_aborts_resolution() -> Result<(), Box<dyn std::error::Error>> {
    let options = ResolveOptions {
        deadline: Some(Duration::from_millis(50)),
        ..ResolveOptions::default()
    };
    let engine = engine_over(Arc::new(StalledStorage), options)?;
    let catalog = Catalog::parse("slow:\n  bucket: logs\nsmoke:\n  type: dummy\n")?;

    let report = engine.load_catalog(&catalog).await;
    assert_eq!(report.registered, vec!["smoke"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].1.code(), "DEADLINE_EXCEEDED");
    Ok(())
}
