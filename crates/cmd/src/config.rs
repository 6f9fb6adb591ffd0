// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! bucketql configuration: YAML file, then environment overrides
//!
//! Every section is optional. Environment variables win over the file:
//!
//! | variable                 | fallback                 | setting                          |
//! |--------------------------|--------------------------|----------------------------------|
//! | `BUCKETQL_ENDPOINT`      | `S3_ENDPOINT`            | `storage.endpoint`               |
//! | `BUCKETQL_ACCESS_KEY`    | `AWS_ACCESS_KEY_ID`      | `storage.access_key`             |
//! | `BUCKETQL_SECRET_KEY`    | `AWS_SECRET_ACCESS_KEY`  | `storage.secret_key`             |
//! | `BUCKETQL_REGION`        | `AWS_REGION`             | `storage.region`                 |
//! | `BUCKETQL_CACHE_DIR`     |                          | `cache.dir`                      |
//! | `BUCKETQL_MAX_DOWNLOADS` |                          | `cache.max_concurrent_downloads` |
//! | `BUCKETQL_CATALOG`       |                          | `catalog`                        |
//! | `BUCKETQL_VERBOSE`       |                          | `verbose`                        |

use anyhow::{Context, Result, anyhow, bail};
use diagnostics::*;
use objcache::{
    CacheOptions, DownloadCache, ObjectLister, ObjectStorage, ObjectStoreStorage, RestOptions,
    RestStorage, RetryPolicy, S3Options, StalenessPolicy,
};
use resolver::{Catalog, ResolveOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CATALOG: &str = "catalog.yml";
pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// `/buckets/{bucket}/objects` REST API with basic auth.
    #[default]
    Rest,
    /// S3 protocol via `object_store`.
    S3,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: Backend,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: String,
    pub timeout_secs: u64,
    pub page_size: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            region: DEFAULT_REGION.to_string(),
            timeout_secs: 60,
            page_size: None,
        }
    }
}

// Credentials stay out of logs and debug output.
impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key.as_ref().map(|_| "<set>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<set>"))
            .field("region", &self.region)
            .field("timeout_secs", &self.timeout_secs)
            .field("page_size", &self.page_size)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub dir: Option<PathBuf>,
    pub max_concurrent_downloads: usize,
    pub capacity_bytes: Option<u64>,
    pub staleness: StalenessPolicy,
    /// Cached files older than this are removed when the cache opens.
    pub max_age_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_concurrent_downloads: 4,
            capacity_bytes: None,
            staleness: StalenessPolicy::default(),
            max_age_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            min_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolveConfig {
    /// Per-table resolution deadline; 0 disables it.
    pub deadline_secs: u64,
    pub max_parallel_fetches: usize,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 300,
            max_parallel_fetches: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub resolve: ResolveConfig,
    pub catalog: Option<PathBuf>,
    pub verbose: bool,
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Config {
    /// Read `path` (if given), apply the process environment, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(text)?)
    }

    /// Apply overrides from `env`, a variable lookup.
    pub fn apply_env<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| names.iter().find_map(|name| env(name));

        if let Some(endpoint) = first(&["BUCKETQL_ENDPOINT", "S3_ENDPOINT"]) {
            self.storage.endpoint = Some(endpoint);
        }
        if let Some(key) = first(&["BUCKETQL_ACCESS_KEY", "AWS_ACCESS_KEY_ID"]) {
            self.storage.access_key = Some(key);
        }
        if let Some(secret) = first(&["BUCKETQL_SECRET_KEY", "AWS_SECRET_ACCESS_KEY"]) {
            self.storage.secret_key = Some(secret);
        }
        if let Some(region) = first(&["BUCKETQL_REGION", "AWS_REGION"]) {
            self.storage.region = region;
        }
        if let Some(dir) = env("BUCKETQL_CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        if let Some(max) = env("BUCKETQL_MAX_DOWNLOADS") {
            self.cache.max_concurrent_downloads = max
                .trim()
                .parse()
                .with_context(|| format!("BUCKETQL_MAX_DOWNLOADS={max} is not a number"))?;
        }
        if let Some(catalog) = env("BUCKETQL_CATALOG") {
            self.catalog = Some(PathBuf::from(catalog));
        }
        if let Some(verbose) = env("BUCKETQL_VERBOSE") {
            self.verbose = truthy(&verbose);
        }
        Ok(())
    }

    /// Endpoints without a scheme are plain HTTP.
    pub fn normalize(&mut self) {
        if let Some(endpoint) = &self.storage.endpoint {
            let trimmed = endpoint.trim().trim_end_matches('/');
            let normalized = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
                trimmed.to_string()
            } else {
                format!("http://{trimmed}")
            };
            self.storage.endpoint = Some(normalized);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.max_concurrent_downloads == 0 {
            bail!("cache.max_concurrent_downloads must be greater than 0");
        }
        if self.resolve.max_parallel_fetches == 0 {
            bail!("resolve.max_parallel_fetches must be greater than 0");
        }
        self.retry_policy()
            .validate()
            .map_err(|e| anyhow!("invalid retry settings: {e}"))?;
        if self.storage.access_key.is_some() != self.storage.secret_key.is_some() {
            bail!("storage access_key and secret_key must be set together");
        }
        Ok(())
    }

    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.catalog
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG))
    }

    /// Hosts whose path-style URLs in catalog queries name stored objects.
    #[must_use]
    pub fn storage_hosts(&self) -> Vec<String> {
        self.storage
            .endpoint
            .as_deref()
            .and_then(objcache::endpoint_host)
            .into_iter()
            .collect()
    }

    /// The catalog file, read against this storage endpoint.
    pub fn load_catalog(&self) -> Result<Catalog> {
        Ok(Catalog::load_with_hosts(&self.catalog_path(), &self.storage_hosts())?)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            min_delay: Duration::from_millis(self.retry.min_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            factor: 2.0,
            jitter: self.retry.jitter,
        }
    }

    #[must_use]
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            dir: self.cache.dir.clone(),
            max_concurrent_downloads: self.cache.max_concurrent_downloads,
            capacity_bytes: self.cache.capacity_bytes,
            staleness: self.cache.staleness,
        }
    }

    #[must_use]
    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            deadline: (self.resolve.deadline_secs > 0)
                .then(|| Duration::from_secs(self.resolve.deadline_secs)),
            max_parallel_fetches: self.resolve.max_parallel_fetches,
            ..ResolveOptions::default()
        }
    }

    /// The configured storage backend.
    pub fn storage(&self) -> Result<Arc<dyn ObjectStorage>> {
        let storage = &self.storage;
        match storage.backend {
            Backend::Rest => {
                let endpoint = storage
                    .endpoint
                    .clone()
                    .ok_or_else(|| anyhow!("storage endpoint is required (set BUCKETQL_ENDPOINT)"))?;
                info!("Using REST storage at {endpoint}", endpoint: endpoint);
                let rest = RestStorage::new(RestOptions {
                    endpoint,
                    access_key: storage.access_key.clone(),
                    secret_key: storage.secret_key.clone(),
                    timeout: Duration::from_secs(storage.timeout_secs),
                    page_size: storage.page_size,
                })?;
                Ok(Arc::new(rest))
            }
            Backend::S3 => {
                let endpoint = storage.endpoint.clone();
                let shown = endpoint.clone().unwrap_or_else(|| "AWS".to_string());
                info!("Using S3 storage at {shown}", shown: shown);
                let allow_http = endpoint.as_deref().is_some_and(|e| e.starts_with("http://"));
                Ok(Arc::new(ObjectStoreStorage::s3(S3Options {
                    endpoint,
                    region: storage.region.clone(),
                    access_key: storage.access_key.clone(),
                    secret_key: storage.secret_key.clone(),
                    allow_http,
                })))
            }
        }
    }

    /// Open the download cache over the configured storage, dropping files
    /// older than `cache.max_age_secs`.
    pub fn open_cache(&self) -> Result<Arc<DownloadCache>> {
        let lister = ObjectLister::new(self.storage()?, self.retry_policy());
        self.open_cache_with(lister)
    }

    pub fn open_cache_with(&self, lister: ObjectLister) -> Result<Arc<DownloadCache>> {
        let cache = DownloadCache::open(self.cache_options(), lister)?;
        if let Some(secs) = self.cache.max_age_secs {
            _ = cache.evict_older_than(Duration::from_secs(secs))?;
        }
        Ok(Arc::new(cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.cache.max_concurrent_downloads, 4);
        assert_eq!(config.catalog_path(), PathBuf::from("catalog.yml"));
        assert!(config.storage_hosts().is_empty());
        assert!(config.validate().is_ok());
        assert_eq!(config.resolve_options().deadline, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_parse_file_sections() {
        let config = Config::parse(
            r#"
storage:
  backend: s3
  endpoint: minio:9000
cache:
  dir: /var/cache/bucketql
  staleness: refetch_on_reload
  capacity_bytes: 1048576
retry:
  max_attempts: 2
resolve:
  deadline_secs: 0
catalog: tables.yml
"#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, Backend::S3);
        assert_eq!(config.cache.staleness, StalenessPolicy::RefetchOnReload);
        assert_eq!(config.retry_policy().max_attempts, 2);
        assert_eq!(config.retry.min_delay_ms, 200);
        assert_eq!(config.resolve_options().deadline, None);
        assert_eq!(config.catalog_path(), PathBuf::from("tables.yml"));

        assert!(Config::parse("storage:\n  colour: blue\n").is_err());
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn test_env_overrides_and_fallbacks() {
        let mut config = Config::parse("storage:\n  endpoint: http://file-host\n").unwrap();
        config.apply_env(env_of(&[
            ("S3_ENDPOINT", "10.0.0.204:80"),
            ("AWS_ACCESS_KEY_ID", "fallback"),
            ("BUCKETQL_ACCESS_KEY", "primary"),
            ("BUCKETQL_SECRET_KEY", "s3cr3t"),
            ("BUCKETQL_MAX_DOWNLOADS", "16"),
            ("BUCKETQL_VERBOSE", "yes"),
            ("BUCKETQL_CATALOG", "/etc/bucketql/catalog.yml"),
        ]))
        .unwrap();
        config.normalize();

        assert_eq!(config.storage.endpoint.as_deref(), Some("http://10.0.0.204:80"));
        assert_eq!(config.storage_hosts(), vec!["10.0.0.204".to_string()]);
        assert_eq!(config.storage.access_key.as_deref(), Some("primary"));
        assert_eq!(config.cache.max_concurrent_downloads, 16);
        assert!(config.verbose);
        assert_eq!(config.catalog_path(), PathBuf::from("/etc/bucketql/catalog.yml"));
        assert!(config.validate().is_ok());

        assert!(config.apply_env(env_of(&[("BUCKETQL_MAX_DOWNLOADS", "many")])).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.cache.max_concurrent_downloads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.min_delay_ms = 10_000;
        config.retry.max_delay_ms = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.access_key = Some("only-half".into());
        assert!(config.validate().is_err());

        // REST needs an endpoint.
        assert!(Config::default().storage().is_err());
    }

    #[test]
    fn test_debug_hides_credentials() {
        let mut config = Config::default();
        config.storage.secret_key = Some("hunter2".into());
        config.storage.access_key = Some("admin".into());
        let shown = format!("{config:?}");
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("admin"));
    }

    #[test]
    fn test_https_endpoint_kept() {
        let mut config = Config::default();
        config.storage.endpoint = Some("https://objects.example.com/".into());
        config.normalize();
        assert_eq!(
            config.storage.endpoint.as_deref(),
            Some("https://objects.example.com")
        );
    }
}
