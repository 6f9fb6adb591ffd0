// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! `object_store` backend: AWS S3 and S3-compatible services (MinIO, etc.),
//! plus any other `ObjectStore` handed in directly.

use super::{ListPage, ObjectBody, ObjectStorage, RemoteObjectDescriptor};
use crate::error::{Error, Result};
use async_trait::async_trait;
use diagnostics::*;
use futures::{StreamExt, TryStreamExt};
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct S3Options {
    /// Custom endpoint for S3-compatible servers. `None` means AWS.
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub allow_http: bool,
}

type StoreBuilder = dyn Fn(&str) -> Result<Arc<dyn ObjectStore>> + Send + Sync;

/// One `ObjectStore` per bucket, built on first use.
pub struct ObjectStoreStorage {
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
    builder: Option<Box<StoreBuilder>>,
}

impl Default for ObjectStoreStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStoreStorage {
    /// Storage with no buckets; add them with [`Self::with_store`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            builder: None,
        }
    }

    /// Storage that builds an S3 client for each bucket it is asked about.
    #[must_use]
    pub fn s3(options: S3Options) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            builder: Some(Box::new(move |bucket| build_s3_store(&options, bucket))),
        }
    }

    /// Serve `bucket` from an existing store.
    #[must_use]
    pub fn with_store(self, bucket: &str, store: Arc<dyn ObjectStore>) -> Self {
        if let Ok(mut stores) = self.stores.lock() {
            _ = stores.insert(bucket.to_string(), store);
        }
        self
    }

    fn store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| Error::Config("object store registry poisoned".into()))?;
        if let Some(store) = stores.get(bucket) {
            return Ok(store.clone());
        }
        let Some(builder) = &self.builder else {
            return Err(Error::bucket_not_found(bucket));
        };
        let store = builder(bucket)?;
        debug!("Created object store for bucket {bucket}", bucket: bucket);
        _ = stores.insert(bucket.to_string(), store.clone());
        Ok(store)
    }
}

fn build_s3_store(options: &S3Options, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region(&options.region)
        .with_allow_http(options.allow_http);

    match (&options.access_key, &options.secret_key) {
        (Some(access), Some(secret)) => {
            builder = builder
                .with_access_key_id(access)
                .with_secret_access_key(secret);
        }
        _ => builder = builder.with_skip_signature(true),
    }
    if let Some(endpoint) = &options.endpoint {
        builder = builder.with_endpoint(endpoint);
    }

    let store = builder
        .build()
        .map_err(|e| Error::Config(format!("failed to build S3 store for {bucket}: {e}")))?;
    Ok(Arc::new(store))
}

fn is_missing_bucket(e: &object_store::Error) -> bool {
    matches!(e, object_store::Error::NotFound { .. }) || e.to_string().contains("NoSuchBucket")
}

fn is_denied(e: &object_store::Error) -> bool {
    matches!(
        e,
        object_store::Error::PermissionDenied { .. } | object_store::Error::Unauthenticated { .. }
    )
}

fn list_error(bucket: &str, prefix: &str, e: object_store::Error) -> Error {
    if is_missing_bucket(&e) {
        Error::bucket_not_found(bucket)
    } else if is_denied(&e) {
        Error::access_denied(bucket)
    } else {
        Error::listing(bucket, prefix, e.to_string(), true)
    }
}

fn get_error(bucket: &str, key: &str, e: object_store::Error) -> Error {
    if is_denied(&e) {
        Error::access_denied(bucket)
    } else if matches!(e, object_store::Error::NotFound { .. }) {
        Error::download(bucket, key, e.to_string(), false)
    } else {
        Error::download(bucket, key, e.to_string(), true)
    }
}

#[async_trait]
impl ObjectStorage for ObjectStoreStorage {
    /// `object_store` paginates internally, so this always returns a single
    /// complete page.
    async fn list_page(&self, bucket: &str, prefix: &str, _token: Option<&str>) -> Result<ListPage> {
        let store = self.store(bucket)?;

        // Paths list by whole segments; narrow to the string prefix afterwards.
        let dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let dir_path = (!dir.is_empty()).then(|| Path::from(dir));

        let metas: Vec<_> = store
            .list(dir_path.as_ref())
            .try_collect()
            .await
            .map_err(|e| list_error(bucket, prefix, e))?;

        let objects = metas
            .into_iter()
            .filter(|meta| meta.location.as_ref().starts_with(prefix))
            .map(|meta| RemoteObjectDescriptor {
                bucket: bucket.to_string(),
                key: meta.location.to_string(),
                size_bytes: meta.size as u64,
                last_modified: Some(meta.last_modified),
            })
            .collect();

        Ok(ListPage {
            objects,
            next: None,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        let store = self.store(bucket)?;
        let result = store
            .get(&Path::from(key))
            .await
            .map_err(|e| get_error(bucket, key, e))?;

        let content_length = Some(result.meta.size as u64);
        let owned_bucket = bucket.to_string();
        let owned_key = key.to_string();
        let stream = result
            .into_stream()
            .map(move |chunk| {
                chunk.map_err(|e| Error::download(&owned_bucket, &owned_key, e.to_string(), true))
            })
            .boxed();

        Ok(ObjectBody {
            stream,
            content_length,
        })
    }
}
