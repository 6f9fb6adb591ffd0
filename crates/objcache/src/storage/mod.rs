// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Storage backend abstraction and the paginating, retrying lister
//!
//! Backends implement [`ObjectStorage`]: one page of a listing at a time and
//! a streaming GET. [`ObjectLister`] turns pages into complete listings and
//! applies the shared [`RetryPolicy`].

mod objstore;
mod rest;

pub use objstore::{ObjectStoreStorage, S3Options};
pub use rest::{RestOptions, RestStorage};

use crate::error::Result;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use diagnostics::*;
use futures::stream::BoxStream;
use std::sync::Arc;

/// One object as reported by a listing. Only key and last-modified time are
/// used to identify cached content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObjectDescriptor {
    pub bucket: String,
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A page of listing results with the token for the next page.
#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<RemoteObjectDescriptor>,
    pub next: Option<String>,
}

pub type ObjectStream = BoxStream<'static, Result<Bytes>>;

/// Body of a GET, streamed in chunks.
pub struct ObjectBody {
    pub stream: ObjectStream,
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// List one page of objects under `prefix`. `token` is the `next` value
    /// of the previous page.
    async fn list_page(&self, bucket: &str, prefix: &str, token: Option<&str>) -> Result<ListPage>;

    /// Start streaming an object's bytes.
    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody>;
}

/// Complete, retried listings over an [`ObjectStorage`].
#[derive(Clone)]
pub struct ObjectLister {
    storage: Arc<dyn ObjectStorage>,
    retry: RetryPolicy,
}

/// Guard against a backend that keeps handing out the same token.
const MAX_PAGES: usize = 100_000;

impl ObjectLister {
    pub fn new(storage: Arc<dyn ObjectStorage>, retry: RetryPolicy) -> Self {
        Self { storage, retry }
    }

    /// Every object under `prefix`, across all pages. Order is unspecified.
    pub async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObjectDescriptor>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        for page_number in 0..MAX_PAGES {
            let operation = format!("list {bucket}/{prefix}");
            let page = self
                .retry
                .run(&operation, || self.storage.list_page(bucket, prefix, token.as_deref()))
                .await?;

            let page_count = page.objects.len();
            debug!("Listed page {page_number} of {bucket}/{prefix}: {page_count} objects", page_number: page_number, bucket: bucket, prefix: prefix, page_count: page_count);
            objects.extend(page.objects);

            match page.next {
                Some(next) if token.as_deref() != Some(next.as_str()) => token = Some(next),
                _ => break,
            }
        }

        let total = objects.len();
        info!("Listed {total} objects under {bucket}/{prefix}", total: total, bucket: bucket, prefix: prefix);
        Ok(objects)
    }

    /// Descriptor for exactly `key`, if it exists.
    pub async fn stat(&self, bucket: &str, key: &str) -> Result<Option<RemoteObjectDescriptor>> {
        Ok(self
            .list(bucket, key)
            .await?
            .into_iter()
            .find(|d| d.key == key))
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}
