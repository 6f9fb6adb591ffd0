// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Remote object references, listings, and a local download cache
//!
//! Query text may name remote objects (`s3://bucket/key.csv`,
//! `s3://bucket/dir/*.parquet`, or HTTP object URLs). This crate turns those
//! references into local files a query engine can read:
//!
//! - **QueryTemplate / RemoteReference**: find and parse references in text
//! - **ObjectLister**: complete, retried listings over an [`ObjectStorage`]
//! - **PatternMatcher**: select listed keys matching a wildcard, sorted
//! - **DownloadCache**: at most one transfer per key, atomic placement
//! - **LiteralEscaper**: local paths as single-quoted SQL literals
//!
//! # Usage
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use objcache::{
//!     CacheOptions, DownloadCache, LiteralEscaper, ObjectLister, PatternMatcher,
//!     RemoteReference, RestOptions, RestStorage, RetryPolicy,
//! };
//! use std::sync::Arc;
//!
//! let storage = Arc::new(RestStorage::new(RestOptions::new("http://localhost:8001"))?);
//! let lister = ObjectLister::new(storage, RetryPolicy::default());
//! let cache = DownloadCache::open(CacheOptions::default(), lister)?;
//!
//! let reference = RemoteReference::parse("s3://logs/web/*.csv")?;
//! let listing = cache.lister().list(&reference.bucket, reference.list_prefix()).await?;
//! let wildcard = reference.wildcard.as_ref().ok_or("not a pattern")?;
//! let generation = cache.generation();
//! for object in PatternMatcher::new(wildcard).filter(listing) {
//!     let local = cache.resolve(&object, generation).await?;
//!     println!("{}", LiteralEscaper::default().escape(&local.local_path)?);
//! }
//! # Ok(())
//! # }
//! ```

mod cache;
mod error;
mod escape;
mod pattern;
mod reference;
mod retry;
pub mod storage;

pub use cache::{
    CacheOptions, CacheStats, CachedObject, DownloadCache, Generation, StalenessPolicy,
};
pub use error::{Error, Result};
pub use escape::{LiteralEscaper, PathStyle};
pub use pattern::{PatternMatcher, SegmentGlob};
pub use reference::{
    QueryTemplate, ReferenceContext, RemoteReference, Scheme, WildcardSegment, endpoint_host,
};
pub use retry::RetryPolicy;
pub use storage::{
    ListPage, ObjectBody, ObjectLister, ObjectStorage, ObjectStoreStorage, RemoteObjectDescriptor,
    RestOptions, RestStorage, S3Options,
};
