// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! REST storage backend
//!
//! Speaks the small HTTP API of S3-like object servers that expose
//! `GET /buckets/{bucket}/objects` for listings and
//! `GET /buckets/{bucket}/objects/{key}` for object bytes, with HTTP basic
//! authentication using the access key / secret key pair.

use super::{ListPage, ObjectBody, ObjectStorage, RemoteObjectDescriptor};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct RestOptions {
    pub endpoint: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub timeout: Duration,
    /// Requested page size; the server may ignore it.
    pub page_size: Option<usize>,
}

impl RestOptions {
    pub fn new<S: Into<String>>(endpoint: S) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_key: None,
            secret_key: None,
            timeout: Duration::from_secs(60),
            page_size: None,
        }
    }
}

pub struct RestStorage {
    client: reqwest::Client,
    endpoint: Url,
    access_key: Option<String>,
    secret_key: Option<String>,
    page_size: Option<usize>,
}

impl RestStorage {
    pub fn new(options: RestOptions) -> Result<Self> {
        let endpoint = Url::parse(&options.endpoint)
            .map_err(|e| Error::Config(format!("invalid storage endpoint '{}': {e}", options.endpoint)))?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "storage endpoint '{}' cannot carry a path",
                options.endpoint
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            access_key: options.access_key,
            secret_key: options.secret_key,
            page_size: options.page_size,
        })
    }

    fn objects_url(&self, bucket: &str, key: Option<&str>) -> Result<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| Error::Config("storage endpoint cannot carry a path".into()))?;
            segments.pop_if_empty();
            segments.push("buckets");
            segments.push(bucket);
            segments.push("objects");
            if let Some(key) = key {
                segments.extend(key.split('/'));
            }
        }
        Ok(url)
    }

    fn list_url(&self, bucket: &str, prefix: &str, token: Option<&str>) -> Result<Url> {
        let mut url = self.objects_url(bucket, None)?;
        {
            let mut query = url.query_pairs_mut();
            if !prefix.is_empty() {
                query.append_pair("prefix", prefix);
            }
            if let Some(token) = token {
                query.append_pair("continuation_token", token);
            }
            if let Some(size) = self.page_size {
                query.append_pair("max_keys", &size.to_string());
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_key {
            Some(user) => request.basic_auth(user, self.secret_key.as_ref()),
            None => request,
        }
    }
}

fn transport_is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
}

fn status_is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn list_status_error(bucket: &str, prefix: &str, status: StatusCode) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::bucket_not_found(bucket),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Error::access_denied(bucket),
        s => Error::listing(bucket, prefix, format!("HTTP {s}"), status_is_transient(s)),
    }
}

fn get_status_error(bucket: &str, key: &str, status: StatusCode) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::download(bucket, key, "object not found (HTTP 404)", false),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Error::access_denied(bucket),
        s => Error::download(bucket, key, format!("HTTP {s}"), status_is_transient(s)),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody {
    Paged {
        objects: Vec<ListedObject>,
        #[serde(default, alias = "next_marker", alias = "nextContinuationToken")]
        next_continuation_token: Option<String>,
    },
    Bare(Vec<ListedObject>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListedObject {
    Detailed {
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        size: Option<u64>,
        #[serde(default, alias = "lastModified", alias = "modified")]
        last_modified: Option<serde_json::Value>,
    },
    Name(String),
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        serde_json::Value::Number(n) => {
            let seconds = n.as_f64()?;
            let whole = seconds.trunc() as i64;
            let nanos = (seconds.fract() * 1e9) as u32;
            Utc.timestamp_opt(whole, nanos).single()
        }
        _ => None,
    }
}

fn parse_list_body(bucket: &str, prefix: &str, body: &str) -> Result<ListPage> {
    let parsed: ListBody = serde_json::from_str(body)
        .map_err(|e| Error::listing(bucket, prefix, format!("unreadable listing: {e}"), false))?;

    let (objects, next) = match parsed {
        ListBody::Paged {
            objects,
            next_continuation_token,
        } => (objects, next_continuation_token.filter(|t| !t.is_empty())),
        ListBody::Bare(objects) => (objects, None),
    };

    let objects = objects
        .into_iter()
        .filter_map(|o| match o {
            ListedObject::Detailed {
                key,
                name,
                size,
                last_modified,
            } => key.or(name).map(|key| RemoteObjectDescriptor {
                bucket: bucket.to_string(),
                key,
                size_bytes: size.unwrap_or(0),
                last_modified: last_modified.as_ref().and_then(parse_timestamp),
            }),
            ListedObject::Name(key) => Some(RemoteObjectDescriptor {
                bucket: bucket.to_string(),
                key,
                size_bytes: 0,
                last_modified: None,
            }),
        })
        // Servers without prefix support return the whole bucket.
        .filter(|d| d.key.starts_with(prefix))
        .collect();

    Ok(ListPage { objects, next })
}

#[async_trait]
impl ObjectStorage for RestStorage {
    async fn list_page(&self, bucket: &str, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let url = self.list_url(bucket, prefix, token)?;
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| Error::listing(bucket, prefix, e.to_string(), transport_is_transient(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(list_status_error(bucket, prefix, status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::listing(bucket, prefix, e.to_string(), true))?;
        parse_list_body(bucket, prefix, &body)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        let url = self.objects_url(bucket, Some(key))?;
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| Error::download(bucket, key, e.to_string(), transport_is_transient(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(get_status_error(bucket, key, status));
        }

        let content_length = response.content_length();
        let bucket = bucket.to_string();
        let key = key.to_string();
        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| Error::download(&bucket, &key, e.to_string(), true)))
            .boxed();

        Ok(ObjectBody {
            stream,
            content_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(endpoint: &str) -> RestStorage {
        RestStorage::new(RestOptions::new(endpoint)).unwrap()
    }

    #[test]
    fn test_object_urls() {
        let s = storage("http://localhost:8001");
        assert_eq!(
            s.objects_url("test-analytics", Some("dir/sample data.csv")).unwrap().as_str(),
            "http://localhost:8001/buckets/test-analytics/objects/dir/sample%20data.csv"
        );

        let nested = storage("http://10.0.0.204:80/api/");
        assert_eq!(
            nested.list_url("b", "web/", Some("tok")).unwrap().as_str(),
            "http://10.0.0.204/api/buckets/b/objects?prefix=web%2F&continuation_token=tok"
        );
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        assert!(RestStorage::new(RestOptions::new("not a url")).is_err());
        assert!(RestStorage::new(RestOptions::new("mailto:ops@example.com")).is_err());
    }

    #[test]
    fn test_parse_bare_listing() {
        let body = r#"[
            {"key": "web/a.csv", "size": 10, "last_modified": "2024-05-01T12:00:00Z"},
            {"name": "web/b.json", "size": 20},
            "web/c.parquet"
        ]"#;
        let page = parse_list_body("logs", "web/", body).unwrap();
        assert!(page.next.is_none());
        let keys: Vec<_> = page.objects.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["web/a.csv", "web/b.json", "web/c.parquet"]);
        assert_eq!(page.objects[0].size_bytes, 10);
        assert!(page.objects[0].last_modified.is_some());
        assert!(page.objects[1].last_modified.is_none());
    }

    #[test]
    fn test_parse_paged_listing() {
        let body = r#"{"objects": [{"key": "a.csv", "size": 1, "last_modified": 1714564800.5}],
                       "next_continuation_token": "page-2"}"#;
        let page = parse_list_body("b", "", body).unwrap();
        assert_eq!(page.next.as_deref(), Some("page-2"));
        assert_eq!(
            page.objects[0].last_modified.map(|t| t.timestamp()),
            Some(1_714_564_800)
        );

        let last = parse_list_body("b", "", r#"{"objects": [], "next_continuation_token": ""}"#).unwrap();
        assert!(last.next.is_none());
    }

    #[test]
    fn test_parse_filters_by_prefix() {
        let page = parse_list_body("b", "web/", r#"[{"key": "web/a.csv"}, {"key": "img/x.png"}]"#).unwrap();
        assert_eq!(page.objects.len(), 1);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            list_status_error("logs", "", StatusCode::NOT_FOUND),
            Error::BucketNotFound { .. }
        ));
        assert!(matches!(
            list_status_error("logs", "", StatusCode::FORBIDDEN),
            Error::AccessDenied { .. }
        ));
        assert!(list_status_error("logs", "", StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(!list_status_error("logs", "", StatusCode::BAD_REQUEST).is_transient());

        let missing = get_status_error("logs", "k", StatusCode::NOT_FOUND);
        assert_eq!(missing.code(), "DOWNLOAD_FAILED");
        assert!(!missing.is_transient());
        assert!(get_status_error("logs", "k", StatusCode::BAD_GATEWAY).is_transient());
    }
}
