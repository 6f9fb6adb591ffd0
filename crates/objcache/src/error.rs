// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Error types for reference resolution and object caching

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed reference '{reference}': {reason}")]
    MalformedReference { reference: String, reason: String },

    #[error("Bucket not found: {bucket}")]
    BucketNotFound { bucket: String },

    #[error("Access denied to bucket: {bucket}")]
    AccessDenied { bucket: String },

    #[error("No objects in bucket '{bucket}' matched '{pattern}'")]
    NoObjectsMatched { bucket: String, pattern: String },

    #[error("Listing bucket '{bucket}' prefix '{prefix}' failed: {reason}")]
    Listing {
        bucket: String,
        prefix: String,
        reason: String,
        transient: bool,
    },

    #[error("Download of {bucket}/{key} failed: {reason}")]
    Download {
        bucket: String,
        key: String,
        reason: String,
        transient: bool,
    },

    #[error("Cannot escape path '{path}': {reason}")]
    Escape { path: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn malformed<R: AsRef<str>, S: Into<String>>(reference: R, reason: S) -> Self {
        Error::MalformedReference {
            reference: reference.as_ref().to_string(),
            reason: reason.into(),
        }
    }

    pub fn bucket_not_found<S: AsRef<str>>(bucket: S) -> Self {
        Error::BucketNotFound {
            bucket: bucket.as_ref().to_string(),
        }
    }

    pub fn access_denied<S: AsRef<str>>(bucket: S) -> Self {
        Error::AccessDenied {
            bucket: bucket.as_ref().to_string(),
        }
    }

    pub fn listing<S: Into<String>>(bucket: &str, prefix: &str, reason: S, transient: bool) -> Self {
        Error::Listing {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            reason: reason.into(),
            transient,
        }
    }

    pub fn download<S: Into<String>>(bucket: &str, key: &str, reason: S, transient: bool) -> Self {
        Error::Download {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason: reason.into(),
            transient,
        }
    }

    /// Stable, machine-distinguishable code for this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Error::MalformedReference { .. } => "MALFORMED_REFERENCE",
            Error::BucketNotFound { .. } => "BUCKET_NOT_FOUND",
            Error::AccessDenied { .. } => "ACCESS_DENIED",
            Error::NoObjectsMatched { .. } => "NO_OBJECTS_MATCHED",
            Error::Listing { .. } => "LIST_FAILED",
            Error::Download { .. } => "DOWNLOAD_FAILED",
            Error::Escape { .. } => "ESCAPE_FAILED",
            Error::Config(_) => "CONFIG",
            Error::Io(_) => "IO",
        }
    }

    /// Whether a retry of the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Listing { transient, .. } | Error::Download { transient, .. } => *transient,
            _ => false,
        }
    }
}

/// Result type for objcache operations
pub type Result<T> = std::result::Result<T, Error>;
