// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Remote reference parsing
//!
//! A catalog query template embeds remote objects as quoted literals, e.g.
//! `SELECT * FROM read_csv_auto('s3://bucket/dir/*.csv')`. [`QueryTemplate`]
//! splits such a template into verbatim text fragments and typed
//! [`RemoteReference`]s, so that the references can later be replaced by
//! escaped local paths without touching any other byte of the template.
//!
//! Two address forms are recognized and normalize to the same shape:
//! - `s3://bucket/key` (also `s3a://`)
//! - `http(s)://[user:pass@]host[:port]/buckets/{bucket}/objects/{key}` or
//!   the path-style `http(s)://host/{bucket}/{key}`
//!
//! Inside a template, an http(s) literal is only a reference when it uses the
//! `/buckets/{bucket}/objects/{key}` path or its host is one of the storage
//! hosts given to [`QueryTemplate::parse_with_hosts`]. Any other URL literal
//! is ordinary text.

use crate::error::{Error, Result};

/// Transport named by the reference. The storage backend is configured
/// separately; the scheme only determines how the address is decomposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    S3,
    Http,
}

impl Scheme {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "s3" | "s3a" => Some(Scheme::S3),
            "http" | "https" => Some(Scheme::Http),
            _ => None,
        }
    }
}

/// The single wildcard segment of a pattern reference.
///
/// `prefix` is everything before the final segment (including the trailing
/// `/`, possibly empty); `glob` is the final segment and contains exactly one
/// `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardSegment {
    pub prefix: String,
    pub glob: String,
}

/// Where a reference literal sits in the surrounding query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceContext {
    /// Literal follows `(` or `,`: an argument to a table function.
    FunctionArgument,
    /// Literal used directly as a relation, e.g. `FROM 's3://b/k.parquet'`.
    TableLiteral,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteReference {
    pub scheme: Scheme,
    pub bucket: String,
    pub key: String,
    pub wildcard: Option<WildcardSegment>,
    /// Original substring of the template, quotes included.
    pub raw_text: String,
    pub context: ReferenceContext,
}

impl RemoteReference {
    /// Parse a bare address such as `s3://bucket/key.csv`.
    pub fn parse(address: &str) -> Result<Self> {
        Self::parse_in_context(address, address, ReferenceContext::TableLiteral)
    }

    fn parse_in_context(address: &str, raw_text: &str, context: ReferenceContext) -> Result<Self> {
        let (scheme_name, rest) = address
            .split_once("://")
            .ok_or_else(|| Error::malformed(address, "missing scheme"))?;
        let scheme = Scheme::parse(scheme_name).ok_or_else(|| {
            Error::malformed(address, format!("unrecognized scheme '{scheme_name}'"))
        })?;

        let (bucket, key) = match scheme {
            Scheme::S3 => split_s3(rest),
            Scheme::Http => split_http(rest),
        };

        if bucket.is_empty() {
            return Err(Error::malformed(address, "missing bucket"));
        }
        if key.is_empty() {
            return Err(Error::malformed(address, "missing object key"));
        }

        let wildcard = parse_wildcard(address, &key)?;

        Ok(Self {
            scheme,
            bucket,
            key,
            wildcard,
            raw_text: raw_text.to_string(),
            context,
        })
    }

    /// The implicit pattern reference of a bucket/prefix catalog entry:
    /// every object under `prefix` whose name ends in `.{extension}`.
    pub fn bucket_prefix(bucket: &str, prefix: &str, extension: &str) -> Result<Self> {
        let address = format!("s3://{bucket}/{prefix}*.{extension}");
        if bucket.is_empty() {
            return Err(Error::malformed(&address, "missing bucket"));
        }
        if prefix.contains('*') || extension.contains('*') || extension.contains('/') {
            return Err(Error::malformed(&address, "prefix and format must not contain wildcards"));
        }
        let prefix = normalize_prefix(prefix);
        Ok(Self {
            scheme: Scheme::S3,
            bucket: bucket.to_string(),
            key: format!("{prefix}*.{extension}"),
            wildcard: Some(WildcardSegment {
                prefix,
                glob: format!("*.{extension}"),
            }),
            raw_text: address,
            context: ReferenceContext::TableLiteral,
        })
    }

    #[must_use]
    pub fn is_pattern(&self) -> bool {
        self.wildcard.is_some()
    }

    /// Prefix to hand to the lister: the directory part for a pattern, the
    /// full key otherwise.
    #[must_use]
    pub fn list_prefix(&self) -> &str {
        match &self.wildcard {
            Some(w) => &w.prefix,
            None => &self.key,
        }
    }

    /// File extension named by the reference, if it has a fixed one.
    #[must_use]
    pub fn extension(&self) -> Option<&str> {
        let last = self.key.rsplit('/').next().unwrap_or(&self.key);
        let (_, ext) = last.rsplit_once('.')?;
        if ext.is_empty() || ext.contains('*') {
            None
        } else {
            Some(ext)
        }
    }
}

/// Bucket prefixes name a directory; `web` and `web/` are the same prefix.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

fn split_s3(rest: &str) -> (String, String) {
    match rest.split_once('/') {
        Some((bucket, key)) => (bucket.to_string(), key.trim_start_matches('/').to_string()),
        None => (rest.to_string(), String::new()),
    }
}

/// Non-empty path segments of the part of a URL after `scheme://`.
fn http_segments(rest: &str) -> Vec<&str> {
    let path = match rest.split_once('/') {
        Some((_authority, path)) => path,
        None => "",
    };
    let path = path.split(['?', '#']).next().unwrap_or("");
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn is_rest_path(segments: &[&str]) -> bool {
    segments.len() >= 4 && segments[0] == "buckets" && segments[2] == "objects"
}

/// Lowercased host of the part of a URL after `scheme://`, without
/// credentials or port.
fn authority_host(rest: &str) -> &str {
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    if let Some(bracketed) = host_port.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or("");
    }
    host_port.split(':').next().unwrap_or("")
}

/// Host of a storage endpoint URL such as `http://minio:9000`, lowercased.
/// Endpoints without a scheme are taken as a bare `host[:port]`.
#[must_use]
pub fn endpoint_host(endpoint: &str) -> Option<String> {
    let rest = endpoint.split_once("://").map_or(endpoint, |(_, rest)| rest);
    let host = authority_host(rest.trim());
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

fn split_http(rest: &str) -> (String, String) {
    // Host, credentials and port are decided by configuration, not the URL.
    let segments = http_segments(rest);

    if is_rest_path(&segments) {
        (segments[1].to_string(), segments[3..].join("/"))
    } else if let Some((bucket, key)) = segments.split_first() {
        ((*bucket).to_string(), key.join("/"))
    } else {
        (String::new(), String::new())
    }
}

fn parse_wildcard(address: &str, key: &str) -> Result<Option<WildcardSegment>> {
    let stars = key.matches('*').count();
    if stars == 0 {
        return Ok(None);
    }
    if key.contains("**") {
        return Err(Error::malformed(address, "recursive wildcard '**' is not supported"));
    }
    if stars > 1 {
        return Err(Error::malformed(address, "more than one wildcard segment"));
    }

    let (prefix, glob) = match key.rsplit_once('/') {
        Some((dir, last)) => (format!("{dir}/"), last.to_string()),
        None => (String::new(), key.to_string()),
    };
    if !glob.contains('*') {
        return Err(Error::malformed(address, "wildcard must be in the final key segment"));
    }

    Ok(Some(WildcardSegment { prefix, glob }))
}

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Fragment {
    /// Verbatim template text.
    Text(String),
    /// Index into [`QueryTemplate::references`].
    Reference(usize),
}

/// A query template split into verbatim text and remote references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    source: String,
    fragments: Vec<Fragment>,
    references: Vec<RemoteReference>,
}

impl QueryTemplate {
    /// Parse every remote reference out of `template`.
    ///
    /// Only quoted literals are inspected; comments are skipped. Literals of
    /// the form `file://...` are local and stay in the text, as do http(s)
    /// URLs that are not in the `/buckets/{bucket}/objects/{key}` form.
    pub fn parse(template: &str) -> Result<Self> {
        Self::parse_with_hosts(template, &[])
    }

    /// Like [`QueryTemplate::parse`], but path-style http(s) URLs whose host
    /// is in `storage_hosts` are references too. Hosts compare without case,
    /// credentials or port.
    pub fn parse_with_hosts(template: &str, storage_hosts: &[String]) -> Result<Self> {
        let bytes = template.as_bytes();
        let mut fragments = Vec::new();
        let mut references = Vec::new();
        let mut text_start = 0;
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    i = find_from(template, i, "\n").map_or(bytes.len(), |n| n + 1);
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    i = find_from(template, i + 2, "*/").map_or(bytes.len(), |n| n + 2);
                }
                quote @ (b'\'' | b'"') => {
                    let Some(end) = literal_end(bytes, i, quote) else {
                        // Unterminated literal: left for the query engine to report.
                        break;
                    };
                    let doubled = if quote == b'\'' { "''" } else { "\"\"" };
                    let single = if quote == b'\'' { "'" } else { "\"" };
                    let content = template[i + 1..end].replace(doubled, single);

                    if is_remote_candidate(&content, storage_hosts) {
                        let context = context_before(&template[..i]);
                        let raw = &template[i..=end];
                        let reference = RemoteReference::parse_in_context(&content, raw, context)?;
                        if i > text_start {
                            fragments.push(Fragment::Text(template[text_start..i].to_string()));
                        }
                        fragments.push(Fragment::Reference(references.len()));
                        references.push(reference);
                        text_start = end + 1;
                    }
                    i = end + 1;
                }
                _ => i += 1,
            }
        }

        if text_start < bytes.len() {
            fragments.push(Fragment::Text(template[text_start..].to_string()));
        }

        Ok(Self {
            source: template.to_string(),
            fragments,
            references,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn references(&self) -> &[RemoteReference] {
        &self.references
    }

    /// Reassemble the template with `replacements[i]` standing in for the
    /// i-th reference literal. All other text is copied verbatim.
    pub fn render(&self, replacements: &[String]) -> Result<String> {
        if replacements.len() != self.references.len() {
            return Err(Error::Config(format!(
                "template has {} references but {} replacements were supplied",
                self.references.len(),
                replacements.len()
            )));
        }
        let mut out = String::with_capacity(self.source.len());
        for fragment in &self.fragments {
            match fragment {
                Fragment::Text(text) => out.push_str(text),
                Fragment::Reference(idx) => out.push_str(&replacements[*idx]),
            }
        }
        Ok(out)
    }
}

fn find_from(haystack: &str, from: usize, needle: &str) -> Option<usize> {
    haystack[from..].find(needle).map(|n| n + from)
}

/// Index of the closing quote for the literal opened at `start`.
fn literal_end(bytes: &[u8], start: usize, quote: u8) -> Option<usize> {
    let mut j = start + 1;
    while j < bytes.len() {
        if bytes[j] == quote {
            if bytes.get(j + 1) == Some(&quote) {
                j += 2;
                continue;
            }
            return Some(j);
        }
        j += 1;
    }
    None
}

fn is_remote_candidate(content: &str, storage_hosts: &[String]) -> bool {
    let Some((scheme, rest)) = content.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    let starts_alpha = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    if !starts_alpha || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return false;
    }
    match Scheme::parse(scheme) {
        Some(Scheme::Http) => {
            is_rest_path(&http_segments(rest))
                || storage_hosts
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(authority_host(rest)))
        }
        Some(Scheme::S3) => true,
        None => !scheme.eq_ignore_ascii_case("file"),
    }
}

fn context_before(preceding: &str) -> ReferenceContext {
    match preceding.trim_end().chars().last() {
        Some('(' | ',') => ReferenceContext::FunctionArgument,
        _ => ReferenceContext::TableLiteral,
    }
}
