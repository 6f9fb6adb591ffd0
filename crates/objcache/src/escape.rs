// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Quoting local paths as single-quoted SQL string literals

use crate::error::{Error, Result};
use std::path::Path;

/// Separator convention of the paths being escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    Posix,
    /// Backslash separators, which are doubled inside the literal.
    Windows,
}

impl PathStyle {
    /// Convention of the platform this process runs on.
    #[must_use]
    pub fn host() -> Self {
        if cfg!(windows) {
            PathStyle::Windows
        } else {
            PathStyle::Posix
        }
    }
}

impl Default for PathStyle {
    fn default() -> Self {
        Self::host()
    }
}

/// Turns a local path into a quoted literal that reads back as exactly the
/// same path. Escaping is not idempotent: apply it once per value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiteralEscaper {
    style: PathStyle,
}

impl LiteralEscaper {
    #[must_use]
    pub fn new(style: PathStyle) -> Self {
        Self { style }
    }

    pub fn escape(&self, path: &Path) -> Result<String> {
        let Some(text) = path.to_str() else {
            return Err(Error::Escape {
                path: path.to_string_lossy().into_owned(),
                reason: "path is not valid UTF-8".into(),
            });
        };
        self.escape_str(text)
    }

    pub fn escape_str(&self, text: &str) -> Result<String> {
        if text.contains('\0') {
            return Err(Error::Escape {
                path: text.replace('\0', "\\0"),
                reason: "path contains a NUL byte".into(),
            });
        }

        let mut out = String::with_capacity(text.len() + 2);
        out.push('\'');
        for c in text.chars() {
            match c {
                '\\' if self.style == PathStyle::Windows => out.push_str("\\\\"),
                '\'' => out.push_str("''"),
                c => out.push(c),
            }
        }
        out.push('\'');
        Ok(out)
    }

    /// Read a literal produced by [`Self::escape_str`] back into the raw text.
    #[cfg(test)]
    fn unescape(&self, literal: &str) -> Result<String> {
        let bad = |reason: &str| Error::Escape {
            path: literal.to_string(),
            reason: reason.to_string(),
        };

        let inner = literal
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .filter(|_| literal.len() >= 2)
            .ok_or_else(|| bad("literal is not single-quoted"))?;

        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            match c {
                '\'' => match chars.next() {
                    Some('\'') => out.push('\''),
                    _ => return Err(bad("unpaired quote inside literal")),
                },
                '\\' if self.style == PathStyle::Windows => match chars.next() {
                    Some('\\') => out.push('\\'),
                    _ => return Err(bad("unpaired backslash inside literal")),
                },
                c => out.push(c),
            }
        }
        Ok(out)
    }
}
