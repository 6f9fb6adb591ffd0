// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::config::Config;
use anyhow::Result;
use objcache::{ObjectLister, ObjectStoreStorage, RetryPolicy};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Remove cached files: all of them, or only those older than `older_than`.
///
/// Never contacts storage, so it works without credentials.
pub async fn clear_cache_command(
    config: &Config,
    older_than: Option<Duration>,
    out: &mut impl Write,
) -> Result<()> {
    let Some(dir) = &config.cache.dir else {
        writeln!(out, "No cache directory configured; nothing to clear")?;
        return Ok(());
    };

    let offline = ObjectLister::new(Arc::new(ObjectStoreStorage::new()), RetryPolicy::none());
    let cache = objcache::DownloadCache::open(config.cache_options(), offline)?;
    let shown = dir.display();

    match older_than {
        Some(age) => {
            let removed = cache.evict_older_than(age)?;
            let secs = age.as_secs();
            writeln!(out, "Removed {removed} files older than {secs}s from {shown}")?;
        }
        None => {
            cache.clear()?;
            writeln!(out, "Cleared cache {shown}")?;
        }
    }
    Ok(())
}
