// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Catalog resolution and query-engine registration
//!
//! A [`Catalog`] names tables backed by remote objects. The
//! [`Orchestrator`] resolves each entry into SQL that reads only local,
//! cached files, and the [`Engine`] registers those as DuckDB views.

mod catalog;
mod engine;
mod error;
mod orchestrator;

pub use catalog::{Catalog, CatalogEntry, Format, RejectedEntry, is_valid_table_name};
pub use engine::{Engine, LoadReport};
pub use error::{QueryError, ResolveError, Result};
pub use orchestrator::{DUMMY_QUERY, Orchestrator, ResolveOptions, ResolvedTable};
