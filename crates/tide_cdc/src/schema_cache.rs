//! Per-tablet schema cache with catalog-backed historical resolution.
//!
//! One resolver lives for the lifetime of a producer session on a tablet
//! and is shared by concurrent requests from different consumers. Reads
//! take the shared lock; the first populating load takes the exclusive
//! lock behind a `loaded` flag so a stampede of first requests issues one
//! catalog call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tide_row::schema::TableSchema;
use tide_row::{HybridTime, SchemaVersion};
use tracing::{debug, warn};

use crate::tablet::{CatalogClient, TabletHandle};

pub struct SchemaResolver {
    cache: RwLock<Option<(Arc<TableSchema>, SchemaVersion)>>,
    loaded: AtomicBool,
}

impl Default for SchemaResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaResolver {
    pub fn new() -> Self {
        SchemaResolver {
            cache: RwLock::new(None),
            loaded: AtomicBool::new(false),
        }
    }

    /// The cached schema, if a version has been pinned for this session.
    pub fn cached(&self) -> Option<(Arc<TableSchema>, SchemaVersion)> {
        if !self.loaded.load(Ordering::Acquire) {
            return None;
        }
        self.cache.read().ok()?.clone()
    }

    /// Resolves the schema valid at `read_time`, consulting the catalog and
    /// caching the answer. When the catalog cannot answer, falls back to
    /// the tablet's current schema, the only path that tolerates catalog
    /// unavailability.
    pub async fn resolve_at(
        &self,
        tablet: &dyn TabletHandle,
        catalog: &dyn CatalogClient,
        read_time: HybridTime,
    ) -> (Arc<TableSchema>, SchemaVersion) {
        if let Some(cached) = self.cached() {
            return cached;
        }

        let resolved = match catalog.table_schema_at(tablet.table_id(), read_time).await {
            Ok(Some((schema, version))) => {
                debug!(
                    table = %tablet.table_name(),
                    version,
                    read_time = read_time.as_u64(),
                    "resolved schema version from catalog"
                );
                (Arc::new(schema), version)
            }
            Ok(None) => {
                let (schema, version) = tablet.current_schema();
                warn!(
                    table = %tablet.table_name(),
                    read_time = read_time.as_u64(),
                    fallback_version = version,
                    "catalog has no schema for read time, falling back to tablet schema"
                );
                (Arc::new(schema), version)
            }
            Err(err) => {
                let (schema, version) = tablet.current_schema();
                warn!(
                    table = %tablet.table_name(),
                    read_time = read_time.as_u64(),
                    fallback_version = version,
                    error = %format!("{err:#}"),
                    "catalog lookup failed, falling back to tablet schema"
                );
                (Arc::new(schema), version)
            }
        };

        self.install_arc(resolved.0.clone(), resolved.1);
        resolved
    }

    /// Adopts a schema from a change-metadata log entry. The caller is
    /// expected to cross-check against `resolve_at` afterwards; the catalog
    /// wins on disagreement.
    pub fn install(&self, schema: TableSchema, version: SchemaVersion) {
        self.install_arc(Arc::new(schema), version);
    }

    /// Drops the pinned entry so the next resolution hits the catalog.
    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.cache.write() {
            *guard = None;
            self.loaded.store(false, Ordering::Release);
        }
    }

    fn install_arc(&self, schema: Arc<TableSchema>, version: SchemaVersion) {
        if let Ok(mut guard) = self.cache.write() {
            *guard = Some((schema, version));
            self.loaded.store(true, Ordering::Release);
        }
    }
}
