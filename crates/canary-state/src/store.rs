//! StateStore — redb-backed persistence for releases.
//!
//! Provides the `ReleaseStore` operations the controller depends on: the
//! durable stable tag per service, the current `ServiceRelease`, and the
//! append-only rollout history. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Stable tag reported for a service that has never been promoted.
pub const DEFAULT_STABLE_TAG: &str = "latest";

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Persistence contract used by the canary controller.
///
/// `set_stable` must be durable before it returns. Everything else is
/// bookkeeping that the controller can re-issue.
pub trait ReleaseStore: Send + Sync {
    /// Promoted tag for a service, or the configured default when unset.
    fn get_stable(&self, service: &str) -> StateResult<String>;

    /// Record a new promoted tag.
    fn set_stable(&self, service: &str, tag: &str) -> StateResult<()>;

    fn put_release(&self, release: &ServiceRelease) -> StateResult<()>;

    fn get_release(&self, service: &str) -> StateResult<Option<ServiceRelease>>;

    fn list_releases(&self) -> StateResult<Vec<ServiceRelease>>;

    /// Append a sealed rollout record. Existing records are never rewritten.
    fn append_record(&self, record: &RolloutRecord) -> StateResult<()>;

    /// Rollout records for a service, oldest first.
    fn list_records(&self, service: &str) -> StateResult<Vec<RolloutRecord>>;
}

/// Thread-safe release store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    default_tag: String,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            default_tag: DEFAULT_STABLE_TAG.to_string(),
        };
        store.ensure_tables()?;
        debug!(?path, "release store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            default_tag: DEFAULT_STABLE_TAG.to_string(),
        };
        store.ensure_tables()?;
        debug!("in-memory release store opened");
        Ok(store)
    }

    /// Override the tag returned for services with no promoted version.
    pub fn with_default_tag(mut self, tag: &str) -> Self {
        self.default_tag = tag.to_string();
        self
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(STABLE_TAGS).map_err(map_err!(Table))?;
        txn.open_table(RELEASES).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

impl ReleaseStore for StateStore {
    // ── Stable tags ────────────────────────────────────────────────

    fn get_stable(&self, service: &str) -> StateResult<String> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STABLE_TAGS).map_err(map_err!(Table))?;
        match table.get(service).map_err(map_err!(Read))? {
            Some(guard) => Ok(guard.value().to_string()),
            None => Ok(self.default_tag.clone()),
        }
    }

    fn set_stable(&self, service: &str, tag: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STABLE_TAGS).map_err(map_err!(Table))?;
            table.insert(service, tag).map_err(map_err!(Write))?;
        }
        // The commit is the durability point.
        txn.commit().map_err(map_err!(Write))?;
        debug!(%service, %tag, "stable tag stored");
        Ok(())
    }

    // ── Releases ───────────────────────────────────────────────────

    fn put_release(&self, release: &ServiceRelease) -> StateResult<()> {
        let value = serde_json::to_vec(release).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            table
                .insert(release.service.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_release(&self, service: &str) -> StateResult<Option<ServiceRelease>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        match table.get(service).map_err(map_err!(Read))? {
            Some(guard) => {
                let release: ServiceRelease =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(release))
            }
            None => Ok(None),
        }
    }

    fn list_releases(&self) -> StateResult<Vec<ServiceRelease>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let release: ServiceRelease =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(release);
        }
        Ok(results)
    }

    // ── Rollout history ────────────────────────────────────────────

    fn append_record(&self, record: &RolloutRecord) -> StateResult<()> {
        if !record.is_sealed() {
            return Err(StateError::Unsealed(record.id.clone()));
        }
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let exists = table.get(key.as_str()).map_err(map_err!(Read))?.is_some();
            if exists {
                return Err(StateError::Duplicate(record.id.clone()));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, outcome = ?record.outcome, "rollout record appended");
        Ok(())
    }

    fn list_records(&self, service: &str) -> StateResult<Vec<RolloutRecord>> {
        let prefix = format!("{service}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: RolloutRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }
}
