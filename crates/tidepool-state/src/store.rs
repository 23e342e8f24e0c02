//! StateStore — redb-backed persistence for Tidepool.
//!
//! Provides typed operations over job records and the dedup index. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tidepool_core::EpochMillis;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Result of [`StateStore::lookup_or_create`].
#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    /// No live entry existed; this record was created and indexed.
    Created(JobRecord),
    /// A live entry already points at this job.
    Existing(JobId),
}

impl DedupOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Created(record) => &record.id,
            Self::Existing(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// What a purge pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub jobs: usize,
    pub dedup_entries: usize,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(DEDUP).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or replace a job record.
    pub fn put_job(&self, record: &JobRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_id = %record.id, state = %record.state, "job stored");
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> StateResult<Option<JobRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(job_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: JobRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn list_jobs(&self) -> StateResult<Vec<JobRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: JobRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete a job by id. Returns true if it existed.
    pub fn delete_job(&self, job_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            existed = table.remove(job_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%job_id, existed, "job deleted");
        Ok(existed)
    }

    // ── Dedup ──────────────────────────────────────────────────────

    pub fn get_dedup(&self, fingerprint: &str) -> StateResult<Option<DedupEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEDUP).map_err(map_err!(Table))?;
        match table.get(fingerprint).map_err(map_err!(Read))? {
            Some(guard) => {
                let entry: DedupEntry =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Return the job serving `fingerprint`, creating it if there is none.
    ///
    /// Runs as one write transaction: the lookup, the call to `create`,
    /// and the insertion of both the dedup entry and the new job record
    /// commit together. redb admits a single writer at a time, so for any
    /// fingerprint `create` runs at most once per entry lifetime no matter
    /// how many callers race. An entry past `expires_at` counts as absent.
    pub fn lookup_or_create(
        &self,
        fingerprint: &str,
        now: EpochMillis,
        ttl_ms: i64,
        create: impl FnOnce() -> JobRecord,
    ) -> StateResult<DedupOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut dedup = txn.open_table(DEDUP).map_err(map_err!(Table))?;
            let existing = match dedup.get(fingerprint).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice::<DedupEntry>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };

            match existing {
                Some(entry) if entry.is_live(now) => DedupOutcome::Existing(entry.job_id),
                _ => {
                    let record = create();
                    let entry = DedupEntry {
                        fingerprint: fingerprint.to_string(),
                        job_id: record.id.clone(),
                        expires_at: now.saturating_add(ttl_ms),
                    };
                    let entry_bytes = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
                    let record_bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                    dedup
                        .insert(fingerprint, entry_bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
                    jobs.insert(record.id.as_str(), record_bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    DedupOutcome::Created(record)
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%fingerprint, job_id = %outcome.job_id(), created = outcome.is_created(), "dedup lookup");
        Ok(outcome)
    }

    /// Remove the entry for `fingerprint` if it still points at `job_id`.
    pub fn release_dedup(&self, fingerprint: &str, job_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(DEDUP).map_err(map_err!(Table))?;
            let points_here = match table.get(fingerprint).map_err(map_err!(Read))? {
                Some(guard) => {
                    let entry: DedupEntry =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    entry.job_id == job_id
                }
                None => false,
            };
            removed = points_here && table.remove(fingerprint).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%fingerprint, %job_id, removed, "dedup entry released");
        Ok(removed)
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Drop expired dedup entries and terminal jobs older than `retention_ms`.
    pub fn purge_expired(&self, now: EpochMillis, retention_ms: i64) -> StateResult<PurgeStats> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut stats = PurgeStats::default();
        {
            let mut dedup = txn.open_table(DEDUP).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for entry in dedup.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let entry: DedupEntry =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if !entry.is_live(now) {
                    expired.push(key.value().to_string());
                }
            }
            for key in &expired {
                dedup.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            stats.dedup_entries = expired.len();

            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for entry in jobs.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let record: JobRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if record.is_expired(now, retention_ms) {
                    expired.push(key.value().to_string());
                }
            }
            for key in &expired {
                jobs.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            stats.jobs = expired.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(jobs = stats.jobs, dedup_entries = stats.dedup_entries, "purge pass");
        Ok(stats)
    }
}
