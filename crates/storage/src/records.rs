use anyhow::anyhow;
use async_trait::async_trait;
use gateway_types::ProofJobRecord;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("General error: {0}")]
    General(#[from] anyhow::Error),
    #[error("Corrupt key in store: {0}")]
    CorruptKey(String),
}

pub const RECORD_KEY_PREFIX: &str = "job:";
pub const ACTIVE_JOB_KEY: &str = "active_job_id";

fn record_key(job_id: Uuid) -> Vec<u8> {
    format!("{RECORD_KEY_PREFIX}{job_id}").into_bytes()
}

/// Durable keyed store for job records plus the single active-slot token.
///
/// The store itself imposes no cross-key transactions; the coordinator is
/// the only writer and serializes every mutation, so a single-key atomic
/// overwrite is all that is required.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, job_id: Uuid) -> Result<Option<ProofJobRecord>, RecordStoreError>;

    async fn put(&self, record: &ProofJobRecord) -> Result<(), RecordStoreError>;

    async fn delete(&self, job_id: Uuid) -> Result<(), RecordStoreError>;

    /// Scan records in key order, starting strictly after `start_after` when
    /// given, returning at most `limit` records per page.
    async fn scan(
        &self,
        start_after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<ProofJobRecord>, RecordStoreError>;

    async fn active_job_id(&self) -> Result<Option<Uuid>, RecordStoreError>;

    /// Atomic single-key overwrite of the active-slot token; `None` clears it.
    async fn set_active_job_id(&self, job_id: Option<Uuid>) -> Result<(), RecordStoreError>;
}

pub struct RocksDbRecordStore {
    db: Arc<DB>,
}

const CF_RECORDS: &str = "records";
const CF_META: &str = "meta";

impl RocksDbRecordStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RecordStoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_RECORDS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn get_cf(&self, name: &str) -> Result<&ColumnFamily, RecordStoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow!("Column family {name} not found").into())
    }
}

#[async_trait]
impl RecordStore for RocksDbRecordStore {
    async fn get(&self, job_id: Uuid) -> Result<Option<ProofJobRecord>, RecordStoreError> {
        let cf = self.get_cf(CF_RECORDS)?;
        match self.db.get_cf(cf, record_key(job_id))? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, record: &ProofJobRecord) -> Result<(), RecordStoreError> {
        let cf = self.get_cf(CF_RECORDS)?;
        let value = bincode::serialize(record)?;
        self.db.put_cf(cf, record_key(record.job_id), value)?;
        Ok(())
    }

    async fn delete(&self, job_id: Uuid) -> Result<(), RecordStoreError> {
        let cf = self.get_cf(CF_RECORDS)?;
        self.db.delete_cf(cf, record_key(job_id))?;
        Ok(())
    }

    async fn scan(
        &self,
        start_after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<ProofJobRecord>, RecordStoreError> {
        let cf = self.get_cf(CF_RECORDS)?;

        let start_key = match start_after {
            Some(id) => {
                // Strictly after: append a zero byte to skip the exact key.
                let mut key = record_key(id);
                key.push(0);
                key
            }
            None => RECORD_KEY_PREFIX.as_bytes().to_vec(),
        };

        let mut results = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));

        for item in iter {
            if results.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(RECORD_KEY_PREFIX.as_bytes()) {
                break;
            }
            results.push(bincode::deserialize(&value)?);
        }

        Ok(results)
    }

    async fn active_job_id(&self) -> Result<Option<Uuid>, RecordStoreError> {
        let cf = self.get_cf(CF_META)?;
        match self.db.get_cf(cf, ACTIVE_JOB_KEY)? {
            Some(data) => {
                let raw = String::from_utf8(data.to_vec())
                    .map_err(|e| RecordStoreError::CorruptKey(e.to_string()))?;
                let id = Uuid::parse_str(&raw)
                    .map_err(|e| RecordStoreError::CorruptKey(e.to_string()))?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    async fn set_active_job_id(&self, job_id: Option<Uuid>) -> Result<(), RecordStoreError> {
        let cf = self.get_cf(CF_META)?;
        match job_id {
            Some(id) => self.db.put_cf(cf, ACTIVE_JOB_KEY, id.to_string().as_bytes())?,
            None => self.db.delete_cf(cf, ACTIVE_JOB_KEY)?,
        }
        Ok(())
    }
}

pub mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory store for coordinator and pipeline tests.
    #[derive(Default)]
    pub struct MemoryRecordStore {
        records: Mutex<BTreeMap<String, ProofJobRecord>>,
        active: Mutex<Option<Uuid>>,
    }

    impl MemoryRecordStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn len(&self) -> usize {
            self.records.lock().unwrap().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    #[async_trait]
    impl RecordStore for MemoryRecordStore {
        async fn get(&self, job_id: Uuid) -> Result<Option<ProofJobRecord>, RecordStoreError> {
            let records = self.records.lock().unwrap();
            Ok(records.get(&format!("{RECORD_KEY_PREFIX}{job_id}")).cloned())
        }

        async fn put(&self, record: &ProofJobRecord) -> Result<(), RecordStoreError> {
            let mut records = self.records.lock().unwrap();
            records.insert(format!("{RECORD_KEY_PREFIX}{}", record.job_id), record.clone());
            Ok(())
        }

        async fn delete(&self, job_id: Uuid) -> Result<(), RecordStoreError> {
            let mut records = self.records.lock().unwrap();
            records.remove(&format!("{RECORD_KEY_PREFIX}{job_id}"));
            Ok(())
        }

        async fn scan(
            &self,
            start_after: Option<Uuid>,
            limit: usize,
        ) -> Result<Vec<ProofJobRecord>, RecordStoreError> {
            let records = self.records.lock().unwrap();
            let start = start_after
                .map(|id| format!("{RECORD_KEY_PREFIX}{id}\0"))
                .unwrap_or_else(|| RECORD_KEY_PREFIX.to_string());
            Ok(records
                .range(start..)
                .take(limit)
                .map(|(_, record)| record.clone())
                .collect())
        }

        async fn active_job_id(&self) -> Result<Option<Uuid>, RecordStoreError> {
            Ok(*self.active.lock().unwrap())
        }

        async fn set_active_job_id(&self, job_id: Option<Uuid>) -> Result<(), RecordStoreError> {
            *self.active.lock().unwrap() = job_id;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_types::{now_unix_s, JobStatus, TapeInfo, TapeMetadata};
    use tempfile::TempDir;

    fn sample_record() -> ProofJobRecord {
        let metadata = TapeMetadata {
            seed: 7,
            frame_count: 10,
            final_score: 42,
            final_rng_state: 9,
            checksum: 0xABCD,
        };
        let tape = TapeInfo {
            size_bytes: 38,
            blob_key: "proof-jobs/test/input.tape".into(),
            metadata,
        };
        ProofJobRecord::new(tape, "GCLAIMANT".into(), now_unix_s())
    }

    fn open_store() -> (RocksDbRecordStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksDbRecordStore::new(dir.path()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (store, _dir) = open_store();
        let record = sample_record();
        store.put(&record).await.unwrap();

        let loaded = store.get(record.job_id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let (store, _dir) = open_store();
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites_in_place() {
        let (store, _dir) = open_store();
        let mut record = sample_record();
        store.put(&record).await.unwrap();

        record.status = JobStatus::Dispatching;
        record.queue.attempts = 1;
        store.put(&record).await.unwrap();

        let loaded = store.get(record.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Dispatching);
        assert_eq!(loaded.queue.attempts, 1);
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let (store, _dir) = open_store();
        let record = sample_record();
        store.put(&record).await.unwrap();
        store.delete(record.job_id).await.unwrap();
        assert!(store.get(record.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_pages_through_all_records() {
        let (store, _dir) = open_store();
        for _ in 0..5 {
            store.put(&sample_record()).await.unwrap();
        }

        let first_page = store.scan(None, 3).await.unwrap();
        assert_eq!(first_page.len(), 3);

        let last_seen = first_page.last().unwrap().job_id;
        let second_page = store.scan(Some(last_seen), 3).await.unwrap();
        assert_eq!(second_page.len(), 2);

        let mut all: Vec<_> = first_page
            .iter()
            .chain(second_page.iter())
            .map(|r| r.job_id)
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn active_slot_set_and_clear() {
        let (store, _dir) = open_store();
        assert!(store.active_job_id().await.unwrap().is_none());

        let id = Uuid::new_v4();
        store.set_active_job_id(Some(id)).await.unwrap();
        assert_eq!(store.active_job_id().await.unwrap(), Some(id));

        store.set_active_job_id(None).await.unwrap();
        assert!(store.active_job_id().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_matches_rocksdb_behavior() {
        let store = testing::MemoryRecordStore::new();
        let record = sample_record();
        store.put(&record).await.unwrap();
        assert_eq!(store.get(record.job_id).await.unwrap().unwrap(), record);

        let scanned = store.scan(None, 10).await.unwrap();
        assert_eq!(scanned.len(), 1);

        store.set_active_job_id(Some(record.job_id)).await.unwrap();
        assert_eq!(store.active_job_id().await.unwrap(), Some(record.job_id));

        store.delete(record.job_id).await.unwrap();
        assert!(store.is_empty());
    }
}
