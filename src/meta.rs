//! Embedded metadata store.
//!
//! Maps stream path to its serialized metadata plus the on-disk directory
//! name, backed by an LMDB environment. Every operation is a single
//! transaction, so callers see linearizable single-key reads and writes;
//! the partial-update helpers (`update_offset`, `update_append_state`,
//! `set_closed`) are atomic read-modify-writes that leave unrelated fields
//! untouched.
//!
//! LMDB read views are transaction-scoped; the `SerdeJson` codec decodes
//! into owned values before the transaction ends, so returned records are
//! safe to hold. Records serialize as JSON and decoding ignores unknown
//! fields, which keeps old binaries readable by newer ones.

use std::path::Path;

use heed::types::{SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{ClosedBy, Offset, ProducerState, StreamMetadata};

const MAP_SIZE: usize = 1024 * 1024 * 1024;
const DB_NAME: &str = "streams";

/// A persisted stream row: metadata plus its directory assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    pub metadata: StreamMetadata,
    /// Directory name under `<dataDir>/streams`, stable once assigned.
    pub dir_name: String,
}

pub struct MetadataStore {
    env: Env,
    db: Database<Str, SerdeJson<StreamRecord>>,
}

impl MetadataStore {
    /// Open (or create) the store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let env = unsafe { EnvOpenOptions::new().map_size(MAP_SIZE).max_dbs(1).open(dir)? };
        let mut wtxn = env.write_txn()?;
        let db = env.create_database(&mut wtxn, Some(DB_NAME))?;
        wtxn.commit()?;
        Ok(Self { env, db })
    }

    /// Insert or replace the record for its path.
    pub fn put(&self, record: &StreamRecord) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, &record.metadata.path, record)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<Option<StreamRecord>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db.get(&rtxn, path)?)
    }

    pub fn has(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.get(path)?.is_some())
    }

    /// Delete the record for `path`; missing paths are not an error.
    pub fn delete(&self, path: &str) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let existed = self.db.delete(&mut wtxn, path)?;
        wtxn.commit()?;
        Ok(existed)
    }

    pub fn list(&self) -> Result<Vec<StreamRecord>, StoreError> {
        let mut records = Vec::new();
        self.for_each(|record| records.push(record))?;
        Ok(records)
    }

    pub fn for_each<F: FnMut(StreamRecord)>(&self, mut f: F) -> Result<(), StoreError> {
        let rtxn = self.env.read_txn()?;
        for item in self.db.iter(&rtxn)? {
            let (_, record) = item?;
            f(record);
        }
        Ok(())
    }

    /// Atomically set the tail offset and stream-level sequence.
    pub fn update_offset(
        &self,
        path: &str,
        offset: Offset,
        last_seq: Option<String>,
    ) -> Result<(), StoreError> {
        self.modify(path, |record| {
            record.metadata.current_offset = offset;
            record.metadata.last_seq = last_seq;
        })
    }

    /// Atomically apply everything a successful append can emit.
    pub fn update_append_state(
        &self,
        path: &str,
        offset: Offset,
        last_seq: Option<String>,
        producer: Option<(&str, ProducerState)>,
        closed: Option<bool>,
        closed_by: Option<ClosedBy>,
    ) -> Result<(), StoreError> {
        self.modify(path, |record| {
            record.metadata.current_offset = offset;
            record.metadata.last_seq = last_seq;
            if let Some((id, state)) = producer {
                record.metadata.producers.insert(id.to_string(), state);
            }
            if let Some(closed) = closed {
                record.metadata.closed = closed;
            }
            if closed_by.is_some() {
                record.metadata.closed_by = closed_by;
            }
        })
    }

    /// Atomically set the closed flag.
    pub fn set_closed(
        &self,
        path: &str,
        closed: bool,
        closed_by: Option<ClosedBy>,
    ) -> Result<(), StoreError> {
        self.modify(path, |record| {
            record.metadata.closed = closed;
            if closed_by.is_some() {
                record.metadata.closed_by = closed_by;
            }
        })
    }

    /// Flush the environment to durable storage.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.env.force_sync()?;
        Ok(())
    }

    fn modify<F>(&self, path: &str, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StreamRecord),
    {
        let mut wtxn = self.env.write_txn()?;
        let mut record = self
            .db
            .get(&wtxn, path)?
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        apply(&mut record);
        self.db.put(&mut wtxn, path, &record)?;
        wtxn.commit()?;
        Ok(())
    }
}
