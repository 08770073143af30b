// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Durable ordered key-value map (spec §4.1). Single-writer per process;
//! `⊥` for absent keys is distinguished from other errors by returning
//! `Ok(None)`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CacheError, CacheResult};

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: Vec<u8>) -> CacheResult<()>;
    fn delete(&self, key: &str) -> CacheResult<()>;
    /// Lexicographic scan of every key carrying `prefix`.
    fn iter_prefix(&self, prefix: &str) -> CacheResult<Vec<(String, Vec<u8>)>>;
    fn clear(&self) -> CacheResult<()>;
}

/// In-process store backed by a `BTreeMap`, used by every test in the
/// crate that doesn't specifically exercise [`RocksDbStore`].
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> CacheResult<()> {
        self.inner.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    fn iter_prefix(&self, prefix: &str) -> CacheResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .inner
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear(&self) -> CacheResult<()> {
        self.inner.write().clear();
        Ok(())
    }
}

/// Durable store backed by a single `rocksdb::DB` opened read-write once
/// per process, enforcing the single-writer discipline required by
/// spec §1.
pub struct RocksDbStore {
    db: Arc<rocksdb::DB>,
}

impl RocksDbStore {
    pub fn open(path: impl AsRef<Path>) -> CacheResult<Self> {
        let mut options = rocksdb::Options::default();
        options.create_if_missing(true);
        let db = rocksdb::DB::open(&options, path).map_err(|e| CacheError::Storage(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }
}

impl KvStore for RocksDbStore {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.db
            .get(key.as_bytes())
            .map_err(|e| CacheError::Storage(e.to_string()))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> CacheResult<()> {
        self.db
            .put(key.as_bytes(), value)
            .map_err(|e| CacheError::Storage(e.to_string()))
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.db
            .delete(key.as_bytes())
            .map_err(|e| CacheError::Storage(e.to_string()))
    }

    fn iter_prefix(&self, prefix: &str) -> CacheResult<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        let iter = self.db.prefix_iterator(prefix.as_bytes());
        for item in iter {
            let (key, value) = item.map_err(|e| CacheError::Storage(e.to_string()))?;
            let key = String::from_utf8_lossy(&key).to_string();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }

    fn clear(&self) -> CacheResult<()> {
        let keys: Vec<String> = self
            .db
            .iterator(rocksdb::IteratorMode::Start)
            .filter_map(|item| item.ok())
            .map(|(k, _)| String::from_utf8_lossy(&k).to_string())
            .collect();
        for key in keys {
            self.db
                .delete(key.as_bytes())
                .map_err(|e| CacheError::Storage(e.to_string()))?;
        }
        Ok(())
    }
}
