// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Durable layout of cached transaction sets with content-hash
//! invalidation (spec §4.6).

use std::collections::BTreeMap;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::hash::hash_tx_order;
use crate::kv_store::KvStore;
use crate::subject::{CacheMetadata, Subject, SubjectData, Transaction};

#[derive(Serialize, Deserialize)]
struct PageMeta {
    page_count: usize,
    total_txs: usize,
}

fn now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct SubjectStore {
    kv: Arc<dyn KvStore>,
    max_items_per_key: usize,
    metadata_cache: Mutex<LruCache<String, CacheMetadata>>,
}

impl SubjectStore {
    pub fn new(kv: Arc<dyn KvStore>, max_items_per_key: usize, global_metadata_cache_limit: usize) -> Self {
        let limit = std::num::NonZeroUsize::new(global_metadata_cache_limit.max(1)).unwrap();
        Self {
            kv,
            max_items_per_key,
            metadata_cache: Mutex::new(LruCache::new(limit)),
        }
    }

    /// Exposes the backing store for components that need to scan key
    /// prefixes directly (spec §4.9 Stats).
    pub fn kv(&self) -> &dyn KvStore {
        self.kv.as_ref()
    }

    /// Peeks at a subject's metadata without touching `accessCount` /
    /// `lastAccessAt` (unlike [`Self::read`], which loads the full
    /// transaction set and bumps both).
    pub fn peek_metadata(&self, subject: &Subject) -> CacheResult<Option<CacheMetadata>> {
        self.read_metadata(subject)
    }

    fn read_metadata(&self, subject: &Subject) -> CacheResult<Option<CacheMetadata>> {
        let key = subject.metadata_key();
        if let Some(meta) = self.metadata_cache.lock().get(&key).cloned() {
            return Ok(Some(meta));
        }
        match self.kv.get(&key)? {
            Some(bytes) => {
                let meta: CacheMetadata = serde_json::from_slice(&bytes)?;
                self.metadata_cache.lock().put(key, meta.clone());
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    fn write_metadata(&self, subject: &Subject, meta: &CacheMetadata) -> CacheResult<()> {
        let key = subject.metadata_key();
        let bytes = serde_json::to_vec(meta)?;
        self.kv.put(&key, bytes)?;
        self.metadata_cache.lock().put(key, meta.clone());
        Ok(())
    }

    fn delete_metadata(&self, subject: &Subject) -> CacheResult<()> {
        let key = subject.metadata_key();
        self.kv.delete(&key)?;
        self.metadata_cache.lock().pop(&key);
        Ok(())
    }

    /// Reads a paginated-or-flat value written under `key_base` (spec
    /// §4.6: prefers chunked form if a meta header is present).
    fn read_paginated<T: for<'de> Deserialize<'de>>(&self, key_base: &str) -> CacheResult<Option<T>>
    where
        T: PaginatedCollection,
    {
        let meta_key = format!("{key_base}:meta");
        if let Some(meta_bytes) = self.kv.get(&meta_key)? {
            let meta: PageMeta = serde_json::from_slice(&meta_bytes)?;
            let mut collected = T::empty();
            for i in 0..meta.page_count {
                let chunk_key = format!("{key_base}:{i}");
                let bytes = self
                    .kv
                    .get(&chunk_key)?
                    .ok_or_else(|| CacheError::InternalInvariant(format!("missing chunk {chunk_key}")))?;
                let chunk: T = serde_json::from_slice(&bytes)?;
                collected.extend(chunk);
            }
            Ok(Some(collected))
        } else if let Some(bytes) = self.kv.get(key_base)? {
            Ok(Some(serde_json::from_slice(&bytes)?))
        } else {
            Ok(None)
        }
    }

    /// Deletes a paginated-or-flat value under `key_base` (spec §4.6
    /// `deletePaginated`).
    fn delete_paginated(&self, key_base: &str) -> CacheResult<()> {
        let meta_key = format!("{key_base}:meta");
        if let Some(meta_bytes) = self.kv.get(&meta_key)? {
            let meta: PageMeta = serde_json::from_slice(&meta_bytes)?;
            for i in 0..meta.page_count {
                self.kv.delete(&format!("{key_base}:{i}"))?;
            }
            self.kv.delete(&meta_key)?;
        } else {
            self.kv.delete(key_base)?;
        }
        Ok(())
    }

    /// Loads `S` (spec §4.6 `read`): bumps `accessCount`/`lastAccessAt`
    /// and rewrites metadata on success.
    pub fn read(&self, subject: &Subject) -> CacheResult<Option<SubjectData>> {
        let Some(mut meta) = self.read_metadata(subject)? else {
            return Ok(None);
        };

        let base = subject.key_base();
        let tx_order: Option<Vec<String>> = self.read_paginated(&format!("{base}:txOrder"))?;
        let tx_map: Option<BTreeMap<String, Transaction>> = self.read_paginated(&format!("{base}:txMap"))?;

        let (Some(tx_order), Some(tx_map)) = (tx_order, tx_map) else {
            return Ok(None);
        };

        meta.access_count += 1;
        meta.last_access_at = now();
        self.write_metadata(subject, &meta)?;

        Ok(Some(SubjectData { tx_map, tx_order }))
    }

    /// Writes `S` (spec §4.6 `write`): a no-op if the content hash
    /// hasn't changed, otherwise persists chunked or flat form and
    /// refreshes metadata. Serialized per-subject by the caller holding
    /// the cache engine's update lock (spec §5).
    pub fn write(&self, subject: &Subject, data: &SubjectData) -> CacheResult<()> {
        let new_hash = hash_tx_order(&data.tx_order);
        let existing = self.read_metadata(subject)?;
        if let Some(existing) = &existing {
            if existing.data_hash == new_hash {
                debug!(subject = %subject, "write is a no-op, hash unchanged");
                return Ok(());
            }
        }

        let base = subject.key_base();
        self.write_paginated(&format!("{base}:txOrder"), &data.tx_order)?;
        self.write_paginated(&format!("{base}:txMap"), &data.tx_map)?;

        let created_at = existing.as_ref().map(|m| m.created_at).unwrap_or_else(now);
        let access_count = existing.as_ref().map(|m| m.access_count).unwrap_or(0);
        let last_access_at = existing.as_ref().map(|m| m.last_access_at).unwrap_or_else(now);
        let meta = CacheMetadata {
            access_count,
            created_at,
            last_access_at,
            updated_at: now(),
            data_hash: new_hash,
            num_txs: data.tx_order.len() as u64,
        };
        self.write_metadata(subject, &meta)
    }

    fn write_paginated<T: Serialize + PaginatedCollection + Clone>(&self, key_base: &str, value: &T) -> CacheResult<()> {
        let len = value.item_count();
        if len <= self.max_items_per_key {
            // Flat form: remove any stale chunked form first.
            self.delete_paginated(key_base)?;
            let bytes = serde_json::to_vec(value)?;
            self.kv.put(key_base, bytes)?;
            return Ok(());
        }

        let page_count = len.div_ceil(self.max_items_per_key);
        for i in 0..page_count {
            let chunk = value.slice_page(i, self.max_items_per_key);
            let bytes = serde_json::to_vec(&chunk)?;
            self.kv.put(&format!("{key_base}:{i}"), bytes)?;
        }
        // Remove flat form if one exists from a prior, smaller write.
        self.kv.delete(key_base)?;
        let meta = PageMeta {
            page_count,
            total_txs: len,
        };
        self.kv.put(&format!("{key_base}:meta"), serde_json::to_vec(&meta)?)?;
        Ok(())
    }

    /// Deletes both `txMap` and `txOrder` plus the subject's metadata
    /// (spec §4.6 `clearSubject`).
    pub fn clear_subject(&self, subject: &Subject) -> CacheResult<()> {
        let base = subject.key_base();
        self.delete_paginated(&format!("{base}:txMap"))?;
        self.delete_paginated(&format!("{base}:txOrder"))?;
        self.delete_metadata(subject)
    }

    /// Sums UTF-8 byte lengths of every key and serialized value (spec
    /// §4.6 `calculateSize`).
    pub fn calculate_size(&self) -> CacheResult<u64> {
        let mut total = 0u64;
        for prefix in ["address:", "token:", "metadata:"] {
            for (key, value) in self.kv.iter_prefix(prefix)? {
                total += key.len() as u64 + value.len() as u64;
            }
        }
        Ok(total)
    }

    /// Evicts subjects with the fewest accesses until total durable size
    /// is at or below `ceiling` (spec §4.6 `cleanLeastAccessed`).
    pub fn clean_least_accessed(&self, ceiling: u64) -> CacheResult<()> {
        let mut candidates: Vec<(Subject, CacheMetadata)> = Vec::new();
        for (key, value) in self.kv.iter_prefix("metadata:address:")? {
            let id = key.trim_start_matches("metadata:address:").to_string();
            let meta: CacheMetadata = serde_json::from_slice(&value)?;
            candidates.push((Subject::Address(id), meta));
        }
        for (key, value) in self.kv.iter_prefix("metadata:token:")? {
            let id = key.trim_start_matches("metadata:token:").to_string();
            let meta: CacheMetadata = serde_json::from_slice(&value)?;
            candidates.push((Subject::Token(id), meta));
        }
        candidates.sort_by_key(|(_, meta)| meta.access_count);

        let mut size = self.calculate_size()?;
        for (subject, _) in candidates {
            if size <= ceiling {
                return Ok(());
            }
            let before = size;
            self.clear_subject(&subject)?;
            size = self.calculate_size()?;
            if size == before {
                // No progress made; avoid an infinite loop.
                break;
            }
        }

        if size > ceiling {
            return Err(CacheError::LimitExceeded {
                subject: "<all subjects>".to_string(),
            });
        }
        Ok(())
    }
}

trait PaginatedCollection {
    fn empty() -> Self;
    fn extend(&mut self, other: Self);
    fn item_count(&self) -> usize;
    fn slice_page(&self, page: usize, page_size: usize) -> Self;
}

impl PaginatedCollection for Vec<String> {
    fn empty() -> Self {
        Vec::new()
    }
    fn extend(&mut self, other: Self) {
        Vec::extend(self, other);
    }
    fn item_count(&self) -> usize {
        self.len()
    }
    fn slice_page(&self, page: usize, page_size: usize) -> Self {
        let start = page * page_size;
        let end = (start + page_size).min(self.len());
        self[start..end].to_vec()
    }
}

impl PaginatedCollection for BTreeMap<String, Transaction> {
    fn empty() -> Self {
        BTreeMap::new()
    }
    fn extend(&mut self, other: Self) {
        BTreeMap::extend(self, other);
    }
    fn item_count(&self) -> usize {
        self.len()
    }
    fn slice_page(&self, page: usize, page_size: usize) -> Self {
        self.iter()
            .skip(page * page_size)
            .take(page_size)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
