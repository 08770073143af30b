// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Read-only aggregation over durable layout and live state (spec §4.9).

use std::collections::BTreeMap;

use crate::context::CacheConfig;
use crate::error::CacheResult;
use crate::kv_store::KvStore;
use crate::subject::{CacheMetadata, CacheStatus, Subject};

/// One sampled subject surfaced in a [`Statistics`] breakdown.
#[derive(Clone, Debug)]
pub struct SubjectSample {
    pub subject: Subject,
    pub created_at: i64,
    pub last_access_at: i64,
    pub access_count: u64,
    pub num_txs: u64,
}

/// Byte-size breakdown of the durable store (spec §4.9).
#[derive(Clone, Copy, Debug, Default)]
pub struct SizeBreakdown {
    pub transactions: u64,
    pub metadata: u64,
    pub other: u64,
}

#[derive(Clone, Debug, Default)]
pub struct Statistics {
    pub total_subjects: usize,
    pub by_status: BTreeMap<&'static str, usize>,
    /// At most 5 sampled subjects per derived status.
    pub samples: BTreeMap<&'static str, Vec<SubjectSample>>,
    pub total_size_bytes: u64,
    pub size_breakdown: SizeBreakdown,
    pub memory_cache_entries: usize,
    pub build_queue_length: usize,
    pub repair_queue_length: usize,
    pub config: CacheConfig,
}

const SAMPLE_LIMIT: usize = 5;

fn status_label(status: CacheStatus) -> &'static str {
    match status {
        CacheStatus::Unknown => "unknown",
        CacheStatus::Updating => "updating",
        CacheStatus::Latest => "latest",
        CacheStatus::Reject => "reject",
    }
}

/// Assembles a [`Statistics`] snapshot by scanning `metadata:*` keys and
/// cross-referencing the cache engine's in-memory derived status (spec
/// §4.9: "total subjects... counted by iterating `*:txOrder*` keys and
/// projecting to the subject prefix" -- `metadata:*` carries one entry per
/// subject and is cheaper to scan than the chunked tx data).
pub fn collect(
    kv: &dyn KvStore,
    statuses: &std::collections::HashMap<Subject, CacheStatus>,
    memory_cache_entries: usize,
    build_queue_length: usize,
    repair_queue_length: usize,
    config: &CacheConfig,
) -> CacheResult<Statistics> {
    let mut stats = Statistics {
        config: config.clone(),
        memory_cache_entries,
        build_queue_length,
        repair_queue_length,
        ..Default::default()
    };

    let mut subjects: Vec<(Subject, CacheMetadata)> = Vec::new();
    for (key, value) in kv.iter_prefix("metadata:address:")? {
        let id = key.trim_start_matches("metadata:address:").to_string();
        let meta: CacheMetadata = serde_json::from_slice(&value)?;
        subjects.push((Subject::Address(id), meta));
    }
    for (key, value) in kv.iter_prefix("metadata:token:")? {
        let id = key.trim_start_matches("metadata:token:").to_string();
        let meta: CacheMetadata = serde_json::from_slice(&value)?;
        subjects.push((Subject::Token(id), meta));
    }

    stats.total_subjects = subjects.len();
    for (subject, meta) in &subjects {
        let status = statuses.get(subject).copied().unwrap_or(CacheStatus::Unknown);
        let label = status_label(status);
        *stats.by_status.entry(label).or_insert(0) += 1;
        let bucket = stats.samples.entry(label).or_default();
        if bucket.len() < SAMPLE_LIMIT {
            bucket.push(SubjectSample {
                subject: subject.clone(),
                created_at: meta.created_at,
                last_access_at: meta.last_access_at,
                access_count: meta.access_count,
                num_txs: meta.num_txs,
            });
        }
    }

    let mut breakdown = SizeBreakdown::default();
    for prefix in ["address:", "token:"] {
        for (key, value) in kv.iter_prefix(prefix)? {
            breakdown.transactions += key.len() as u64 + value.len() as u64;
        }
    }
    for (key, value) in kv.iter_prefix("metadata:")? {
        breakdown.metadata += key.len() as u64 + value.len() as u64;
    }
    stats.total_size_bytes = breakdown.transactions + breakdown.metadata + breakdown.other;
    stats.size_breakdown = breakdown;

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_store::MemStore;
    use crate::subject_store::SubjectStore;
    use crate::subject::{SubjectData, Transaction};
    use std::collections::{BTreeMap as Map, HashMap};
    use std::sync::Arc;

    fn tx(id: &str) -> Transaction {
        Transaction {
            txid: id.to_string(),
            block: None,
            time_first_seen: 1,
            is_final: false,
            extra: Map::new(),
        }
    }

    #[test]
    fn collects_total_subjects_and_status_breakdown() {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let store = SubjectStore::new(kv.clone(), 10_000, 100);
        let subject = Subject::Address("abc".to_string());
        let mut data = SubjectData::default();
        data.tx_order = vec!["a".to_string()];
        data.tx_map.insert("a".to_string(), tx("a"));
        store.write(&subject, &data).unwrap();

        let mut statuses = HashMap::new();
        statuses.insert(subject.clone(), CacheStatus::Latest);

        let config = CacheConfig::default();
        let stats = collect(kv.as_ref(), &statuses, 0, 0, 0, &config).unwrap();
        assert_eq!(stats.total_subjects, 1);
        assert_eq!(stats.by_status.get("latest"), Some(&1));
        assert_eq!(stats.samples.get("latest").unwrap().len(), 1);
    }

    #[test]
    fn unknown_status_is_default_for_untracked_subjects() {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let store = SubjectStore::new(kv.clone(), 10_000, 100);
        let subject = Subject::Token("xyz".to_string());
        let mut data = SubjectData::default();
        data.tx_order = vec!["a".to_string()];
        data.tx_map.insert("a".to_string(), tx("a"));
        store.write(&subject, &data).unwrap();

        let statuses = HashMap::new();
        let config = CacheConfig::default();
        let stats = collect(kv.as_ref(), &statuses, 0, 0, 0, &config).unwrap();
        assert_eq!(stats.by_status.get("unknown"), Some(&1));
    }
}
