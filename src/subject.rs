// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Data model: subjects, transactions and the per-subject cache state
//! machine (spec §3).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A uniquely-keyed owner of a cached transaction set.
///
/// Scripts are resolved to an address by [`crate::indexer::script_to_address`]
/// before a `Subject` is ever constructed, so this enum only needs the two
/// durable namespaces.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subject {
    Address(String),
    Token(String),
}

impl Subject {
    pub fn id(&self) -> &str {
        match self {
            Subject::Address(id) => id,
            Subject::Token(id) => id,
        }
    }

    pub fn is_token(&self) -> bool {
        matches!(self, Subject::Token(_))
    }

    /// The `metadata:<ns>:<id>` key this subject's metadata lives under.
    pub fn metadata_key(&self) -> String {
        match self {
            Subject::Address(id) => format!("metadata:address:{id}"),
            Subject::Token(id) => format!("metadata:token:{id}"),
        }
    }

    /// The `S` key-base this subject's `txMap`/`txOrder` chunks live under.
    pub fn key_base(&self) -> String {
        match self {
            Subject::Address(id) => format!("address:{id}"),
            Subject::Token(id) => format!("token:{id}"),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Address(id) => write!(f, "address:{id}"),
            Subject::Token(id) => write!(f, "token:{id}"),
        }
    }
}

/// Block reference carried on a [`Transaction`], present once confirmed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: i64,
    #[serde(default)]
    pub timestamp: i64,
}

/// Cache-relevant projection of an indexer transaction record (spec §3,
/// §9 "Dynamic-typed transaction record"). Everything else the indexer
/// attaches is opaque and preserved byte-for-byte in `extra`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    #[serde(default)]
    pub block: Option<BlockInfo>,
    #[serde(default)]
    pub time_first_seen: i64,
    #[serde(default)]
    pub is_final: bool,
    /// Opaque payload preserved verbatim; never inspected by the core.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Transaction {
    pub fn is_confirmed(&self) -> bool {
        self.block.is_some()
    }
}

/// Durable per-subject metadata (spec §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub access_count: u64,
    pub created_at: i64,
    pub last_access_at: i64,
    pub updated_at: i64,
    pub data_hash: String,
    pub num_txs: u64,
}

impl CacheMetadata {
    pub fn new(now: i64, data_hash: String, num_txs: u64) -> Self {
        Self {
            access_count: 0,
            created_at: now,
            last_access_at: now,
            updated_at: now,
            data_hash,
            num_txs,
        }
    }
}

/// In-memory-only derived state (spec §3, §4.8). Never persisted directly;
/// `UPDATING` is derived from whether the update lock is held.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Unknown,
    Updating,
    Latest,
    Reject,
}

impl Default for CacheStatus {
    fn default() -> Self {
        CacheStatus::Unknown
    }
}

/// A loaded, working view of one subject's cached transaction set.
#[derive(Clone, Debug, Default)]
pub struct SubjectData {
    pub tx_map: BTreeMap<String, Transaction>,
    pub tx_order: Vec<String>,
}

impl SubjectData {
    pub fn num_txs(&self) -> usize {
        self.tx_order.len()
    }

    /// Invariant 1 (spec §8): `set(txOrder) == keys(txMap)`.
    #[cfg(test)]
    pub fn is_well_formed(&self) -> bool {
        use std::collections::BTreeSet;
        let order_set: BTreeSet<&String> = self.tx_order.iter().collect();
        let map_set: BTreeSet<&String> = self.tx_map.keys().collect();
        order_set == map_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_keys_are_namespace_disjoint() {
        let a = Subject::Address("abc".to_string());
        let t = Subject::Token("abc".to_string());
        assert_ne!(a.metadata_key(), t.metadata_key());
        assert_ne!(a.key_base(), t.key_base());
    }

    #[test]
    fn well_formed_requires_matching_sets() {
        let mut data = SubjectData::default();
        data.tx_order.push("a".to_string());
        assert!(!data.is_well_formed());
        data.tx_map.insert(
            "a".to_string(),
            Transaction {
                txid: "a".to_string(),
                block: None,
                time_first_seen: 1,
                is_final: false,
                extra: BTreeMap::new(),
            },
        );
        assert!(data.is_well_formed());
    }
}
