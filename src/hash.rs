// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Content hasher (spec §4.5): a stable fingerprint over an ordered txid
//! list, used solely to detect drift between a loaded in-memory view and
//! the durable header. No security property is claimed.

use sha2::{Digest, Sha256};

/// `hash(seq) = SHA-256(canonical-json(seq))`, hex-encoded.
pub fn hash_tx_order(tx_order: &[String]) -> String {
    // serde_json's array serialization is already order-preserving and
    // free of whitespace ambiguity for a `Vec<String>`, so this is already
    // canonical for our one use site.
    let encoded = serde_json::to_vec(tx_order).expect("Vec<String> always serializes");
    let digest = Sha256::digest(&encoded);
    hex::encode(digest)
}
