// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Total order over transactions, newest first (spec §4.4).
//!
//! Adopts the `block.height`-presence-keyed order per spec.md's REDESIGN
//! FLAGS note: two sort orders exist across versions of the source (one
//! keyed on `isFinal`, one keyed on `block.height` presence); this is the
//! latter, used by the majority of current files.

use std::cmp::Ordering;

use crate::subject::Transaction;

/// Orders `a` before `b` when `a` should sort earlier (i.e. newer) in
/// `txOrder`. Suitable for `slice::sort_by`.
pub fn compare(a: &Transaction, b: &Transaction) -> Ordering {
    match (&a.block, &b.block) {
        (None, None) => {
            let ta = a.extra_timestamp();
            let tb = b.extra_timestamp();
            ta.cmp(&tb)
                .reverse()
                .then_with(|| a.time_first_seen.cmp(&b.time_first_seen).reverse())
        }
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(ba), Some(bb)) => ba
            .height
            .cmp(&bb.height)
            .reverse()
            .then_with(|| ba.timestamp.cmp(&bb.timestamp).reverse())
            .then_with(|| a.time_first_seen.cmp(&b.time_first_seen).reverse()),
    }
}

impl Transaction {
    /// Unconfirmed transactions carry their mempool timestamp as an opaque
    /// field; missing timestamp is treated as 0 per spec §4.4 rule 1.
    fn extra_timestamp(&self) -> i64 {
        self.extra
            .get("timestamp")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }
}

pub fn sort_tx_order(tx_order: &mut [String], tx_map: &std::collections::BTreeMap<String, Transaction>) {
    tx_order.sort_by(|a, b| {
        let ta = tx_map.get(a);
        let tb = tx_map.get(b);
        match (ta, tb) {
            (Some(ta), Some(tb)) => compare(ta, tb),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    });
}
