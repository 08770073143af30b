// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! The indexer capability set consumed by the cache (spec §6
//! `ChronikClientInterface`), plus the pure `script_to_address` resolver
//! (spec §4.10, §9 "Duck-typed indexer client").

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CacheResult;
use crate::subject::{Subject, Transaction};

/// One page of a subject's transaction history as reported by the
/// indexer (spec §6).
#[derive(Clone, Debug, Default)]
pub struct HistoryPage {
    pub txs: Vec<Transaction>,
    pub num_txs: u64,
    pub num_pages: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    TxAddedToMempool,
    TxFinalized,
}

#[derive(Clone, Debug)]
pub struct TxEvent {
    pub txid: String,
    pub msg_type: MsgType,
}

pub type ConnectionCallback = Arc<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(Subject, TxEvent) + Send + Sync>;

/// Capability set this crate needs from the upstream indexer. Defined as
/// an explicit trait rather than type-sniffing on a concrete client (spec
/// §9): any indexer that can serve paginated history, single-tx lookups,
/// and an address/token subscription transport can back the cache.
#[async_trait]
pub trait ChronikClientInterface: Send + Sync {
    async fn address_history(&self, id: &str, page: u64, size: u64) -> CacheResult<HistoryPage>;
    async fn token_id_history(&self, id: &str, page: u64, size: u64) -> CacheResult<HistoryPage>;
    async fn tx(&self, txid: &str) -> CacheResult<Transaction>;

    async fn subscribe_to_address(&self, id: &str);
    async fn unsubscribe_from_address(&self, id: &str);
    async fn subscribe_to_token_id(&self, id: &str);
    async fn unsubscribe_from_token_id(&self, id: &str);

    /// Resolves once the transport has an open connection (spec §6
    /// `waitForOpen`).
    async fn wait_for_open(&self) -> CacheResult<()>;
    /// Tears down the transport connection (spec §6 `close`).
    async fn close(&self);

    /// Registers the handler for inbound subscription messages (spec §6
    /// `onMessage`). The cache's own ingestion entry point is
    /// [`crate::facade::ChronikCache::handle_notification_event`]; a
    /// concrete transport wires this hook to call it.
    fn on_message(&self, handler: MessageCallback);
    /// Registers a handler fired once the transport's initial connection
    /// completes (spec §6 `onConnect`).
    fn on_connect(&self, handler: ConnectionCallback);
    /// Registers a handler fired after the transport reconnects
    /// following a drop (spec §6 `onReconnect`). The notification
    /// manager installs its own handler here to re-subscribe every
    /// tracked subject (spec §4.7).
    fn on_reconnect(&self, handler: ConnectionCallback);
    /// Registers a handler fired on transport errors (spec §6 `onError`).
    fn on_error(&self, handler: ErrorCallback);
    /// Registers a handler fired when the transport ends (spec §6
    /// `onEnd`).
    fn on_end(&self, handler: ConnectionCallback);
}

/// Resolves a `(scriptType, scriptHash)` pair to an address string. Kept
/// a pure, pluggable function (spec §2 "treated as a pure function") --
/// production callers supply a real encoder (e.g. an eCash
/// `CashAddress` implementation); this default only validates shape.
pub fn script_to_address(script_type: &str, hash: &str) -> CacheResult<String> {
    if hash.chars().any(|c| !c.is_ascii_hexdigit()) {
        return Err(crate::error::CacheError::InternalInvariant(format!(
            "script hash is not hex: {hash}"
        )));
    }
    Ok(format!("{script_type}:{}", hash.to_lowercase()))
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Deterministic fake indexer for unit tests: callers preload
    /// `history` responses and `txs` keyed by subject id / txid.
    #[derive(Default)]
    pub struct FakeIndexerClient {
        pub history: Mutex<BTreeMap<String, HistoryPage>>,
        pub txs: Mutex<BTreeMap<String, Transaction>>,
        pub subscribed_addresses: Mutex<Vec<String>>,
        pub subscribed_tokens: Mutex<Vec<String>>,
        on_connect: Mutex<Option<ConnectionCallback>>,
        on_reconnect: Mutex<Option<ConnectionCallback>>,
        on_error: Mutex<Option<ErrorCallback>>,
        on_end: Mutex<Option<ConnectionCallback>>,
    }

    impl FakeIndexerClient {
        /// Test-only hook simulating the transport coming back up.
        pub fn fire_reconnect(&self) {
            if let Some(handler) = self.on_reconnect.lock().clone() {
                handler();
            }
        }

        /// Test-only hook simulating a transport error.
        pub fn fire_error(&self, message: &str) {
            if let Some(handler) = self.on_error.lock().clone() {
                handler(message.to_string());
            }
        }

        /// Test-only hook simulating the transport ending.
        pub fn fire_end(&self) {
            if let Some(handler) = self.on_end.lock().clone() {
                handler();
            }
        }
    }

    #[async_trait]
    impl ChronikClientInterface for FakeIndexerClient {
        async fn address_history(&self, id: &str, page: u64, size: u64) -> CacheResult<HistoryPage> {
            Ok(paginate(self.history.lock().get(id).cloned().unwrap_or_default(), page, size))
        }

        async fn token_id_history(&self, id: &str, page: u64, size: u64) -> CacheResult<HistoryPage> {
            Ok(paginate(self.history.lock().get(id).cloned().unwrap_or_default(), page, size))
        }

        async fn tx(&self, txid: &str) -> CacheResult<Transaction> {
            self.txs
                .lock()
                .get(txid)
                .cloned()
                .ok_or(crate::error::CacheError::NotFound)
        }

        async fn subscribe_to_address(&self, id: &str) {
            self.subscribed_addresses.lock().push(id.to_string());
        }

        async fn unsubscribe_from_address(&self, id: &str) {
            self.subscribed_addresses.lock().retain(|x| x != id);
        }

        async fn subscribe_to_token_id(&self, id: &str) {
            self.subscribed_tokens.lock().push(id.to_string());
        }

        async fn unsubscribe_from_token_id(&self, id: &str) {
            self.subscribed_tokens.lock().retain(|x| x != id);
        }

        async fn wait_for_open(&self) -> CacheResult<()> {
            Ok(())
        }

        async fn close(&self) {}

        fn on_message(&self, _handler: MessageCallback) {}

        fn on_connect(&self, handler: ConnectionCallback) {
            *self.on_connect.lock() = Some(handler);
        }

        fn on_reconnect(&self, handler: ConnectionCallback) {
            *self.on_reconnect.lock() = Some(handler);
        }

        fn on_error(&self, handler: ErrorCallback) {
            *self.on_error.lock() = Some(handler);
        }

        fn on_end(&self, handler: ConnectionCallback) {
            *self.on_end.lock() = Some(handler);
        }
    }

    fn paginate(full: HistoryPage, page: u64, size: u64) -> HistoryPage {
        let start = (page * size) as usize;
        let end = (start + size as usize).min(full.txs.len());
        let txs = if start < full.txs.len() { full.txs[start..end].to_vec() } else { vec![] };
        let num_pages = if size == 0 { 0 } else { (full.txs.len() as u64).div_ceil(size) };
        HistoryPage {
            txs,
            num_txs: full.txs.len() as u64,
            num_pages,
        }
    }
}
