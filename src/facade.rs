// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Public facade (spec §4.10): the single entry type an embedder
//! constructs and holds. Owns every live component -- "global mutable
//! state... all live inside a single owning engine instance" (spec §9).

use std::sync::{Arc, OnceLock};

use crate::cache_engine::{CacheEngine, HistoryResponse};
use crate::context::{CacheConfig, Context};
use crate::error::CacheResult;
use crate::indexer::{script_to_address, ChronikClientInterface};
use crate::kv_store::KvStore;
use crate::notification::{EventCallback, EvictCallback};
use crate::stats::Statistics;
use crate::subject::{CacheStatus, Subject};
use crate::subject_store::SubjectStore;

/// Owns the engine, notification manager, stats, and sweeper for one
/// configured indexer + durable store pairing.
pub struct ChronikCache<C: ChronikClientInterface + 'static> {
    engine: Arc<CacheEngine<C>>,
}

impl<C: ChronikClientInterface + 'static> ChronikCache<C> {
    /// Fallible construction (spec §2 supplemented features): wires the
    /// notification manager's callbacks back into the engine via a
    /// [`OnceLock`], since the manager must exist before the engine that
    /// consumes its handle, and vice versa for the callbacks it invokes.
    /// Grounded on `CoreThreadDispatcher::start`'s fallible startup shape.
    pub fn new(indexer: Arc<C>, kv: Arc<dyn KvStore>, config: CacheConfig) -> CacheResult<Self> {
        let engine_cell: Arc<OnceLock<Arc<CacheEngine<C>>>> = Arc::new(OnceLock::new());

        let on_event_cell = engine_cell.clone();
        let on_event: EventCallback = Arc::new(move |subject, txid, msg_type| {
            if let Some(engine) = on_event_cell.get() {
                engine.handle_notification_event(subject.clone(), txid.to_string(), msg_type);
            }
        });

        let on_evict_cell = engine_cell.clone();
        let on_evict: EvictCallback = Arc::new(move |subject| {
            if let Some(engine) = on_evict_cell.get() {
                engine.clear_status(subject);
            }
        });

        let ctx = Arc::new(Context::new(config));
        let notifications = Arc::new(crate::notification::NotificationManager::new(
            indexer.clone(),
            ctx.config.max_subscriptions,
            ctx.config.ws_timeout,
            ctx.config.ws_extend_timeout,
            ctx.config.max_timer_duration,
            on_event,
            on_evict,
            ctx.metrics.clone(),
        ));
        let store = Arc::new(SubjectStore::new(
            kv,
            ctx.config.max_items_per_key,
            ctx.config.global_metadata_cache_limit,
        ));
        notifications.install_reconnect_handlers();
        let engine = CacheEngine::new(ctx, indexer, store, notifications);
        engine_cell
            .set(engine.clone())
            .unwrap_or_else(|_| unreachable!("engine cell is set exactly once during construction"));

        Ok(Self { engine })
    }

    pub fn address(&self, id: impl Into<String>) -> SubjectQuery<C> {
        SubjectQuery {
            engine: self.engine.clone(),
            subject: Subject::Address(id.into()),
        }
    }

    pub fn token_id(&self, id: impl Into<String>) -> SubjectQuery<C> {
        SubjectQuery {
            engine: self.engine.clone(),
            subject: Subject::Token(id.into()),
        }
    }

    /// Resolves `(scriptType, scriptHash)` to an address via the pluggable
    /// resolver, lowercasing the hash first (spec §4.10).
    pub fn script(&self, script_type: &str, hash: &str) -> CacheResult<SubjectQuery<C>> {
        let address = script_to_address(script_type, &hash.to_lowercase())?;
        Ok(SubjectQuery {
            engine: self.engine.clone(),
            subject: Subject::Address(address),
        })
    }

    pub async fn clear_address_cache(&self, id: &str) -> CacheResult<()> {
        self.engine.clear_subject(&Subject::Address(id.to_string()))
    }

    pub async fn clear_token_cache(&self, id: &str) -> CacheResult<()> {
        self.engine.clear_subject(&Subject::Token(id.to_string()))
    }

    pub async fn clear_all_cache(&self) -> CacheResult<()> {
        self.engine.clear_all()
    }

    pub fn get_cache_status(&self, id: &str, is_token: bool) -> CacheStatus {
        let subject = if is_token {
            Subject::Token(id.to_string())
        } else {
            Subject::Address(id.to_string())
        };
        self.engine.cache_status(&subject)
    }

    pub fn get_statistics(&self) -> CacheResult<Statistics> {
        self.engine.statistics()
    }

    /// Forwards one inbound indexer event (spec §4.7 `onMessage`/§4.8.6).
    /// The transport layer that owns the actual subscription connection
    /// calls this from its `onMessage` handler. Routed through
    /// [`crate::notification::NotificationManager::dispatch`] so the
    /// subscription-membership filter and panic guard are on the live
    /// path, not just exercised in the manager's own unit tests.
    pub fn handle_notification_event(&self, subject: Subject, txid: String, msg_type: crate::indexer::MsgType) {
        self.engine.notifications().dispatch(&subject, crate::indexer::TxEvent { txid, msg_type });
    }

    /// Passthrough accessor for the underlying indexer client (spec §9
    /// "duck-typed indexer client"): other methods the embedding indexer
    /// exposes beyond the common trait surface stay reachable through
    /// the concrete client type `C`.
    pub fn indexer(&self) -> &Arc<C> {
        self.engine.indexer()
    }

    /// Tears down sweepers and timers (spec §4.10 `destroy`).
    pub async fn destroy(&self) {
        self.engine.destroy().await;
    }
}

/// Fluent per-subject query handle returned by [`ChronikCache::address`],
/// [`ChronikCache::token_id`], and [`ChronikCache::script`].
pub struct SubjectQuery<C: ChronikClientInterface + 'static> {
    engine: Arc<CacheEngine<C>>,
    subject: Subject,
}

impl<C: ChronikClientInterface + 'static> SubjectQuery<C> {
    pub async fn history(&self, page_offset: u64, page_size: u64) -> CacheResult<HistoryResponse> {
        self.engine.history(self.subject.clone(), page_offset, page_size).await
    }
}
