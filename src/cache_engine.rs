// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Cache Engine (spec §4.8): per-subject state machine, background
//! build, page serving, hash-check repair, confirmation repair. The
//! largest component; grounded on `commit_syncer.rs` for the
//! fetch-and-persist build loop shape and `core_thread.rs`/`broadcaster.rs`
//! for the lock/queue/background-task discipline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::CacheResult;
use crate::hash::hash_tx_order;
use crate::indexer::{ChronikClientInterface, HistoryPage, MsgType};
use crate::notification::{EvictCallback, NotificationManager};
use crate::retry::execute_with_retry;
use crate::sort_key::sort_tx_order;
use crate::subject::{CacheStatus, Subject, SubjectData};
use crate::subject_store::SubjectStore;
use crate::task_queue::TaskQueue;

/// Response envelope of `history` (spec §6).
#[derive(Clone, Debug, Default)]
pub struct HistoryResponse {
    pub txs: Vec<crate::subject::Transaction>,
    pub num_pages: u64,
    pub num_txs: u64,
    /// `1` = being prepared, `2` = over limit, `3` = direct passthrough.
    /// Absent on a normal cache hit.
    pub status: Option<u8>,
    pub message: Option<String>,
}

struct MemoryEntry {
    data: SubjectData,
    expiry: Instant,
}

/// Two-tier page cache memory layer (spec §4.8.3): initial TTL 120s,
/// extended 10s per access, swept every 10s.
struct MemoryCache {
    entries: DashMap<Subject, MemoryEntry>,
    ttl: Duration,
    ttl_extension: Duration,
}

impl MemoryCache {
    fn new(ttl: Duration, ttl_extension: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            ttl_extension,
        }
    }

    fn get(&self, subject: &Subject) -> Option<SubjectData> {
        let mut entry = self.entries.get_mut(subject)?;
        if entry.expiry < Instant::now() {
            drop(entry);
            self.entries.remove(subject);
            return None;
        }
        entry.expiry += self.ttl_extension;
        Some(entry.data.clone())
    }

    fn insert(&self, subject: Subject, data: SubjectData) {
        self.entries.insert(
            subject,
            MemoryEntry {
                data,
                expiry: Instant::now() + self.ttl,
            },
        );
    }

    fn invalidate(&self, subject: &Subject) {
        self.entries.remove(subject);
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expiry >= now);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Per-subject mutual exclusion for durable mutation (spec §5): at most
/// one writer per subject at a time, never held across an unrelated
/// subject's indexer call.
#[derive(Default)]
struct UpdateLocks {
    locks: DashMap<Subject, Arc<AsyncMutex<()>>>,
}

impl UpdateLocks {
    fn get(&self, subject: &Subject) -> Arc<AsyncMutex<()>> {
        self.locks.entry(subject.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    fn is_held(&self, subject: &Subject) -> bool {
        self.locks
            .get(subject)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Admission gate for `checkAndUpdate` (spec §8 Testable Property 5):
    /// the "is a build already owned" check and the lock acquisition must
    /// be the same atomic step, or two callers can both observe "unheld"
    /// and both admit a build for the same subject.
    fn try_admit(&self, subject: &Subject) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        self.get(subject).try_lock_owned().ok()
    }
}

pub struct CacheEngine<C: ChronikClientInterface + 'static> {
    ctx: Arc<Context>,
    indexer: Arc<C>,
    store: Arc<SubjectStore>,
    notifications: Arc<NotificationManager<C>>,
    build_queue: TaskQueue,
    repair_queue: TaskQueue,
    status: DashMap<Subject, CacheStatus>,
    update_locks: UpdateLocks,
    memory_cache: MemoryCache,
    debounce_generation: DashMap<(Subject, &'static str), Arc<AtomicU64>>,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<C: ChronikClientInterface + 'static> CacheEngine<C> {
    pub fn new(
        ctx: Arc<Context>,
        indexer: Arc<C>,
        store: Arc<SubjectStore>,
        notifications: Arc<NotificationManager<C>>,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            build_queue: TaskQueue::new(ctx.config.queue_limits.build_concurrency),
            repair_queue: TaskQueue::new(ctx.config.queue_limits.repair_concurrency),
            memory_cache: MemoryCache::new(ctx.config.memory_cache_ttl, ctx.config.memory_cache_ttl_extension),
            status: DashMap::new(),
            update_locks: UpdateLocks::default(),
            debounce_generation: DashMap::new(),
            sweeper: std::sync::Mutex::new(None),
            ctx,
            indexer,
            store,
            notifications,
        });
        let handle = engine.clone().spawn_sweeper();
        *engine.sweeper.lock().unwrap() = Some(handle);
        engine
    }

    fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.ctx.config.memory_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.memory_cache.sweep();
                self.ctx.metrics.memory_cache_entries.set(self.memory_cache.len() as i64);
            }
        })
    }

    fn derived_status(&self, subject: &Subject) -> CacheStatus {
        if self.update_locks.is_held(subject) {
            return CacheStatus::Updating;
        }
        self.status.get(subject).map(|s| *s).unwrap_or(CacheStatus::Unknown)
    }

    /// Spec §4.8.7 `getCacheStatus`: `UPDATING` always wins over the
    /// recorded base state.
    pub fn cache_status(&self, subject: &Subject) -> CacheStatus {
        self.derived_status(subject)
    }

    fn set_status(&self, subject: &Subject, status: CacheStatus) {
        self.status.insert(subject.clone(), status);
    }

    async fn fetch_page(&self, subject: &Subject, page: u64, size: u64) -> CacheResult<HistoryPage> {
        let options = self.ctx.config.failover_options.clone();
        let indexer = self.indexer.clone();
        let subject = subject.clone();
        execute_with_retry(&options, "indexer history probe", || {
            let indexer = indexer.clone();
            let subject = subject.clone();
            async move {
                match &subject {
                    Subject::Address(id) => indexer.address_history(id, page, size).await,
                    Subject::Token(id) => indexer.token_id_history(id, page, size).await,
                }
            }
        })
        .await
    }

    /// Spec §4.8 entry contract.
    pub async fn history(self: &Arc<Self>, subject: Subject, page_offset: u64, page_size: u64) -> CacheResult<HistoryResponse> {
        self.ctx.metrics.history_requests.with_label_values(&[namespace_label(&subject)]).inc();

        if self.derived_status(&subject) == CacheStatus::Reject {
            let capped = page_size.min(200);
            let page = self.fetch_page(&subject, page_offset, capped).await?;
            return Ok(HistoryResponse {
                txs: page.txs,
                num_pages: page.num_pages,
                num_txs: page.num_txs,
                status: Some(2),
                message: Some(format!("subject {subject} exceeds cache limit")),
            });
        }

        let status = self.derived_status(&subject);

        let remaining = self.notifications.remaining_time(&subject);
        let is_active = matches!(remaining, crate::notification::RemainingTime::Active { .. });

        // Spec §4.8: inactive-and-LATEST schedules a fresh attach; active-or-LATEST
        // (re)arms the timer. These are independent conditions, not a priority chain.
        if !is_active && status == CacheStatus::Latest {
            let engine = self.clone();
            let subject_clone = subject.clone();
            tokio::spawn(async move { engine.notifications.attach(subject_clone).await });
        }
        if is_active || status == CacheStatus::Latest {
            let on_expire = self.make_on_expire_callback();
            self.notifications.reset_timer(subject.clone(), on_expire);
        }

        if status != CacheStatus::Latest {
            let probe = self.fetch_page(&subject, 0, 1).await?;
            if status != CacheStatus::Updating {
                let engine = self.clone();
                let subject_clone = subject.clone();
                let api_num_txs = probe.num_txs;
                tokio::spawn(async move {
                    engine.check_and_update(subject_clone, api_num_txs, false).await;
                });
            }
            if page_size > 200 {
                return Ok(HistoryResponse {
                    txs: vec![],
                    num_pages: 0,
                    num_txs: 0,
                    status: Some(1),
                    message: Some("cache is being prepared".to_string()),
                });
            }
            let page = self.fetch_page(&subject, page_offset, page_size).await?;
            return Ok(HistoryResponse {
                txs: page.txs,
                num_pages: page.num_pages,
                num_txs: page.num_txs,
                status: Some(3),
                message: None,
            });
        }

        match self.serve_from_cache(&subject, page_offset, page_size).await? {
            Some(response) => {
                self.ctx.metrics.history_cache_hits.with_label_values(&[namespace_label(&subject)]).inc();
                Ok(response)
            }
            None => {
                let page = self.fetch_page(&subject, page_offset, page_size).await?;
                Ok(HistoryResponse {
                    txs: page.txs,
                    num_pages: page.num_pages,
                    num_txs: page.num_txs,
                    status: Some(3),
                    message: None,
                })
            }
        }
    }

    fn make_on_expire_callback(self: &Arc<Self>) -> EvictCallback {
        let engine = self.clone();
        Arc::new(move |subject: &Subject| {
            engine.set_status(subject, CacheStatus::Unknown);
            engine.memory_cache.invalidate(subject);
        })
    }

    /// Spec §4.8.1 `checkAndUpdate`. Fire-and-forget: callers spawn this,
    /// it never returns a value the caller awaits on the hot path.
    pub async fn check_and_update(self: Arc<Self>, subject: Subject, api_num_txs: u64, force_update: bool) {
        if api_num_txs > self.ctx.config.max_tx_limit {
            self.set_status(&subject, CacheStatus::Reject);
            self.ctx
                .metrics
                .subjects_rejected
                .with_label_values(&[namespace_label(&subject)])
                .inc();
            return;
        }

        let Some(guard) = self.update_locks.try_admit(&subject) else {
            debug!(%subject, "update already in flight, skipping");
            return;
        };

        let have = match self.store.peek_metadata(&subject) {
            Ok(Some(meta)) => meta.num_txs,
            Ok(None) => 0,
            Err(err) => {
                warn!(%subject, ?err, "failed reading metadata during checkAndUpdate");
                0
            }
        };
        let dynamic_page_size = api_num_txs.saturating_sub(have).clamp(1, 200);

        let needs_build = have == 0 || have != api_num_txs || force_update;
        if needs_build {
            let engine = self.clone();
            let subject_for_task = subject.clone();
            self.set_status(&subject, CacheStatus::Updating);
            self.build_queue.enqueue(move || async move {
                let _guard = guard;
                engine.update_cache(subject_for_task, api_num_txs, dynamic_page_size).await;
            });
        } else {
            drop(guard);
            self.set_status(&subject, CacheStatus::Latest);
            let engine = self.clone();
            let subject_clone = subject.clone();
            tokio::spawn(async move { engine.notifications.attach(subject_clone).await });
        }
    }

    /// Spec §4.8.2 `updateCache`: the background build loop.
    async fn update_cache(self: Arc<Self>, subject: Subject, total_num_txs: u64, page_size: u64) {
        if total_num_txs > self.ctx.config.max_tx_limit {
            self.set_status(&subject, CacheStatus::Reject);
            return;
        }

        let started = Instant::now();
        let mut working = match self.store.read(&subject) {
            Ok(Some(data)) => data,
            Ok(None) => SubjectData::default(),
            Err(err) => {
                warn!(%subject, ?err, "failed to load existing subject for build, starting empty");
                SubjectData::default()
            }
        };

        let mut current_page = 0u64;
        let mut iteration = 0u64;
        loop {
            if working.tx_map.len() as u64 >= total_num_txs {
                sort_tx_order(&mut working.tx_order, &working.tx_map);
                if let Err(err) = self.store.write(&subject, &working) {
                    warn!(%subject, ?err, "final build write failed");
                }
                break;
            }

            let page = match self.fetch_page(&subject, current_page, page_size).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(%subject, ?err, "build loop fetch failed, aborting this attempt");
                    self.set_status(&subject, CacheStatus::Unknown);
                    return;
                }
            };
            if page.txs.is_empty() {
                // Indexer has nothing further to offer; stop rather than loop forever.
                sort_tx_order(&mut working.tx_order, &working.tx_map);
                if let Err(err) = self.store.write(&subject, &working) {
                    warn!(%subject, ?err, "build write failed on early stop");
                }
                break;
            }

            for tx in page.txs {
                if !working.tx_map.contains_key(&tx.txid) {
                    working.tx_order.push(tx.txid.clone());
                    working.tx_map.insert(tx.txid.clone(), tx);
                }
            }
            sort_tx_order(&mut working.tx_order, &working.tx_map);

            let should_write = if working.tx_map.len() >= self.ctx.config.large_subject_threshold {
                iteration % (self.ctx.config.large_subject_write_throttle as u64) == 0
            } else {
                true
            };
            if should_write {
                if let Err(err) = self.store.write(&subject, &working) {
                    warn!(%subject, ?err, "incremental build write failed");
                }
            }

            current_page += 1;
            iteration += 1;
        }

        if self.derived_status(&subject) != CacheStatus::Latest {
            self.set_status(&subject, CacheStatus::Latest);
            let engine = self.clone();
            let subject_clone = subject.clone();
            tokio::spawn(async move { engine.notifications.attach(subject_clone).await });
        }
        self.ctx.metrics.build_duration.observe(started.elapsed().as_secs_f64());
        info!(%subject, txs = working.tx_order.len(), "build complete");
    }

    /// Spec §4.8.3 page serving. Returns `None` on a miss so the caller
    /// falls back to the indexer.
    async fn serve_from_cache(self: &Arc<Self>, subject: &Subject, page_offset: u64, page_size: u64) -> CacheResult<Option<HistoryResponse>> {
        let mut data = match self.memory_cache.get(subject) {
            Some(data) => data,
            None => match self.store.read(subject)? {
                Some(data) => {
                    self.memory_cache.insert(subject.clone(), data.clone());
                    data
                }
                None => return Ok(None),
            },
        };

        sort_tx_order(&mut data.tx_order, &data.tx_map);

        let should_check_hash = rand::thread_rng().gen_bool(self.ctx.config.hash_check_probability);
        if should_check_hash {
            if let Some(meta) = self.store.peek_metadata(subject)? {
                let new_hash = hash_tx_order(&data.tx_order);
                if new_hash != meta.data_hash {
                    warn!(%subject, "hash drift detected, scheduling forced rebuild");
                    self.memory_cache.invalidate(subject);
                    let engine = self.clone();
                    let subject_clone = subject.clone();
                    let num_txs = meta.num_txs;
                    tokio::spawn(async move {
                        engine.check_and_update(subject_clone, num_txs, true).await;
                    });
                }
            }
        }

        let num_txs = data.tx_order.len() as u64;
        let start = (page_offset * page_size) as usize;
        if start >= data.tx_order.len() && !data.tx_order.is_empty() {
            return Err(crate::error::CacheError::OutOfRange {
                requested: start,
                available: data.tx_order.len(),
            });
        }
        let end = (start + page_size as usize).min(data.tx_order.len());
        let slice_ids: Vec<String> = if start < data.tx_order.len() {
            data.tx_order[start..end].to_vec()
        } else {
            vec![]
        };

        let repaired = self.repair_page(subject, slice_ids, &mut data).await?;
        let num_pages = if page_size == 0 { 0 } else { num_txs.div_ceil(page_size) };

        Ok(Some(HistoryResponse {
            txs: repaired,
            num_pages,
            num_txs,
            status: None,
            message: None,
        }))
    }

    /// Spec §4.8.4 `repairPage`: refetches any visible tx missing
    /// `block.height`, replacing it in `txMap` if the refetch now has
    /// one. Resorts and persists only if anything changed.
    async fn repair_page(
        self: &Arc<Self>,
        subject: &Subject,
        slice_ids: Vec<String>,
        data: &mut SubjectData,
    ) -> CacheResult<Vec<crate::subject::Transaction>> {
        let to_repair: Vec<String> = slice_ids
            .iter()
            .filter(|id| data.tx_map.get(*id).map(|tx| tx.block.is_none()).unwrap_or(false))
            .cloned()
            .collect();

        let mut updated = false;
        if !to_repair.is_empty() {
            let mut receivers = Vec::new();
            for txid in to_repair {
                let indexer = self.indexer.clone();
                let options = self.ctx.config.failover_options.clone();
                let rx = self.repair_queue.enqueue(move || async move {
                    execute_with_retry(&options, "repair refetch", || {
                        let indexer = indexer.clone();
                        let txid = txid.clone();
                        async move { indexer.tx(&txid).await }
                    })
                    .await
                });
                receivers.push(rx);
            }
            for rx in receivers {
                if let Ok(Ok(refetched)) = rx.await {
                    if refetched.block.is_some() {
                        data.tx_map.insert(refetched.txid.clone(), refetched);
                        updated = true;
                    }
                }
            }
        }

        if updated {
            sort_tx_order(&mut data.tx_order, &data.tx_map);
            self.store.write(subject, data)?;
        }

        Ok(slice_ids.iter().filter_map(|id| data.tx_map.get(id).cloned()).collect())
    }

    /// Spec §4.8.5 `updateUnconfirmed`, triggered by `TX_FINALIZED`, with
    /// 500ms debouncing per `(subject, msgType)` key.
    pub fn update_unconfirmed(self: &Arc<Self>, subject: Subject, txid: String) {
        self.debounced(subject.clone(), "finalized", move |engine| {
            let subject = subject.clone();
            let txid = txid.clone();
            async move {
                let indexer = engine.indexer.clone();
                let options = engine.ctx.config.failover_options.clone();
                let refetched = execute_with_retry(&options, "updateUnconfirmed refetch", || {
                    let indexer = indexer.clone();
                    let txid = txid.clone();
                    async move { indexer.tx(&txid).await }
                })
                .await;
                let Ok(refetched) = refetched else { return };

                let Ok(Some(mut data)) = engine.store.read(&subject) else {
                    return;
                };
                if data.tx_map.contains_key(&refetched.txid) {
                    data.tx_map.insert(refetched.txid.clone(), refetched);
                    sort_tx_order(&mut data.tx_order, &data.tx_map);
                    if let Err(err) = engine.store.write(&subject, &data) {
                        warn!(%subject, ?err, "updateUnconfirmed write failed");
                    }
                    engine.memory_cache.invalidate(&subject);
                }
            }
        });
    }

    fn debounced<F, Fut>(self: &Arc<Self>, subject: Subject, key: &'static str, work: F)
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let generation = self
            .debounce_generation
            .entry((subject.clone(), key))
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        let my_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;

        let engine = self.clone();
        let debounce = self.ctx.config.update_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if generation.load(Ordering::SeqCst) == my_generation {
                work(engine).await;
            }
        });
    }

    /// Spec §4.8.6 notification callback policy.
    pub fn handle_notification_event(self: &Arc<Self>, subject: Subject, txid: String, msg_type: MsgType) {
        match msg_type {
            MsgType::TxAddedToMempool => {
                self.memory_cache.invalidate(&subject);
                let engine = self.clone();
                tokio::spawn(async move {
                    let probe = engine.fetch_page(&subject, 0, 1).await;
                    if let Ok(probe) = probe {
                        engine.check_and_update(subject, probe.num_txs, false).await;
                    }
                });
            }
            MsgType::TxFinalized => {
                self.memory_cache.invalidate(&subject);
                self.update_unconfirmed(subject, txid);
            }
        }
    }

    /// Exposes the notification manager so the facade can route inbound
    /// transport events through its subscription filter and panic guard
    /// (spec §4.7 `dispatch`) instead of calling engine handlers directly.
    pub fn notifications(&self) -> &Arc<NotificationManager<C>> {
        &self.notifications
    }

    /// Passthrough accessor for the underlying indexer client (spec §9
    /// "duck-typed indexer client" -- other methods the embedder's
    /// concrete client exposes remain reachable through this handle).
    pub fn indexer(&self) -> &Arc<C> {
        &self.indexer
    }

    pub fn build_queue_length(&self) -> usize {
        self.build_queue.queue_length()
    }

    pub fn repair_queue_length(&self) -> usize {
        self.repair_queue.queue_length()
    }

    pub fn memory_cache_len(&self) -> usize {
        self.memory_cache.len()
    }

    pub(crate) fn all_statuses(&self) -> HashMap<Subject, CacheStatus> {
        self.status.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    pub(crate) fn clear_status(&self, subject: &Subject) {
        self.status.remove(subject);
        self.memory_cache.invalidate(subject);
    }

    /// Spec §4.9 Stats.
    pub fn statistics(&self) -> CacheResult<crate::stats::Statistics> {
        crate::stats::collect(
            self.store.kv(),
            &self.all_statuses(),
            self.memory_cache_len(),
            self.build_queue_length(),
            self.repair_queue_length(),
            &self.ctx.config,
        )
    }

    /// Clears one subject's durable state and derived status (spec §4.10
    /// `clearAddressCache`/`clearTokenCache`).
    pub fn clear_subject(&self, subject: &Subject) -> CacheResult<()> {
        self.store.clear_subject(subject)?;
        self.clear_status(subject);
        Ok(())
    }

    /// Clears every subject's durable state (spec §4.10 `clearAllCache`).
    pub fn clear_all(&self) -> CacheResult<()> {
        for subject in self.all_statuses().keys() {
            self.clear_subject(subject)?;
        }
        self.status.clear();
        Ok(())
    }

    /// Tears down background resources: outstanding notification
    /// subscriptions/timers and the memory sweeper (spec §4.10 `destroy`),
    /// grounded on `CommitSyncerHandle::stop`'s shutdown-signal-then-join
    /// shape.
    pub async fn destroy(&self) {
        self.notifications.detach_all().await;
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn namespace_label(subject: &Subject) -> &'static str {
    match subject {
        Subject::Address(_) => "address",
        Subject::Token(_) => "token",
    }
}
