// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Notification Manager (spec §4.7): maintains live subscriptions to the
//! indexer for addresses and tokens, dispatches events, enforces capacity
//! and per-subject timeouts. Grounded on `broadcaster.rs`'s per-peer
//! background fan-out, generalized from "one task per peer" to "one
//! timer per subscribed subject".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::indexer::{ChronikClientInterface, MsgType, TxEvent};
use crate::metrics::Metrics;
use crate::subject::Subject;

pub type EventCallback = Arc<dyn Fn(&Subject, &str, MsgType) + Send + Sync>;
pub type EvictCallback = Arc<dyn Fn(&Subject) + Send + Sync>;

/// Reconnect window (spec §4.7): a connection loss not resolved by a
/// reconnect within this interval detaches every tracked subject.
const RECONNECT_GRACE: Duration = Duration::from_secs(5);

struct Subscription {
    timer_cancel: Option<oneshot::Sender<()>>,
    expiry: Option<Instant>,
}

/// One of the two logical subscription sets (addresses or tokens).
struct Namespace {
    subscriptions: DashMap<Subject, Subscription>,
    /// FIFO-by-insertion order, used for capacity eviction.
    order: parking_lot::Mutex<VecDeque<Subject>>,
    max_subscriptions: usize,
}

impl Namespace {
    fn new(max_subscriptions: usize) -> Self {
        Self {
            subscriptions: DashMap::new(),
            order: parking_lot::Mutex::new(VecDeque::new()),
            max_subscriptions,
        }
    }

    fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

pub struct NotificationManager<C: ChronikClientInterface> {
    client: Arc<C>,
    addresses: Namespace,
    tokens: Namespace,
    on_event: EventCallback,
    on_evict: EvictCallback,
    ws_timeout: Duration,
    ws_extend_timeout: Duration,
    max_timer_duration: Duration,
    metrics: Arc<Metrics>,
    reconnect_generation: AtomicU64,
}

impl<C: ChronikClientInterface + 'static> NotificationManager<C> {
    pub fn new(
        client: Arc<C>,
        max_subscriptions: usize,
        ws_timeout: Duration,
        ws_extend_timeout: Duration,
        max_timer_duration: Duration,
        on_event: EventCallback,
        on_evict: EvictCallback,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            addresses: Namespace::new(max_subscriptions),
            tokens: Namespace::new(max_subscriptions),
            on_event,
            on_evict,
            ws_timeout,
            ws_extend_timeout,
            max_timer_duration,
            metrics,
            reconnect_generation: AtomicU64::new(0),
        }
    }

    /// Wires the transport's connection-lifecycle hooks (spec §4.7): a
    /// reconnect re-subscribes every tracked subject; an error or end
    /// event not followed by a reconnect within [`RECONNECT_GRACE`]
    /// detaches every tracked subject and reports it UNKNOWN via the
    /// eviction callback. Must be called once, after the manager is
    /// wrapped in its owning `Arc`.
    pub fn install_reconnect_handlers(self: &Arc<Self>) {
        let manager = self.clone();
        self.client.on_reconnect(Arc::new(move || {
            manager.reconnect_generation.fetch_add(1, Ordering::SeqCst);
            let manager = manager.clone();
            tokio::spawn(async move { manager.resubscribe_all().await });
        }));

        let manager = self.clone();
        self.client.on_error(Arc::new(move |_message| {
            manager.clone().schedule_disconnect_grace();
        }));

        let manager = self.clone();
        self.client.on_end(Arc::new(move || {
            manager.clone().schedule_disconnect_grace();
        }));
    }

    async fn resubscribe_all(&self) {
        let address_subjects: Vec<Subject> = self.addresses.subscriptions.iter().map(|e| e.key().clone()).collect();
        let token_subjects: Vec<Subject> = self.tokens.subscriptions.iter().map(|e| e.key().clone()).collect();
        let count = address_subjects.len() + token_subjects.len();
        for subject in &address_subjects {
            if let Subject::Address(id) = subject {
                self.client.subscribe_to_address(id).await;
            }
        }
        for subject in &token_subjects {
            if let Subject::Token(id) = subject {
                self.client.subscribe_to_token_id(id).await;
            }
        }
        info!(count, "resubscribed tracked subjects after reconnect");
    }

    fn schedule_disconnect_grace(self: Arc<Self>) {
        let generation = self.reconnect_generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_GRACE).await;
            if self.reconnect_generation.load(Ordering::SeqCst) == generation {
                self.detach_all_as_unknown().await;
            }
        });
    }

    async fn detach_all_as_unknown(&self) {
        let address_subjects: Vec<Subject> = self.addresses.subscriptions.iter().map(|e| e.key().clone()).collect();
        let token_subjects: Vec<Subject> = self.tokens.subscriptions.iter().map(|e| e.key().clone()).collect();
        for subject in address_subjects.into_iter().chain(token_subjects) {
            self.detach(subject.clone()).await;
            (self.on_evict)(&subject);
        }
    }

    fn namespace(&self, subject: &Subject) -> &Namespace {
        match subject {
            Subject::Address(_) => &self.addresses,
            Subject::Token(_) => &self.tokens,
        }
    }

    /// Subscribes to `subject` on the indexer (spec §4.7 `attach`).
    /// Idempotent; evicts the oldest entry FIFO-wise when at capacity.
    pub async fn attach(&self, subject: Subject) {
        let ns = self.namespace(&subject);
        if ns.subscriptions.contains_key(&subject) {
            debug!(%subject, "already attached");
            return;
        }

        if ns.len() >= ns.max_subscriptions {
            let oldest = ns.order.lock().pop_front();
            if let Some(oldest) = oldest {
                self.detach(oldest.clone()).await;
                (self.on_evict)(&oldest);
                self.metrics
                    .subscription_evictions
                    .with_label_values(&[namespace_label(&subject)])
                    .inc();
            }
        }

        match &subject {
            Subject::Address(id) => self.client.subscribe_to_address(id).await,
            Subject::Token(id) => self.client.subscribe_to_token_id(id).await,
        }

        ns.subscriptions.insert(
            subject.clone(),
            Subscription {
                timer_cancel: None,
                expiry: None,
            },
        );
        ns.order.lock().push_back(subject.clone());
        self.metrics.active_subscriptions.set((self.addresses.len() + self.tokens.len()) as i64);
        info!(%subject, "attached notification subscription");
    }

    /// Unsubscribes on the indexer and removes `subject` (spec §4.7
    /// `detach`).
    pub async fn detach(&self, subject: Subject) {
        let ns = self.namespace(&subject);
        if let Some((_, mut sub)) = ns.subscriptions.remove(&subject) {
            if let Some(cancel) = sub.timer_cancel.take() {
                let _ = cancel.send(());
            }
            match &subject {
                Subject::Address(id) => self.client.unsubscribe_from_address(id).await,
                Subject::Token(id) => self.client.unsubscribe_from_token_id(id).await,
            }
            ns.order.lock().retain(|s| s != &subject);
            self.metrics.active_subscriptions.set((self.addresses.len() + self.tokens.len()) as i64);
        }
    }

    /// Detaches every subject in both namespaces (spec §4.7 `detachAll`).
    pub async fn detach_all(&self) {
        let address_subjects: Vec<Subject> = self.addresses.subscriptions.iter().map(|e| e.key().clone()).collect();
        for subject in address_subjects {
            self.detach(subject).await;
        }
        let token_subjects: Vec<Subject> = self.tokens.subscriptions.iter().map(|e| e.key().clone()).collect();
        for subject in token_subjects {
            self.detach(subject).await;
        }
    }

    /// (Re)arms the per-subject timer (spec §4.7 `resetTimer`). On first
    /// call expiry is `now + wsTimeout`; subsequent calls extend by
    /// `wsExtendTimeout`. A single sleep is clamped to
    /// `max_timer_duration` and re-armed without firing if the true
    /// expiry is further out.
    pub fn reset_timer(self: &Arc<Self>, subject: Subject, on_expire: EvictCallback)
    where
        C: 'static,
    {
        let ns = self.namespace(&subject);
        let Some(mut entry) = ns.subscriptions.get_mut(&subject) else {
            return;
        };

        let now = Instant::now();
        let new_expiry = match entry.expiry {
            None => now + self.ws_timeout,
            Some(previous) => previous.max(now) + self.ws_extend_timeout,
        };
        entry.expiry = Some(new_expiry);

        if let Some(cancel) = entry.timer_cancel.take() {
            let _ = cancel.send(());
        }

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.timer_cancel = Some(cancel_tx);
        drop(entry);

        let manager = self.clone();
        let max_timer = self.max_timer_duration;
        tokio::spawn(async move {
            let mut expiry = new_expiry;
            loop {
                let sleep_for = expiry.saturating_duration_since(Instant::now()).min(max_timer);
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = &mut cancel_rx => return,
                }
                if Instant::now() >= expiry {
                    manager.detach(subject.clone()).await;
                    on_expire(&subject);
                    return;
                }
                // Timer duration was clamped below the true expiry; loop
                // around and sleep the remainder.
            }
        });
    }

    /// Reports whether a timer is live and how long until expiry (spec
    /// §4.7 `getRemainingTime`).
    pub fn remaining_time(&self, subject: &Subject) -> RemainingTime {
        let ns = self.namespace(subject);
        match ns.subscriptions.get(subject) {
            Some(sub) => match sub.expiry {
                Some(expiry) => {
                    let now = Instant::now();
                    if expiry > now {
                        RemainingTime::Active {
                            remaining: expiry - now,
                        }
                    } else {
                        RemainingTime::Inactive {
                            message: "timer expired".to_string(),
                        }
                    }
                }
                None => RemainingTime::Inactive {
                    message: "no timer armed".to_string(),
                },
            },
            None => RemainingTime::Inactive {
                message: "not subscribed".to_string(),
            },
        }
    }

    /// Dispatches one inbound event to every matching subscription (spec
    /// §4.7 event dispatch). Callback panics/errors never bubble to the
    /// transport.
    pub fn dispatch(&self, subject: &Subject, event: TxEvent) {
        let ns = self.namespace(subject);
        if !ns.subscriptions.contains_key(subject) {
            return;
        }
        let on_event = self.on_event.clone();
        let subject = subject.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            on_event(&subject, &event.txid, event.msg_type);
        }));
        if result.is_err() {
            warn!(%subject, "notification callback panicked, swallowing");
        }
    }
}

fn namespace_label(subject: &Subject) -> &'static str {
    match subject {
        Subject::Address(_) => "address",
        Subject::Token(_) => "token",
    }
}

#[derive(Debug, Clone)]
pub enum RemainingTime {
    Active { remaining: Duration },
    Inactive { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::test_support::FakeIndexerClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(max_subs: usize) -> Arc<NotificationManager<FakeIndexerClient>> {
        let evicted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let evicted2 = evicted.clone();
        Arc::new(NotificationManager::new(
            Arc::new(FakeIndexerClient::default()),
            max_subs,
            Duration::from_secs(3600),
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Arc::new(|_, _, _| {}),
            Arc::new(move |s| evicted2.lock().unwrap().push(s.clone())),
            Metrics::new_for_test(),
        ))
    }

    #[tokio::test]
    async fn attach_is_idempotent() {
        let manager = manager(10);
        let subject = Subject::Address("a".to_string());
        manager.attach(subject.clone()).await;
        manager.attach(subject.clone()).await;
        assert_eq!(manager.addresses.len(), 1);
    }

    #[tokio::test]
    async fn capacity_eviction_is_fifo_with_exactly_one_callback() {
        let evict_count = Arc::new(AtomicUsize::new(0));
        let evict_count2 = evict_count.clone();
        let last_evicted: Arc<std::sync::Mutex<Option<Subject>>> = Arc::new(std::sync::Mutex::new(None));
        let last_evicted2 = last_evicted.clone();

        let manager = Arc::new(NotificationManager::new(
            Arc::new(FakeIndexerClient::default()),
            2,
            Duration::from_secs(3600),
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Arc::new(|_, _, _| {}),
            Arc::new(move |s| {
                evict_count2.fetch_add(1, Ordering::SeqCst);
                *last_evicted2.lock().unwrap() = Some(s.clone());
            }),
            Metrics::new_for_test(),
        ));

        let x = Subject::Address("x".to_string());
        let y = Subject::Address("y".to_string());
        let z = Subject::Address("z".to_string());

        manager.attach(x.clone()).await;
        manager.attach(y.clone()).await;
        manager.attach(z.clone()).await;

        assert_eq!(evict_count.load(Ordering::SeqCst), 1);
        assert_eq!(*last_evicted.lock().unwrap(), Some(x));
        assert_eq!(manager.addresses.len(), 2);
        assert!(manager.addresses.subscriptions.contains_key(&y));
        assert!(manager.addresses.subscriptions.contains_key(&z));
    }

    #[tokio::test]
    async fn detach_removes_subscription() {
        let manager = manager(10);
        let subject = Subject::Address("a".to_string());
        manager.attach(subject.clone()).await;
        manager.detach(subject.clone()).await;
        assert_eq!(manager.addresses.len(), 0);
    }

    #[tokio::test]
    async fn remaining_time_is_inactive_before_reset_timer() {
        let manager = manager(10);
        let subject = Subject::Address("a".to_string());
        manager.attach(subject.clone()).await;
        match manager.remaining_time(&subject) {
            RemainingTime::Inactive { .. } => {}
            RemainingTime::Active { .. } => panic!("expected inactive"),
        }
    }

    #[tokio::test]
    async fn reset_timer_arms_an_active_timer() {
        let manager = manager(10);
        let subject = Subject::Address("a".to_string());
        manager.attach(subject.clone()).await;
        manager.reset_timer(subject.clone(), Arc::new(|_| {}));
        match manager.remaining_time(&subject) {
            RemainingTime::Active { .. } => {}
            RemainingTime::Inactive { .. } => panic!("expected active"),
        }
    }

    #[tokio::test]
    async fn reconnect_resubscribes_tracked_subjects() {
        let client = Arc::new(FakeIndexerClient::default());
        let manager = Arc::new(NotificationManager::new(
            client.clone(),
            10,
            Duration::from_secs(3600),
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Arc::new(|_, _, _| {}),
            Arc::new(|_| {}),
            Metrics::new_for_test(),
        ));
        manager.install_reconnect_handlers();

        let subject = Subject::Address("a".to_string());
        manager.attach(subject.clone()).await;
        client.subscribed_addresses.lock().clear();

        client.fire_reconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*client.subscribed_addresses.lock(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_without_reconnect_detaches_after_grace_window() {
        let evicted: Arc<std::sync::Mutex<Vec<Subject>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let evicted2 = evicted.clone();
        let client = Arc::new(FakeIndexerClient::default());
        let manager = Arc::new(NotificationManager::new(
            client.clone(),
            10,
            Duration::from_secs(3600),
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Arc::new(|_, _, _| {}),
            Arc::new(move |s: &Subject| evicted2.lock().unwrap().push(s.clone())),
            Metrics::new_for_test(),
        ));
        manager.install_reconnect_handlers();

        let subject = Subject::Address("a".to_string());
        manager.attach(subject.clone()).await;

        client.fire_end();
        tokio::time::advance(RECONNECT_GRACE + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(*evicted.lock().unwrap(), vec![subject]);
        assert_eq!(manager.addresses.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_window_cancels_the_detach() {
        let evicted: Arc<std::sync::Mutex<Vec<Subject>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let evicted2 = evicted.clone();
        let client = Arc::new(FakeIndexerClient::default());
        let manager = Arc::new(NotificationManager::new(
            client.clone(),
            10,
            Duration::from_secs(3600),
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Arc::new(|_, _, _| {}),
            Arc::new(move |s: &Subject| evicted2.lock().unwrap().push(s.clone())),
            Metrics::new_for_test(),
        ));
        manager.install_reconnect_handlers();

        let subject = Subject::Address("a".to_string());
        manager.attach(subject.clone()).await;

        client.fire_error("ECONNRESET");
        tokio::time::advance(Duration::from_millis(100)).await;
        client.fire_reconnect();
        tokio::time::advance(RECONNECT_GRACE + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        assert!(evicted.lock().unwrap().is_empty());
        assert_eq!(manager.addresses.len(), 1);
    }
}
