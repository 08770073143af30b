//! End-to-end scenarios S1-S6.
//!
//! Each test drives the public `ChronikCache` facade against a
//! `FakeIndexerClient` and an in-memory `MemStore`, the same doubles the
//! crate's own unit tests use, reached here through the `test-support`
//! feature so this file exercises the crate as an external embedder would.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chronik_cache::indexer::test_support::FakeIndexerClient;
use chronik_cache::indexer::HistoryPage;
use chronik_cache::kv_store::{KvStore, MemStore};
use chronik_cache::subject::{BlockInfo, CacheMetadata, Transaction};
use chronik_cache::{CacheConfig, CacheStatus, ChronikCache, MsgType};

fn confirmed_tx(id: &str, height: i64) -> Transaction {
    Transaction {
        txid: id.to_string(),
        block: Some(BlockInfo { height, timestamp: 0 }),
        time_first_seen: height,
        is_final: true,
        extra: BTreeMap::new(),
    }
}

fn mempool_tx(id: &str, first_seen: i64) -> Transaction {
    Transaction {
        txid: id.to_string(),
        block: None,
        time_first_seen: first_seen,
        is_final: false,
        extra: BTreeMap::new(),
    }
}

async fn wait_until_status(cache: &ChronikCache<FakeIndexerClient>, id: &str, target: CacheStatus) {
    for _ in 0..200 {
        if cache.get_cache_status(id, false) == target {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("subject {id} never reached {target:?}");
}

#[tokio::test]
async fn s1_first_query_bootstrap() {
    let client = FakeIndexerClient::default();
    let txs: Vec<Transaction> = (0..350).map(|i| confirmed_tx(&format!("tx{i}"), i)).collect();
    client.history.lock().insert(
        "A".to_string(),
        HistoryPage {
            num_txs: txs.len() as u64,
            num_pages: 0,
            txs,
        },
    );
    let cache = ChronikCache::new(Arc::new(client), Arc::new(MemStore::new()), CacheConfig::default()).unwrap();

    let first = cache.address("A").history(0, 200).await.unwrap();
    assert_eq!(first.status, Some(3));
    assert_eq!(first.num_txs, 350);
    assert_eq!(first.txs.len(), 200);
    assert_eq!(first.num_pages, 2);

    wait_until_status(&cache, "A", CacheStatus::Latest).await;

    let second = cache.address("A").history(0, 200).await.unwrap();
    assert_eq!(second.status, None);
    assert_eq!(second.num_txs, 350);
    assert_eq!(second.num_pages, 2);
    assert_eq!(second.txs.len(), 200);
}

#[tokio::test]
async fn s2_over_limit_reject() {
    let client = FakeIndexerClient::default();
    let txs: Vec<Transaction> = (0..500).map(|i| confirmed_tx(&format!("tx{i}"), i)).collect();
    client.history.lock().insert(
        "B".to_string(),
        HistoryPage {
            num_txs: txs.len() as u64,
            num_pages: 0,
            txs,
        },
    );
    let mut config = CacheConfig::default();
    config.max_tx_limit = 100;
    let cache = ChronikCache::new(Arc::new(client), Arc::new(MemStore::new()), config).unwrap();

    let first = cache.address("B").history(0, 200).await.unwrap();
    assert_eq!(first.status, Some(3));

    wait_until_status(&cache, "B", CacheStatus::Reject).await;

    let second = cache.address("B").history(0, 200).await.unwrap();
    assert_eq!(second.status, Some(2));
    assert!(second.message.unwrap().contains("exceeds cache limit"));
    assert!(second.txs.len() <= 200);
}

#[tokio::test]
async fn s3_large_page_preparation() {
    let client = FakeIndexerClient::default();
    let txs: Vec<Transaction> = (0..10).map(|i| confirmed_tx(&format!("tx{i}"), i)).collect();
    client.history.lock().insert(
        "C".to_string(),
        HistoryPage {
            num_txs: txs.len() as u64,
            num_pages: 0,
            txs,
        },
    );
    let cache = ChronikCache::new(Arc::new(client), Arc::new(MemStore::new()), CacheConfig::default()).unwrap();

    let first = cache.address("C").history(0, 8000).await.unwrap();
    assert_eq!(first.status, Some(1));
    assert!(first.message.unwrap().contains("being prepared"));
    assert_eq!(first.txs.len(), 0);
    assert_eq!(first.num_pages, 0);
    assert_eq!(first.num_txs, 0);

    wait_until_status(&cache, "C", CacheStatus::Latest).await;

    let second = cache.address("C").history(0, 8000).await.unwrap();
    assert_eq!(second.status, None);
    assert_eq!(second.num_txs, 10);
    assert_eq!(second.txs.len(), 10);
}

#[tokio::test]
async fn s4_hash_drift_detection() {
    let client = FakeIndexerClient::default();
    let txs: Vec<Transaction> = (0..5).map(|i| confirmed_tx(&format!("tx{i}"), i)).collect();
    client.history.lock().insert(
        "D".to_string(),
        HistoryPage {
            num_txs: txs.len() as u64,
            num_pages: 0,
            txs,
        },
    );
    // Also give the evictor subject something to build, so writing its
    // metadata pushes subject D's entry out of the single-slot metadata LRU.
    client.history.lock().insert(
        "evictor".to_string(),
        HistoryPage {
            num_txs: 1,
            num_pages: 0,
            txs: vec![confirmed_tx("ev0", 0)],
        },
    );

    let mut config = CacheConfig::default();
    config.hash_check_probability = 1.0;
    config.global_metadata_cache_limit = 1;
    let kv = Arc::new(MemStore::new());
    let kv_dyn: Arc<dyn KvStore> = kv.clone();
    let cache = ChronikCache::new(Arc::new(client), kv_dyn, config).unwrap();

    cache.address("D").history(0, 200).await.unwrap();
    wait_until_status(&cache, "D", CacheStatus::Latest).await;

    // Corrupt the durable metadata hash directly, bypassing the engine.
    let meta_key = "metadata:address:D";
    let bytes = kv.get(meta_key).unwrap().unwrap();
    let mut meta: CacheMetadata = serde_json::from_slice(&bytes).unwrap();
    meta.data_hash = "not-a-real-hash".to_string();
    kv.put(meta_key, serde_json::to_vec(&meta).unwrap()).unwrap();

    // Evict D's now-stale metadata_cache entry by building an unrelated
    // subject, so the next read of D's metadata goes to the (corrupted) KV.
    cache.address("evictor").history(0, 200).await.unwrap();
    wait_until_status(&cache, "evictor", CacheStatus::Latest).await;

    // This call takes the hash-check branch (probability 1.0), observes the
    // drift, and schedules a forced rebuild -- while still serving the
    // stale-but-loaded view for the current request.
    let during = cache.address("D").history(0, 200).await.unwrap();
    assert_eq!(during.num_txs, 5);

    for _ in 0..200 {
        let bytes = kv.get(meta_key).unwrap().unwrap();
        let meta: CacheMetadata = serde_json::from_slice(&bytes).unwrap();
        if meta.data_hash != "not-a-real-hash" {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("hash was never repaired by the forced rebuild");
}

#[tokio::test]
async fn s5_mempool_to_final_propagation() {
    let client = Arc::new(FakeIndexerClient::default());
    client.history.lock().insert(
        "E".to_string(),
        HistoryPage {
            num_txs: 0,
            num_pages: 0,
            txs: vec![],
        },
    );
    let mut config = CacheConfig::default();
    config.hash_check_probability = 0.0;
    config.update_debounce = Duration::from_millis(30);
    let cache = ChronikCache::new(client.clone(), Arc::new(MemStore::new()), config).unwrap();

    // `dispatch` only delivers events to subjects with a live subscription
    // (spec §4.7 "for every matching subscription"), matching a real
    // transport that only pushes mempool events for addresses it's
    // already subscribed to -- so establish that subscription first.
    cache.address("E").history(0, 200).await.unwrap();
    wait_until_status(&cache, "E", CacheStatus::Latest).await;
    tokio::time::sleep(Duration::from_millis(50)).await; // let the spawned attach() land

    {
        let mut history = client.history.lock();
        let entry = history.get_mut("E").unwrap();
        entry.txs.push(mempool_tx("txmempool", 1));
        entry.num_txs = 1;
    }

    cache.handle_notification_event(
        chronik_cache::Subject::Address("E".to_string()),
        "txmempool".to_string(),
        MsgType::TxAddedToMempool,
    );

    for _ in 0..200 {
        let response = cache.address("E").history(0, 200).await.unwrap();
        if response.txs.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let before = cache.address("E").history(0, 200).await.unwrap();
    assert_eq!(before.txs.len(), 1);
    assert!(before.txs[0].block.is_none());

    // The transport now reports the tx as finalized: the indexer's
    // single-tx lookup starts returning the confirmed record.
    client.txs.lock().insert("txmempool".to_string(), confirmed_tx("txmempool", 1));

    cache.handle_notification_event(
        chronik_cache::Subject::Address("E".to_string()),
        "txmempool".to_string(),
        MsgType::TxFinalized,
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = cache.address("E").history(0, 200).await.unwrap();
    assert_eq!(after.txs.len(), 1);
    assert!(after.txs[0].block.is_some());
}

#[tokio::test]
async fn s6_subscription_eviction() {
    use chronik_cache::notification::{NotificationManager, RemainingTime};
    use chronik_cache::Subject;
    use prometheus::Registry;
    use std::sync::Mutex as StdMutex;

    let evicted: Arc<StdMutex<Vec<Subject>>> = Arc::new(StdMutex::new(Vec::new()));
    let evicted2 = evicted.clone();
    let metrics = Arc::new(chronik_cache::metrics::Metrics::new(&Registry::new()));

    let manager = Arc::new(NotificationManager::new(
        Arc::new(FakeIndexerClient::default()),
        2,
        Duration::from_secs(3600),
        Duration::from_secs(60),
        Duration::from_secs(3600),
        Arc::new(|_, _, _| {}),
        Arc::new(move |s: &Subject| evicted2.lock().unwrap().push(s.clone())),
        metrics,
    ));

    let x = Subject::Address("X".to_string());
    let y = Subject::Address("Y".to_string());
    let z = Subject::Address("Z".to_string());

    manager.attach(x.clone()).await;
    manager.attach(y.clone()).await;
    manager.attach(z.clone()).await;

    assert_eq!(*evicted.lock().unwrap(), vec![x.clone()]);

    match manager.remaining_time(&x) {
        RemainingTime::Inactive { message } => assert!(message.contains("not subscribed")),
        RemainingTime::Active { .. } => panic!("X should have been evicted"),
    }
    for still_attached in [&y, &z] {
        match manager.remaining_time(still_attached) {
            RemainingTime::Inactive { message } => assert!(message.contains("no timer armed")),
            RemainingTime::Active { .. } => panic!("unexpected armed timer"),
        }
    }
}
