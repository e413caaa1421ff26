//! Integration tests for capacity pressure and the admission policies.

mod common;

use std::time::Duration;

use common::{harness, tight_config, BYTES_PER_TOKEN};
use vpid_kv_cache::cache::Tier;
use vpid_kv_cache::config::{AdmissionPolicy, PressureMode};
use vpid_kv_cache::pipeline::{IngestRequest, QueryRequest};
use vpid_kv_cache::CoreError;

const TOKENS: usize = 100;

fn tier_of(h: &common::Harness, id: &str) -> Tier {
    h.service.cache.get(id).unwrap().tier
}

fn ingest_request() -> IngestRequest {
    IngestRequest {
        content: common::document(TOKENS),
        model_id: "m".into(),
        name: None,
        ttl_seconds: None,
        reuse_existing: false,
    }
}

fn query(context_id: &str) -> QueryRequest {
    QueryRequest {
        context_id: context_id.to_string(),
        query: "summarize the policy".to_string(),
        max_tokens: Some(4),
        model_id: Some("m".to_string()),
    }
}

#[tokio::test]
async fn test_lru_victim_moves_to_warm() {
    let h = harness(tight_config(TOKENS, 2, 4));
    h.load("m").await;
    let c1 = h.ingest("m", TOKENS).await;
    let c2 = h.ingest("m", TOKENS).await;

    // c1 becomes the most recently used.
    h.service.query.query(query(&c1.context_id)).await.unwrap();

    let c3 = h.ingest("m", TOKENS).await;
    assert_eq!(tier_of(&h, &c1.context_id), Tier::Hot);
    assert_eq!(tier_of(&h, &c2.context_id), Tier::Warm);
    assert_eq!(tier_of(&h, &c3.context_id), Tier::Hot);

    let stats = h.service.cache.stats();
    assert_eq!(stats.hot.entries, 2);
    assert_eq!(stats.hot.bytes, 2 * TOKENS * BYTES_PER_TOKEN);
    assert_eq!(stats.warm.entries, 1);
}

#[tokio::test]
async fn test_warm_overflow_cascades_to_cold() {
    let h = harness(tight_config(TOKENS, 1, 1));
    h.load("m").await;
    let c1 = h.ingest("m", TOKENS).await;
    let c2 = h.ingest("m", TOKENS).await;
    let c3 = h.ingest("m", TOKENS).await;

    assert_eq!(tier_of(&h, &c1.context_id), Tier::Cold);
    assert_eq!(tier_of(&h, &c2.context_id), Tier::Warm);
    assert_eq!(tier_of(&h, &c3.context_id), Tier::Hot);
    assert!(h.storage.contains(&c1.context_id));

    // Querying the cold context brings it back and pushes the others down.
    let answer = h.service.query.query(query(&c1.context_id)).await.unwrap();
    assert!(!answer.cache_hit);
    assert_eq!(tier_of(&h, &c1.context_id), Tier::Hot);
    assert_eq!(tier_of(&h, &c3.context_id), Tier::Warm);
    assert_eq!(tier_of(&h, &c2.context_id), Tier::Cold);
}

#[tokio::test]
async fn test_oversized_context_is_rejected() {
    let h = harness(tight_config(TOKENS, 1, 1));
    h.load("m").await;
    let err = h
        .service
        .ingest
        .ingest(IngestRequest {
            content: common::document(TOKENS * 2),
            model_id: "m".into(),
            name: None,
            ttl_seconds: None,
            reuse_existing: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::CapacityExceeded { .. }));
    assert!(h.service.cache.is_empty());
    assert_eq!(h.service.cache.stats().hot.reserved, 0);
}

#[tokio::test]
async fn test_explicit_demote_to_full_warm_is_refused() {
    let h = harness(tight_config(TOKENS, 2, 0));
    h.load("m").await;
    let c1 = h.ingest("m", TOKENS).await;

    let err = h
        .service
        .cache
        .demote(&c1.context_id, Tier::Warm)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::CapacityExceeded { .. }));
    assert_eq!(tier_of(&h, &c1.context_id), Tier::Hot);
}

#[tokio::test]
async fn test_lease_outlives_demotion() {
    let h = harness(tight_config(TOKENS, 2, 2));
    h.load("m").await;
    let c1 = h.ingest("m", TOKENS).await;

    let lease = h
        .service
        .cache
        .acquire_for_query(&c1.context_id, "m")
        .await
        .unwrap();
    h.service.cache.demote(&c1.context_id, Tier::Cold).await.unwrap();

    assert_eq!(lease.kv().seq_len(), TOKENS);
    assert_eq!(h.service.cache.device().used(), TOKENS * BYTES_PER_TOKEN);
    drop(lease);
    assert_eq!(h.service.cache.device().used(), 0);
}

#[tokio::test]
async fn test_single_victim_admission_demotes_one() {
    let h = harness(tight_config(TOKENS, 4, 8));
    h.load("m").await;
    for _ in 0..5 {
        h.ingest("m", TOKENS).await;
    }
    let stats = h.service.cache.stats();
    assert_eq!(stats.hot.entries, 4);
    assert_eq!(stats.warm.entries, 1);
}

#[tokio::test]
async fn test_batch_admission_demotes_to_watermark() {
    let mut config = tight_config(TOKENS, 4, 8);
    config.eviction.admission = AdmissionPolicy::Batch;
    config.eviction.low_watermark = 0.5;
    let h = harness(config);
    h.load("m").await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(h.ingest("m", TOKENS).await.context_id);
    }

    let stats = h.service.cache.stats();
    assert_eq!(stats.hot.entries, 2);
    assert_eq!(stats.warm.entries, 3);
    assert_eq!(tier_of(&h, &ids[3]), Tier::Hot);
    assert_eq!(tier_of(&h, &ids[4]), Tier::Hot);
    assert_eq!(tier_of(&h, &ids[0]), Tier::Warm);
}

#[tokio::test]
async fn test_deferred_pressure_rebalances_in_background() {
    let mut config = tight_config(TOKENS, 2, 4);
    config.eviction.pressure = PressureMode::Deferred;
    config.tiers.device_memory_bytes = config.tiers.hot_capacity_bytes * 2;
    let h = harness(config);
    h.load("m").await;

    let c1 = h.ingest("m", TOKENS).await;
    h.ingest("m", TOKENS).await;
    let c3 = h.ingest("m", TOKENS).await;
    assert_eq!(c3.tier, Tier::Hot);

    let mut settled = false;
    for _ in 0..100 {
        if !h.service.cache.stats().hot.over_capacity() {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(settled, "hot tier never returned within budget");
    assert_eq!(tier_of(&h, &c1.context_id), Tier::Warm);
    assert_eq!(h.service.cache.stats().hot.entries, 2);
}

#[tokio::test]
async fn test_admission_waits_for_leased_victim() {
    let h = harness(tight_config(TOKENS, 1, 4));
    h.load("m").await;
    let c1 = h.ingest("m", TOKENS).await;
    let lease = h
        .service
        .cache
        .acquire_for_query(&c1.context_id, "m")
        .await
        .unwrap();

    let service = h.service.clone();
    let pending = tokio::spawn(async move { service.ingest.ingest(ingest_request()).await });

    // The leased victim is not demoted while its query runs.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    assert_eq!(tier_of(&h, &c1.context_id), Tier::Hot);

    drop(lease);
    let c2 = pending.await.unwrap().unwrap().context;
    assert_eq!(c2.tier, Tier::Hot);
    assert_eq!(tier_of(&h, &c1.context_id), Tier::Warm);

    let stats = h.service.cache.stats();
    assert_eq!(stats.hot.entries, 1);
    assert_eq!(stats.hot.reserved, 0);
    assert_eq!(stats.device_bytes, TOKENS * BYTES_PER_TOKEN);
}

#[tokio::test]
async fn test_admission_waits_for_pinned_device_memory() {
    let h = harness(tight_config(TOKENS, 1, 4));
    h.load("m").await;
    let c1 = h.ingest("m", TOKENS).await;
    let lease = h
        .service
        .cache
        .acquire_for_query(&c1.context_id, "m")
        .await
        .unwrap();

    // Demoted, but its device buffers stay pinned by the running query.
    h.service.cache.demote(&c1.context_id, Tier::Warm).await.unwrap();
    let stats = h.service.cache.stats();
    assert_eq!(stats.hot.bytes, 0);
    assert_eq!(stats.device_bytes, TOKENS * BYTES_PER_TOKEN);

    let service = h.service.clone();
    let pending = tokio::spawn(async move { service.ingest.ingest(ingest_request()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    drop(lease);
    let c2 = pending.await.unwrap().unwrap().context;
    assert_eq!(tier_of(&h, &c2.context_id), Tier::Hot);
    assert_eq!(tier_of(&h, &c1.context_id), Tier::Warm);
}

#[tokio::test]
async fn test_admission_gives_up_while_victim_stays_leased() {
    let mut config = tight_config(TOKENS, 1, 4);
    config.eviction.lease_wait_ms = 50;
    let h = harness(config);
    h.load("m").await;
    let c1 = h.ingest("m", TOKENS).await;
    let _lease = h
        .service
        .cache
        .acquire_for_query(&c1.context_id, "m")
        .await
        .unwrap();

    let err = h.service.ingest.ingest(ingest_request()).await.unwrap_err();
    assert!(matches!(err, CoreError::CapacityExceeded { .. }), "got {err}");

    // Nothing was demoted for the failed admission.
    assert_eq!(tier_of(&h, &c1.context_id), Tier::Hot);
    let stats = h.service.cache.stats();
    assert_eq!(stats.hot.entries, 1);
    assert_eq!(stats.hot.reserved, 0);
    assert_eq!(stats.warm.entries, 0);
    assert_eq!(stats.device_bytes, TOKENS * BYTES_PER_TOKEN);
    assert_eq!(h.service.cache.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_queries_under_pressure_all_complete() {
    let h = harness(tight_config(TOKENS, 2, 2));
    h.load("m").await;
    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(h.ingest("m", TOKENS).await.context_id);
    }
    h.service.cache.flush().await;

    let mut tasks = Vec::new();
    for round in 0..4 {
        for id in &ids {
            let service = h.service.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(round * 5)).await;
                service.query.query(query(&id)).await
            }));
        }
    }

    let results = tokio::time::timeout(Duration::from_secs(20), async {
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        results
    })
    .await
    .expect("queries deadlocked");

    for result in &results {
        if let Err(e) = result {
            panic!("query failed under pressure: {e}");
        }
    }

    let stats = h.service.cache.stats();
    assert_eq!(stats.queries, 24);
    assert_eq!(stats.hot.entries + stats.warm.entries + stats.cold.entries, 6);
    assert!(stats.hot.bytes <= 2 * TOKENS * BYTES_PER_TOKEN);
    assert!(stats.device_bytes <= 2 * TOKENS * BYTES_PER_TOKEN);
    assert_eq!(stats.hot.reserved, 0);
    assert_eq!(stats.warm.reserved, 0);
}
