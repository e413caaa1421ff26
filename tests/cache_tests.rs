//! Integration tests for the tiered context cache.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{harness, test_config};
use vpid_kv_cache::cache::sweeper::spawn_ttl_sweeper;
use vpid_kv_cache::cache::{ContextFilter, Tier};
use vpid_kv_cache::metrics::Metrics;
use vpid_kv_cache::pipeline::{GenerationEvent, IngestRequest, QueryRequest};
use vpid_kv_cache::storage::StorageBackend;
use vpid_kv_cache::{CoreError, VpidService};

fn query(context_id: &str, model_id: Option<&str>) -> QueryRequest {
    QueryRequest {
        context_id: context_id.to_string(),
        query: "how many days of leave".to_string(),
        max_tokens: Some(16),
        model_id: model_id.map(str::to_string),
    }
}

#[tokio::test]
async fn test_cold_round_trip_is_bit_identical() {
    let h = harness(test_config());
    h.load("m").await;
    let ctx = h.ingest("m", 300).await;
    let cache = &h.service.cache;

    let before = cache.acquire_for_query(&ctx.context_id, "m").await.unwrap();
    let original = before.kv().clone();
    drop(before);
    let answer_hot = h.service.query.query(query(&ctx.context_id, Some("m"))).await.unwrap();

    let demoted = cache.demote(&ctx.context_id, Tier::Cold).await.unwrap();
    assert_eq!(demoted.tier, Tier::Cold);
    assert!(h.storage.contains(&ctx.context_id));

    let promoted = cache.promote(&ctx.context_id, Tier::Hot).await.unwrap();
    assert_eq!(promoted.tier, Tier::Hot);

    let after = cache.acquire_for_query(&ctx.context_id, "m").await.unwrap();
    assert!(after.cache_hit);
    assert_eq!(after.kv(), &original);
    assert_eq!(after.kv().digest(), original.digest());
    drop(after);

    let answer_restored = h.service.query.query(query(&ctx.context_id, Some("m"))).await.unwrap();
    assert_eq!(answer_hot.response, answer_restored.response);
}

#[tokio::test]
async fn test_warm_round_trip_keeps_payload() {
    let h = harness(test_config());
    h.load("m").await;
    let ctx = h.ingest("m", 64).await;
    let cache = &h.service.cache;

    let original = cache
        .acquire_for_query(&ctx.context_id, "m")
        .await
        .unwrap()
        .kv()
        .clone();

    assert_eq!(cache.demote(&ctx.context_id, Tier::Warm).await.unwrap().tier, Tier::Warm);
    assert_eq!(cache.stats().warm.entries, 1);
    assert_eq!(cache.stats().hot.entries, 0);

    let lease = cache.acquire_for_query(&ctx.context_id, "m").await.unwrap();
    assert!(!lease.cache_hit);
    assert_eq!(lease.kv(), &original);
}

#[tokio::test]
async fn test_double_promote_is_noop() {
    let h = harness(test_config());
    h.load("m").await;
    let ctx = h.ingest("m", 100).await;
    let cache = &h.service.cache;

    cache.demote(&ctx.context_id, Tier::Cold).await.unwrap();
    cache.promote(&ctx.context_id, Tier::Hot).await.unwrap();
    let stats = cache.stats();
    let info = cache.get(&ctx.context_id).unwrap();

    let again = cache.promote(&ctx.context_id, Tier::Hot).await.unwrap();
    assert_eq!(again.tier, Tier::Hot);
    assert_eq!(cache.stats(), stats);
    assert_eq!(cache.get(&ctx.context_id).unwrap().access_count, info.access_count);

    // Promoting "up" to a lower tier is also a no-op.
    let same = cache.promote(&ctx.context_id, Tier::Warm).await.unwrap();
    assert_eq!(same.tier, Tier::Hot);
    assert_eq!(cache.stats(), stats);
}

#[tokio::test]
async fn test_ttl_expiry_removes_everything() {
    let h = harness(test_config());
    h.load("m").await;
    h.service.scheduler.switch("m").unwrap();

    let ctx = h
        .service
        .ingest
        .ingest(IngestRequest {
            content: common::document(50),
            model_id: "m".into(),
            name: Some("short-lived".into()),
            ttl_seconds: Some(1),
            reuse_existing: false,
        })
        .await
        .unwrap()
        .context;
    let keep = h.ingest("m", 20).await;
    h.service.cache.flush().await;
    assert!(h.storage.contains(&ctx.context_id));

    let removed = h
        .service
        .cache
        .evict_expired_at(Utc::now() + chrono::Duration::seconds(2))
        .await;
    assert_eq!(removed, 1);

    assert!(matches!(
        h.service.cache.get(&ctx.context_id),
        Err(CoreError::ContextNotFound(_))
    ));
    let err = h.service.query.query(query(&ctx.context_id, None)).await.unwrap_err();
    assert!(matches!(err, CoreError::ContextNotFound(_)));
    assert!(!h.storage.contains(&ctx.context_id));

    assert!(h.service.cache.get(&keep.context_id).is_ok());
    assert_eq!(h.service.cache.stats().hot.entries, 1);
}

#[tokio::test]
async fn test_sweeper_evicts_expired_contexts() {
    let h = harness(test_config());
    h.load("m").await;
    let ctx = h
        .service
        .ingest
        .ingest(IngestRequest {
            content: common::document(10),
            model_id: "m".into(),
            name: None,
            ttl_seconds: Some(1),
            reuse_existing: false,
        })
        .await
        .unwrap()
        .context;

    let sweeper = spawn_ttl_sweeper(h.service.cache.clone(), Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(1600)).await;
    sweeper.shutdown().await;

    assert!(h.service.cache.get(&ctx.context_id).is_err());
    assert!(!h.storage.contains(&ctx.context_id));
}

#[tokio::test]
async fn test_queries_are_model_scoped() {
    let h = harness(test_config());
    h.load("a").await;
    h.load("b").await;
    let ctx = h.ingest("a", 40).await;

    let none_active = h.service.query.query(query(&ctx.context_id, None)).await.unwrap_err();
    assert!(matches!(none_active, CoreError::ModelNotLoaded(_)));

    h.service.scheduler.switch("b").unwrap();
    let mismatch = h.service.query.query(query(&ctx.context_id, None)).await.unwrap_err();
    assert!(matches!(mismatch, CoreError::ModelMismatch { .. }));

    let explicit = h
        .service
        .query
        .query(query(&ctx.context_id, Some("a")))
        .await
        .unwrap();
    assert_eq!(explicit.model_id, "a");
    assert!(explicit.cache_hit);

    // The mismatch did not count as a lookup.
    assert_eq!(h.service.cache.stats().queries, 1);
}

#[tokio::test]
async fn test_corrupt_blob_is_reported_and_entry_stays_cold() {
    let h = harness(test_config());
    h.load("m").await;
    let ctx = h.ingest("m", 80).await;
    let cache = &h.service.cache;

    cache.demote(&ctx.context_id, Tier::Cold).await.unwrap();
    assert!(h.storage.corrupt(&ctx.context_id));

    let err = cache.promote(&ctx.context_id, Tier::Hot).await.unwrap_err();
    assert!(err.is_corruption(), "unexpected error: {err}");
    assert_eq!(cache.get(&ctx.context_id).unwrap().tier, Tier::Cold);
    assert_eq!(cache.stats().hot.entries, 0);
    assert_eq!(cache.stats().cold.entries, 1);
}

#[tokio::test]
async fn test_failed_read_leaves_entry_cold_until_storage_recovers() {
    let h = harness(test_config());
    h.load("m").await;
    let ctx = h.ingest("m", 80).await;
    let cache = &h.service.cache;
    cache.demote(&ctx.context_id, Tier::Cold).await.unwrap();

    h.storage.set_fail_reads(true);
    let err = h
        .service
        .query
        .query(query(&ctx.context_id, Some("m")))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StorageFailure(_)));
    assert_eq!(cache.get(&ctx.context_id).unwrap().tier, Tier::Cold);

    h.storage.set_fail_reads(false);
    let ok = h
        .service
        .query
        .query(query(&ctx.context_id, Some("m")))
        .await
        .unwrap();
    assert!(!ok.cache_hit);
    assert_eq!(cache.get(&ctx.context_id).unwrap().tier, Tier::Hot);
}

#[tokio::test]
async fn test_failed_durable_write_blocks_demotion_to_cold() {
    let h = harness(test_config());
    h.load("m").await;
    h.storage.set_fail_writes(true);
    let ctx = h.ingest("m", 30).await;
    h.service.cache.flush().await;

    let err = h
        .service
        .cache
        .demote(&ctx.context_id, Tier::Cold)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StorageFailure(_)));
    assert_eq!(h.service.cache.get(&ctx.context_id).unwrap().tier, Tier::Hot);

    h.storage.set_fail_writes(false);
    let info = h
        .service
        .cache
        .demote(&ctx.context_id, Tier::Cold)
        .await
        .unwrap();
    assert_eq!(info.tier, Tier::Cold);
    assert!(h.storage.contains(&ctx.context_id));
}

#[tokio::test]
async fn test_delete_releases_tier_and_storage() {
    let h = harness(test_config());
    h.load("m").await;
    let ctx = h.ingest("m", 30).await;
    h.service.cache.flush().await;

    h.service.cache.delete(&ctx.context_id).await.unwrap();
    assert!(h.service.cache.is_empty());
    assert!(!h.storage.contains(&ctx.context_id));
    assert_eq!(h.service.cache.stats().hot.bytes, 0);
    assert_eq!(h.service.cache.device().used(), 0);

    let again = h.service.cache.delete(&ctx.context_id).await.unwrap_err();
    assert!(matches!(again, CoreError::ContextNotFound(_)));
}

#[tokio::test]
async fn test_delete_waits_for_pending_write() {
    let h = harness(test_config());
    h.load("m").await;
    h.storage.set_write_delay(Duration::from_millis(200));
    let ctx = h.ingest("m", 30).await;

    h.service.cache.delete(&ctx.context_id).await.unwrap();
    assert!(!h.storage.contains(&ctx.context_id));
}

#[tokio::test]
async fn test_list_filters_by_tier_and_model() {
    let h = harness(test_config());
    h.load("a").await;
    h.load("b").await;
    let a1 = h.ingest("a", 10).await;
    let _a2 = h.ingest("a", 11).await;
    let b1 = h.ingest("b", 12).await;
    h.service.cache.demote(&a1.context_id, Tier::Cold).await.unwrap();

    let all = h.service.cache.list(&ContextFilter::default());
    assert_eq!(all.len(), 3);

    let cold = h.service.cache.list(&ContextFilter {
        tier: Some(Tier::Cold),
        model_id: None,
    });
    assert_eq!(cold.len(), 1);
    assert_eq!(cold[0].context_id, a1.context_id);

    let only_b = h.service.cache.list(&ContextFilter {
        tier: None,
        model_id: Some("b".into()),
    });
    assert_eq!(only_b.len(), 1);
    assert_eq!(only_b[0].context_id, b1.context_id);
}

#[tokio::test]
async fn test_restore_registers_valid_blobs_as_cold() {
    let h = harness(test_config());
    h.load("m").await;
    let good = h.ingest("m", 40).await;
    let bad = h.ingest("m", 41).await;
    h.service.cache.flush().await;
    assert!(h.storage.corrupt(&bad.context_id));

    // A fresh process over the same storage.
    let restarted = Arc::new(VpidService::new(
        test_config(),
        h.engine.clone(),
        h.storage.clone(),
        Arc::new(Metrics::new().unwrap()),
    ));
    let restored = restarted.restore().await.unwrap();
    assert_eq!(restored, 1);

    let info = restarted.cache.get(&good.context_id).unwrap();
    assert_eq!(info.tier, Tier::Cold);
    assert_eq!(info.token_count, 40);
    assert!(restarted.cache.get(&bad.context_id).is_err());

    restarted
        .registry
        .load(
            "m",
            vpid_kv_cache::engine::ModelSource {
                file_path: h.dir.path().join("m.gguf"),
                model_type: Default::default(),
            },
        )
        .await
        .unwrap();
    let first = restarted.query.query(query(&good.context_id, Some("m"))).await.unwrap();
    let second = restarted.query.query(query(&good.context_id, Some("m"))).await.unwrap();
    assert!(!first.cache_hit);
    assert!(second.cache_hit);
}

#[tokio::test]
async fn test_reuse_existing_returns_prior_context() {
    let h = harness(test_config());
    h.load("m").await;
    let first = h.ingest_text("m", "the leave policy document").await;

    let again = h
        .service
        .ingest
        .ingest(IngestRequest {
            content: "the leave policy document".into(),
            model_id: "m".into(),
            name: None,
            ttl_seconds: None,
            reuse_existing: true,
        })
        .await
        .unwrap();
    assert!(again.reused);
    assert_eq!(again.context.context_id, first.context_id);
    assert_eq!(h.service.cache.len(), 1);
}

#[tokio::test]
async fn test_ingest_validation() {
    let h = harness(test_config());
    h.load("m").await;

    let empty = h
        .service
        .ingest
        .ingest(IngestRequest {
            content: "   ".into(),
            model_id: "m".into(),
            name: None,
            ttl_seconds: None,
            reuse_existing: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(empty, CoreError::InvalidRequest(_)));

    let unknown = h
        .service
        .ingest
        .ingest(IngestRequest {
            content: "text".into(),
            model_id: "nope".into(),
            name: None,
            ttl_seconds: None,
            reuse_existing: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(unknown, CoreError::ModelNotLoaded(_)));
}

#[tokio::test]
async fn test_cold_tier_counts_stored_blob_size() {
    let h = harness(test_config());
    h.load("m").await;
    let ctx = h.ingest("m", 200).await;
    h.service.cache.demote(&ctx.context_id, Tier::Cold).await.unwrap();

    let stored: usize = h
        .storage
        .list()
        .await
        .unwrap()
        .iter()
        .map(|sref| sref.stored_bytes as usize)
        .sum();
    let stats = h.service.cache.stats();
    assert_eq!(stats.cold.entries, 1);
    assert_eq!(stats.cold.bytes, stored);
    assert_eq!(stats.hot.bytes, 0);
    // The catalog still reports the KV size.
    assert_eq!(h.service.cache.get(&ctx.context_id).unwrap().size_bytes, ctx.size_bytes);

    h.service.cache.promote(&ctx.context_id, Tier::Warm).await.unwrap();
    let stats = h.service.cache.stats();
    assert_eq!(stats.cold.bytes, 0);
    assert_eq!(stats.warm.bytes, ctx.size_bytes);
}

#[tokio::test]
async fn test_cancelled_demote_leaves_entry_unchanged() {
    let h = harness(test_config());
    h.load("m").await;
    h.storage.set_write_delay(Duration::from_millis(300));
    let ctx = h.ingest("m", 50).await;
    let cache = &h.service.cache;

    // Demotion waits on the pending durable write and is cut short.
    let cut = tokio::time::timeout(
        Duration::from_millis(30),
        cache.demote(&ctx.context_id, Tier::Cold),
    )
    .await;
    assert!(cut.is_err());

    assert_eq!(cache.get(&ctx.context_id).unwrap().tier, Tier::Hot);
    let stats = cache.stats();
    assert_eq!(stats.hot.entries, 1);
    assert_eq!(stats.cold.entries, 0);
    assert_eq!(stats.hot.reserved, 0);
    assert_eq!(stats.warm.reserved, 0);

    let info = cache.demote(&ctx.context_id, Tier::Cold).await.unwrap();
    assert_eq!(info.tier, Tier::Cold);
    assert!(h.storage.contains(&ctx.context_id));
    assert_eq!(cache.device().used(), 0);
}

#[tokio::test]
async fn test_cancelled_promotion_leaves_entry_cold() {
    let h = harness(test_config());
    h.load("m").await;
    let ctx = h.ingest("m", 50).await;
    let cache = &h.service.cache;
    cache.demote(&ctx.context_id, Tier::Cold).await.unwrap();

    h.storage.set_read_delay(Duration::from_millis(300));
    let cut = tokio::time::timeout(
        Duration::from_millis(30),
        h.service.query.query(query(&ctx.context_id, Some("m"))),
    )
    .await;
    assert!(cut.is_err());

    assert_eq!(cache.get(&ctx.context_id).unwrap().tier, Tier::Cold);
    let stats = cache.stats();
    assert_eq!(stats.hot.entries, 0);
    assert_eq!(stats.hot.reserved, 0);
    assert_eq!(stats.cold.entries, 1);
    assert_eq!(cache.device().used(), 0);

    h.storage.set_read_delay(Duration::ZERO);
    let answer = h.service.query.query(query(&ctx.context_id, Some("m"))).await.unwrap();
    assert!(!answer.cache_hit);
    assert_eq!(cache.get(&ctx.context_id).unwrap().tier, Tier::Hot);
}

#[tokio::test]
async fn test_streaming_query_emits_tokens_then_done() {
    let h = harness(test_config());
    h.load("m").await;
    let ctx = h.ingest("m", 120).await;
    h.service.cache.demote(&ctx.context_id, Tier::Warm).await.unwrap();

    let mut stream = h
        .service
        .query
        .stream(query(&ctx.context_id, Some("m")))
        .await
        .unwrap();
    assert!(!stream.cache_hit);
    assert_eq!(stream.model_id, "m");

    let mut tokens = 0;
    let mut done = None;
    while let Some(event) = stream.events.recv().await {
        match event {
            GenerationEvent::Token { text, .. } => {
                assert!(!text.is_empty());
                tokens += 1;
            }
            GenerationEvent::Done {
                prompt_tokens,
                completion_tokens,
                ..
            } => done = Some((prompt_tokens, completion_tokens)),
            GenerationEvent::Error(e) => panic!("stream failed: {e}"),
        }
    }
    let (prompt_tokens, completion_tokens) = done.expect("no done event");
    assert_eq!(completion_tokens, tokens);

    // Same context and query without streaming generate the same amount.
    let answer = h.service.query.query(query(&ctx.context_id, Some("m"))).await.unwrap();
    assert!(answer.cache_hit);
    assert_eq!(answer.usage.query_tokens, prompt_tokens);
    assert_eq!(answer.usage.generated_tokens, completion_tokens);

    let stats = h.service.cache.stats();
    assert_eq!(stats.queries, 2);
    assert_eq!(stats.device_bytes, ctx.size_bytes);
}

#[tokio::test]
async fn test_streaming_query_reports_lookup_errors_directly() {
    let h = harness(test_config());
    h.load("m").await;
    let err = h
        .service
        .query
        .stream(query("ctx_missing", Some("m")))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ContextNotFound(_)));
}

#[tokio::test]
async fn test_failed_upload_at_ingest_is_a_compute_failure() {
    let h = harness(test_config());
    h.load("m").await;
    h.service.cache.device().set_fail_uploads(true);

    let err = h
        .service
        .ingest
        .ingest(IngestRequest {
            content: common::document(40),
            model_id: "m".into(),
            name: None,
            ttl_seconds: None,
            reuse_existing: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ComputeFailure(_)), "{err:?}");

    let cache = &h.service.cache;
    assert!(cache.is_empty());
    assert_eq!(cache.stats().hot.reserved, 0);
    assert_eq!(cache.device().used(), 0);

    cache.device().set_fail_uploads(false);
    h.ingest("m", 40).await;
    assert_eq!(cache.stats().hot.entries, 1);
}
