//! Benchmarks for model switching and the context cache.

use std::sync::Arc;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use half::f16;

use vpid_kv_cache::cache::entry::{CatalogRecord, ContextInfo};
use vpid_kv_cache::cache::evictor::select_victims;
use vpid_kv_cache::cache::Tier;
use vpid_kv_cache::config::EngineConfig;
use vpid_kv_cache::engine::kv::{KvShape, KvTensors};
use vpid_kv_cache::engine::stub::StubEngine;
use vpid_kv_cache::engine::{ModelSource, ModelType};
use vpid_kv_cache::metrics::Metrics;
use vpid_kv_cache::registry::descriptor::Residency;
use vpid_kv_cache::registry::scheduler::SwitchScheduler;
use vpid_kv_cache::registry::ModelRegistry;
use vpid_kv_cache::storage::codec::{BlobCodec, ContextRecord};

fn bench_model_switch(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let engine = StubEngine::new(EngineConfig {
        require_model_files: false,
        ..Default::default()
    });
    let registry = Arc::new(ModelRegistry::new(Arc::new(engine), Residency::Accelerator));
    runtime.block_on(async {
        for id in ["a", "b"] {
            registry
                .load(
                    id,
                    ModelSource {
                        file_path: format!("{id}.gguf").into(),
                        model_type: ModelType::TextLlm,
                    },
                )
                .await
                .unwrap();
        }
    });
    let scheduler = SwitchScheduler::new(registry, Arc::new(Metrics::new().unwrap()));

    let mut flip = false;
    c.bench_function("model_switch", |b| {
        b.iter(|| {
            flip = !flip;
            let target = if flip { "a" } else { "b" };
            black_box(scheduler.switch(target).unwrap());
        })
    });
}

fn bench_lru_selection(c: &mut Criterion) {
    let now = Utc::now();
    let records: Vec<CatalogRecord> = (0..10_000u64)
        .map(|i| CatalogRecord {
            info: ContextInfo {
                context_id: format!("ctx_{i:08}"),
                model_id: "m".into(),
                name: String::new(),
                token_count: 256,
                tier: if i % 4 == 0 { Tier::Warm } else { Tier::Hot },
                size_bytes: 256 * 512,
                created_at: now,
                last_accessed: now,
                access_count: 0,
                ttl_seconds: 0,
                content_hash: String::new(),
            },
            lru_tick: (i * 7919) % 10_000,
        })
        .collect();

    c.bench_function("lru_select_100_from_10k", |b| {
        b.iter(|| {
            let victims = select_victims(black_box(records.iter()), Tier::Hot, 100, &[]);
            black_box(victims);
        })
    });
}

fn bench_blob_codec(c: &mut Criterion) {
    let shape = KvShape {
        n_layers: 4,
        n_kv_heads: 2,
        head_dim: 16,
        seq_len: 2000,
    };
    let values: Vec<f16> = (0..shape.byte_len() / 2)
        .map(|i| f16::from_f32(((i % 2001) as f32 - 1000.0) / 1000.0))
        .collect();
    let kv = KvTensors::from_f16(shape, &values).unwrap();
    let record = ContextRecord {
        context_id: "ctx_bench".into(),
        model_id: "m".into(),
        name: "bench".into(),
        token_count: 2000,
        ttl_seconds: 0,
        created_at: Utc::now(),
        content_hash: String::new(),
    };

    for (label, codec) in [
        ("raw", BlobCodec::new(false, 0)),
        ("zstd3", BlobCodec::new(true, 3)),
    ] {
        let blob = codec.encode(&record, &kv).unwrap();
        c.bench_function(&format!("codec_encode_2k_tokens_{label}"), |b| {
            b.iter(|| black_box(codec.encode(&record, &kv).unwrap()))
        });
        c.bench_function(&format!("codec_decode_2k_tokens_{label}"), |b| {
            b.iter(|| black_box(codec.decode(&blob, "bench").unwrap()))
        });
    }
}

criterion_group!(benches, bench_model_switch, bench_lru_selection, bench_blob_codec);
criterion_main!(benches);
