//! Performance benchmarks for pool queries and ignore list evaluation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use parlor_state::config::{AppConfig, IgnoreListConfig, PROPOSED_LIST};
use parlor_state::metrics::MetricsCollector;
use parlor_state::store::MemoryStore;
use parlor_state::utils::{timestamp_score, SystemClock};
use parlor_state::visibility::ExclusionWindow;
use parlor_state::{PoolFilter, RequestCoordinator};
use serde_json::json;
use std::sync::Arc;

fn create_bench_system() -> RequestCoordinator {
    let mut config = AppConfig::default();
    config.store.pool_size = 32;
    config.store.page_size = 100;
    RequestCoordinator::new(
        Arc::new(MemoryStore::new(config.store.pool_size)),
        &config,
        Arc::new(SystemClock),
        Arc::new(MetricsCollector::new().unwrap()),
    )
}

async fn populate(coordinator: &RequestCoordinator, players: usize) {
    for i in 0..players {
        let region = if i % 3 == 0 { "eu-west1" } else { "us-east1" };
        let properties = json!({
            "region": region,
            "mode": "ranked",
            "mmr": { "rating": 1000.0 + (i % 1000) as f64 }
        });
        coordinator
            .submit_request(&format!("player_{}", i), properties)
            .await
            .unwrap();
    }
    // Hide every tenth player
    let proposed: Vec<String> = (0..players)
        .step_by(10)
        .map(|i| format!("player_{}", i))
        .collect();
    coordinator.propose(&proposed).await.unwrap();
}

fn bench_exclusion_window(c: &mut Criterion) {
    let window = ExclusionWindow::for_list(&IgnoreListConfig::proposed());
    let now = chrono::Utc::now();
    let inserted = timestamp_score(now - chrono::Duration::seconds(400));
    let now = timestamp_score(now);

    c.bench_function("exclusion_window_hides", |b| {
        b.iter(|| black_box(window.hides(black_box(inserted), black_box(now))))
    });
}

fn bench_pool_query(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("pool_query");

    for players in [100usize, 1000] {
        let coordinator = create_bench_system();
        rt.block_on(populate(&coordinator, players));

        group.bench_with_input(
            BenchmarkId::new("tag_and_range", players),
            &coordinator,
            |b, coordinator| {
                b.to_async(&rt).iter(|| {
                    let coordinator = coordinator.clone();
                    async move {
                        let filter = PoolFilter::new()
                            .tag("region.eu-west1")
                            .range("mmr.rating", 1200.0, 1800.0)
                            .excluding(PROPOSED_LIST);
                        black_box(
                            coordinator
                                .query_pool(filter)
                                .unwrap()
                                .collect_all()
                                .await
                                .unwrap(),
                        )
                    }
                })
            },
        );
    }

    group.finish();
}

fn bench_submit_request(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let coordinator = create_bench_system();
    let mut counter = 0u64;

    c.bench_function("submit_request", |b| {
        b.to_async(&rt).iter(|| {
            counter += 1;
            let id = format!("bench_player_{}", counter);
            let coordinator = coordinator.clone();
            async move {
                black_box(
                    coordinator
                        .submit_request(&id, json!({"region": "eu-west1", "mode": "casual"}))
                        .await,
                )
            }
        })
    });
}

criterion_group!(
    benches,
    bench_exclusion_window,
    bench_pool_query,
    bench_submit_request
);
criterion_main!(benches);
