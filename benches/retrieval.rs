/// Brute-force nearest-neighbor ranking over 10k item embeddings.
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use recsys_worker::feature_store::SimilarityMetric;
use recsys_worker::feature_store::index::top_k;

const DIM: usize = 64;

fn synthetic_embeddings(count: usize) -> Vec<(i64, Vec<f32>)> {
    (0..count)
        .map(|id| {
            let vector = (0..DIM)
                .map(|d| ((id * 31 + d * 17) % 97) as f32 / 97.0)
                .collect();
            (id as i64, vector)
        })
        .collect()
}

fn bench_top_k(c: &mut Criterion) {
    let items = synthetic_embeddings(10_000);
    let candidates: Vec<(i64, &[f32])> = items.iter().map(|(id, v)| (*id, v.as_slice())).collect();
    let query = vec![0.5_f32; DIM];

    for metric in [SimilarityMetric::L2, SimilarityMetric::Cosine] {
        c.bench_function(&format!("top_64_of_10k_{metric:?}"), |b| {
            b.iter(|| {
                let hits = top_k(metric, black_box(&query), &candidates, 64);
                black_box(hits.len());
            });
        });
    }
}

criterion_group!(benches, bench_top_k);
criterion_main!(benches);
