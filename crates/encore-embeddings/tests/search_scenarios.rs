//! Vector store search scenarios at realistic dimensions.

use encore_core::logging::capture_logs;
use encore_embeddings::VectorStore;
use encore_embeddings::normalize::l2_normalize;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

const DIM: usize = 384;

fn random_unit(rng: &mut StdRng, dim: usize) -> Vec<f32> {
    let mut v: Vec<f32> = (0..dim).map(|_| rng.random_range(-1.0f32..1.0)).collect();
    l2_normalize(&mut v);
    v
}

#[test]
fn duplicate_vector_ties_at_the_top() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut store = VectorStore::new();
    let vectors: Vec<Vec<f32>> = (0..100).map(|_| random_unit(&mut rng, DIM)).collect();
    for (i, v) in vectors.iter().enumerate() {
        store.upsert(format!("rec-{i}"), v.clone(), json!({ "i": i }));
    }
    let original = vectors[37].clone();
    store.upsert("copy", original.clone(), json!({ "copyOf": 37 }));

    let hits = store.search(&original, 3, f32::NEG_INFINITY);
    assert_eq!(hits.len(), 3);

    // equal scores keep insertion order, so the original precedes its copy
    let top_two: Vec<&str> = hits[..2].iter().map(|h| h.id.as_str()).collect();
    assert_eq!(top_two, vec!["rec-37", "copy"]);
    assert!((hits[0].score - 1.0).abs() <= 1e-5);
    assert!((hits[1].score - 1.0).abs() <= 1e-5);
    assert!(hits[2].score < hits[1].score);
}

#[test]
fn repeated_searches_are_identical() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut store = VectorStore::new();
    for i in 0..500 {
        store.upsert(format!("r{i}"), random_unit(&mut rng, DIM), json!(null));
    }
    let query = random_unit(&mut rng, DIM);
    let runs: Vec<_> = (0..3).map(|_| store.search(&query, 10, 0.0)).collect();
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[1], runs[2]);
    assert!(runs[0].windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn mismatched_record_is_omitted_with_one_warning() {
    let (logs, _guard) = capture_logs();
    let mut rng = StdRng::seed_from_u64(3);
    let mut store = VectorStore::new();
    for i in 0..10 {
        store.upsert(format!("full-{i}"), random_unit(&mut rng, DIM), json!(null));
    }
    store.upsert("short", random_unit(&mut rng, 128), json!(null));
    assert_eq!(store.len(), 11);

    let query = random_unit(&mut rng, DIM);
    let hits = store.search(&query, 100, f32::NEG_INFINITY);
    assert_eq!(hits.len(), 10);
    assert!(hits.iter().all(|h| h.id != "short"));

    let _ = store.search(&query, 100, f32::NEG_INFINITY);
    assert_eq!(logs.count_matching("dimension mismatch"), 1);
}
