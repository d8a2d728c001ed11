//! Vector store behavior: batch inserts, quantized scan ordering, source
//! filtering, deletes, and the indexed-sources checkpoint.

use opensrc::models::{ChunkKind, CodeChunk};
use opensrc::store::{StoreError, VectorStore, EMBEDDING_DIM};

fn chunk(file: &str, identifier: &str, content: &str) -> CodeChunk {
    CodeChunk {
        file: file.to_string(),
        identifier: identifier.to_string(),
        kind: ChunkKind::Function,
        start_line: 1,
        end_line: 3,
        content: content.to_string(),
        parent: None,
    }
}

/// A unit vector along one axis, nudged so binary quantization has sign
/// structure in every component.
fn axis_vector(axis: usize) -> Vec<f32> {
    let mut v = vec![-0.001f32; EMBEDDING_DIM];
    v[axis] = 1.0;
    opensrc::embedder::normalize(&mut v);
    v
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scan_orders_by_cosine_distance() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = VectorStore::open(tmp.path()).unwrap();

    store
        .insert_batch(
            "demo",
            vec![
                chunk("a.ts", "far", "far away"),
                chunk("b.ts", "near", "nearby"),
                chunk("c.ts", "exact", "exact hit"),
            ],
            vec![axis_vector(5), axis_vector(1), axis_vector(0)],
        )
        .await
        .unwrap();
    store.finalize().await.unwrap();

    // Query leaning toward axis 0, with a trace of axis 1.
    let mut query = vec![-0.001f32; EMBEDDING_DIM];
    query[0] = 1.0;
    query[1] = 0.3;
    opensrc::embedder::normalize(&mut query);

    let results = store.scan(query, 3, None).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].0.identifier, "exact");
    assert_eq!(results[1].0.identifier, "near");
    assert_eq!(results[2].0.identifier, "far");
    // Ascending distance.
    assert!(results[0].1 <= results[1].1);
    assert!(results[1].1 <= results[2].1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scan_applies_source_filter() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = VectorStore::open(tmp.path()).unwrap();

    store
        .insert_batch("alpha", vec![chunk("a.ts", "a", "alpha")], vec![axis_vector(0)])
        .await
        .unwrap();
    store
        .insert_batch("beta", vec![chunk("b.ts", "b", "beta")], vec![axis_vector(0)])
        .await
        .unwrap();
    store.finalize().await.unwrap();

    let results = store
        .scan(axis_vector(0), 10, Some(vec!["beta".to_string()]))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0.source, "beta");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_store_scans_empty() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = VectorStore::open(tmp.path()).unwrap();
    let results = store.scan(axis_vector(0), 5, None).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_source_drops_rows_but_index_stays_usable() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = VectorStore::open(tmp.path()).unwrap();

    store
        .insert_batch("gone", vec![chunk("g.ts", "g", "gone")], vec![axis_vector(2)])
        .await
        .unwrap();
    store
        .insert_batch("kept", vec![chunk("k.ts", "k", "kept")], vec![axis_vector(0)])
        .await
        .unwrap();
    store.finalize().await.unwrap();
    store.mark_indexed("gone").await.unwrap();

    let deleted = store.delete_source("gone").await.unwrap();
    assert_eq!(deleted, 1);
    assert!(!store.is_indexed("gone").await.unwrap());

    // The quantized index still holds a stale id for "gone"; the scan
    // join must drop it and serve only live rows.
    let results = store.scan(axis_vector(0), 10, None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0.source, "kept");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn insert_rejects_mismatched_lengths_and_dims() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = VectorStore::open(tmp.path()).unwrap();

    let err = store
        .insert_batch("x", vec![chunk("a.ts", "a", "a")], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::CountMismatch { .. }));

    let err = store
        .insert_batch("x", vec![chunk("a.ts", "a", "a")], vec![vec![0.5f32; 3]])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DimensionMismatch { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn indexed_sources_roundtrip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = VectorStore::open(tmp.path()).unwrap();

    assert!(!store.is_indexed("zod").await.unwrap());
    store.mark_indexed("zod").await.unwrap();
    store.mark_indexed("react").await.unwrap();
    assert!(store.is_indexed("zod").await.unwrap());
    assert_eq!(
        store.list_indexed().await.unwrap(),
        vec!["react".to_string(), "zod".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reopen_preloads_quantized_index() {
    let tmp = tempfile::TempDir::new().unwrap();
    {
        let store = VectorStore::open(tmp.path()).unwrap();
        store
            .insert_batch("demo", vec![chunk("a.ts", "a", "hello")], vec![axis_vector(0)])
            .await
            .unwrap();
        // Process dies before finalize: the reopen must rebuild.
    }

    let store = VectorStore::open(tmp.path()).unwrap();
    let results = store.scan(axis_vector(0), 5, None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0.identifier, "a");
}
