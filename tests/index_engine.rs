//! Index engine end to end: ingest a registered source with the stub
//! embedder, then query it through the planner.

mod common;

use common::{register_source, test_app, wait_idle, wait_indexed};
use opensrc::query::{self, SemanticOutcome, SemanticParams};

const TS_FILE: &str = r#"export function parseConfig(input: string) {
    return JSON.parse(input);
}

export const validateConfig = (value: unknown): boolean => {
    return value != null;
};
"#;

const MD_FILE: &str = "# Demo\n\nA demo package for configuration parsing and validation tooling.\n";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ingest_then_semantic_search() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = test_app(tmp.path());
    register_source(&app, "demo", &[("src/config.ts", TS_FILE), ("README.md", MD_FILE)]);

    app.engine.enqueue("demo").await.unwrap();
    assert!(wait_indexed(&app, "demo").await, "indexing never finished");
    wait_idle(&app).await;

    // Querying with a chunk's exact content must rank that chunk first
    // under the deterministic stub embedder.
    let lines: Vec<&str> = TS_FILE.split('\n').collect();
    let chunk_content = lines[0..3].join("\n");

    let outcome = query::semantic_search(
        &app.store,
        &app.engine,
        &app.embedder,
        &app.config,
        &chunk_content,
        &SemanticParams {
            sources: Some(vec!["demo".to_string()]),
            top_k: Some(5),
        },
    )
    .await
    .unwrap();

    let SemanticOutcome::Results(results) = outcome else {
        panic!("expected results");
    };
    assert!(!results.is_empty());
    assert_eq!(results[0].identifier, "parseConfig");
    assert_eq!(results[0].source, "demo");
    assert!(results[0].score > 0.99);
    // Scores descend with rank.
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunk_rows_match_file_slices() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = test_app(tmp.path());
    register_source(&app, "demo", &[("src/config.ts", TS_FILE)]);

    app.engine.enqueue("demo").await.unwrap();
    assert!(wait_indexed(&app, "demo").await);
    wait_idle(&app).await;

    let outcome = query::semantic_search(
        &app.store,
        &app.engine,
        &app.embedder,
        &app.config,
        "anything",
        &SemanticParams::default(),
    )
    .await
    .unwrap();
    let SemanticOutcome::Results(results) = outcome else {
        panic!("expected results");
    };

    // Every returned chunk's content is the exact slice of the file it
    // names.
    let root = app.registry.resolve("demo").unwrap();
    for r in &results {
        let content = std::fs::read_to_string(root.join(&r.file)).unwrap();
        let lines: Vec<&str> = content.split('\n').collect();
        assert_eq!(r.content, lines[r.start_line - 1..r.end_line].join("\n"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enqueue_is_idempotent() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = test_app(tmp.path());
    register_source(&app, "demo", &[("src/config.ts", TS_FILE)]);

    for _ in 0..5 {
        app.engine.enqueue("demo").await.unwrap();
    }
    assert!(wait_indexed(&app, "demo").await);
    wait_idle(&app).await;

    let total = app.store.count_chunks().await.unwrap();

    // Re-enqueueing an indexed source is a no-op: no duplicate rows.
    app.engine.enqueue("demo").await.unwrap();
    wait_idle(&app).await;
    assert_eq!(app.store.count_chunks().await.unwrap(), total);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_source_still_checkpoints() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = test_app(tmp.path());
    register_source(&app, "empty", &[]);

    app.engine.enqueue("empty").await.unwrap();
    assert!(wait_indexed(&app, "empty").await);
    assert_eq!(app.store.count_chunks().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_run_leaves_source_unindexed() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = test_app(tmp.path());

    // Never registered: the run fails at source resolution.
    app.engine.enqueue("ghost").await.unwrap();
    wait_idle(&app).await;

    assert!(!app.store.is_indexed("ghost").await.unwrap());
    assert!(app.engine.pending_state("ghost").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn search_states_before_and_during_indexing() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = test_app(tmp.path());

    // Empty store, nothing pending.
    let outcome = query::semantic_search(
        &app.store,
        &app.engine,
        &app.embedder,
        &app.config,
        "anything",
        &SemanticParams::default(),
    )
    .await
    .unwrap();
    match outcome {
        SemanticOutcome::NotReady { error, sources } => {
            assert_eq!(error, "not_indexed");
            assert!(sources.is_empty());
        }
        SemanticOutcome::Results(_) => panic!("expected not_indexed"),
    }

    // A pending source reports "indexing" when asked for by name.
    register_source(&app, "demo", &[("src/config.ts", TS_FILE)]);
    app.engine.enqueue("demo").await.unwrap();

    let params = SemanticParams {
        sources: Some(vec!["demo".to_string()]),
        top_k: None,
    };
    let outcome = query::semantic_search(
        &app.store,
        &app.engine,
        &app.embedder,
        &app.config,
        "anything",
        &params,
    )
    .await
    .unwrap();
    match outcome {
        SemanticOutcome::NotReady { error, sources } => {
            assert_eq!(error, "indexing");
            assert_eq!(sources, vec!["demo".to_string()]);
        }
        // The tiny fixture can finish before the first probe on a busy
        // runner; completed is also a legal observation.
        SemanticOutcome::Results(_) => {}
    }

    assert!(wait_indexed(&app, "demo").await);
    wait_idle(&app).await;

    // After the checkpoint, the same call returns results.
    let outcome = query::semantic_search(
        &app.store,
        &app.engine,
        &app.embedder,
        &app.config,
        "parse configuration",
        &params,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, SemanticOutcome::Results(_)));

    // An unknown source is not_indexed, not an empty list.
    let outcome = query::semantic_search(
        &app.store,
        &app.engine,
        &app.embedder,
        &app.config,
        "anything",
        &SemanticParams {
            sources: Some(vec!["unknown".to_string()]),
            top_k: None,
        },
    )
    .await
    .unwrap();
    match outcome {
        SemanticOutcome::NotReady { error, sources } => {
            assert_eq!(error, "not_indexed");
            assert_eq!(sources, vec!["unknown".to_string()]);
        }
        SemanticOutcome::Results(_) => panic!("expected not_indexed"),
    }
}
