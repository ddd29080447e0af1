use synopsis_harness::checkpoint::{
    CheckpointRecord, CheckpointStatus, CheckpointStore, MemoryCheckpointStore, RunResume,
    SqliteCheckpointStore,
};
use tempfile::tempdir;

fn done(node_id: &str, key: &str, summary: &str) -> CheckpointRecord {
    CheckpointRecord {
        node_id: node_id.to_string(),
        status: CheckpointStatus::Done,
        summary: Some(summary.to_string()),
        failure: None,
        cache_key: key.to_string(),
        partial: false,
        input_tokens: 12,
        output_tokens: 4,
        cost_nanodollars: 50,
    }
}

fn failed(node_id: &str, key: &str) -> CheckpointRecord {
    CheckpointRecord {
        node_id: node_id.to_string(),
        status: CheckpointStatus::Failed,
        summary: None,
        failure: Some("provider error".to_string()),
        cache_key: key.to_string(),
        partial: false,
        input_tokens: 0,
        output_tokens: 0,
        cost_nanodollars: 0,
    }
}

fn resumed(outcome: RunResume) -> std::collections::HashMap<String, CheckpointRecord> {
    match outcome {
        RunResume::Resumed(records) => records,
        other => panic!("expected resumed run, got {other:?}"),
    }
}

#[tokio::test]
async fn records_survive_reopen_and_resume() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("checkpoints.sqlite");
    {
        let store = SqliteCheckpointStore::new(&db_path).unwrap();
        let outcome = store.begin_run("run-1", "/repo", "fp", true).await.unwrap();
        assert_eq!(outcome, RunResume::Fresh);
        store
            .record("run-1", &done("unit:a.py::f#0", "k1", "Adds one."))
            .await
            .unwrap();
        store
            .record("run-1", &failed("unit:a.py::g#0", "k2"))
            .await
            .unwrap();
        store.flush().await.unwrap();
    }

    let store = SqliteCheckpointStore::new(&db_path).unwrap();
    let records = resumed(store.begin_run("run-1", "/repo", "fp", true).await.unwrap());
    assert_eq!(records.len(), 2);

    let f = &records["unit:a.py::f#0"];
    assert_eq!(f.summary.as_deref(), Some("Adds one."));
    assert_eq!(f.input_tokens, 12);
    assert!(f.is_reusable("k1"));
    assert!(!f.is_reusable("other-key"));

    let g = &records["unit:a.py::g#0"];
    assert_eq!(g.status, CheckpointStatus::Failed);
    assert!(!g.is_reusable("k2"));
}

#[tokio::test]
async fn changed_fingerprint_discards_records() {
    let dir = tempdir().unwrap();
    let store = SqliteCheckpointStore::new(dir.path().join("checkpoints.sqlite")).unwrap();
    store.begin_run("run-1", "/repo", "fp-a", true).await.unwrap();
    store
        .record("run-1", &done("file:a.py", "k", "File."))
        .await
        .unwrap();

    let outcome = store.begin_run("run-1", "/repo", "fp-b", true).await.unwrap();
    assert_eq!(
        outcome,
        RunResume::Mismatch {
            previous_fingerprint: "fp-a".to_string()
        }
    );

    let records = resumed(store.begin_run("run-1", "/repo", "fp-b", true).await.unwrap());
    assert!(records.is_empty());
}

#[tokio::test]
async fn resume_disabled_starts_fresh() {
    let dir = tempdir().unwrap();
    let store = SqliteCheckpointStore::new(dir.path().join("checkpoints.sqlite")).unwrap();
    store.begin_run("run-1", "/repo", "fp", true).await.unwrap();
    store
        .record("run-1", &done("file:a.py", "k", "File."))
        .await
        .unwrap();

    let outcome = store.begin_run("run-1", "/repo", "fp", false).await.unwrap();
    assert_eq!(outcome, RunResume::Fresh);
    let records = resumed(store.begin_run("run-1", "/repo", "fp", true).await.unwrap());
    assert!(records.is_empty());
}

#[tokio::test]
async fn done_record_is_not_overwritten_within_a_run() {
    let dir = tempdir().unwrap();
    let store = SqliteCheckpointStore::new(dir.path().join("checkpoints.sqlite")).unwrap();
    store.begin_run("run-1", "/repo", "fp", true).await.unwrap();

    store
        .record("run-1", &done("dir:src", "k", "first"))
        .await
        .unwrap();
    store
        .record("run-1", &done("dir:src", "k", "second"))
        .await
        .unwrap();
    store
        .record("run-1", &failed("dir:src", "k"))
        .await
        .unwrap();

    let records = resumed(store.begin_run("run-1", "/repo", "fp", true).await.unwrap());
    assert_eq!(records["dir:src"].summary.as_deref(), Some("first"));
    assert_eq!(records["dir:src"].status, CheckpointStatus::Done);
}

#[tokio::test]
async fn partial_and_failed_records_can_be_replaced() {
    let dir = tempdir().unwrap();
    let store = SqliteCheckpointStore::new(dir.path().join("checkpoints.sqlite")).unwrap();
    store.begin_run("run-1", "/repo", "fp", true).await.unwrap();

    let mut partial = done("file:a.py", "k-partial", "some parts");
    partial.partial = true;
    store.record("run-1", &partial).await.unwrap();
    store
        .record("run-1", &done("file:a.py", "k-whole", "all parts"))
        .await
        .unwrap();

    store
        .record("run-1", &failed("file:b.py", "k"))
        .await
        .unwrap();
    store
        .record("run-1", &done("file:b.py", "k", "recovered"))
        .await
        .unwrap();

    let records = resumed(store.begin_run("run-1", "/repo", "fp", true).await.unwrap());
    assert_eq!(records["file:a.py"].summary.as_deref(), Some("all parts"));
    assert!(!records["file:a.py"].partial);
    assert_eq!(records["file:b.py"].summary.as_deref(), Some("recovered"));
}

#[tokio::test]
async fn finish_run_closes_the_run() {
    let dir = tempdir().unwrap();
    let store = SqliteCheckpointStore::new(dir.path().join("checkpoints.sqlite")).unwrap();

    store.begin_run("clean", "/repo", "fp", true).await.unwrap();
    store
        .record("clean", &done("root", "k", "Overview."))
        .await
        .unwrap();
    store.finish_run("clean", false).await.unwrap();

    let info = store.run_info("clean").await.unwrap().unwrap();
    assert!(info.completed_at.is_some());
    assert!(store.latest_incomplete_run("/repo").await.unwrap().is_none());

    store.begin_run("dirty", "/repo", "fp", true).await.unwrap();
    store
        .record("dirty", &failed("unit:a.py::f#0", "k"))
        .await
        .unwrap();
    store.finish_run("dirty", true).await.unwrap();
    let records = resumed(store.begin_run("dirty", "/repo", "fp", true).await.unwrap());
    assert_eq!(records.len(), 1);

    let clean = resumed(store.begin_run("clean", "/repo", "fp", true).await.unwrap());
    assert!(clean.is_empty());

    assert!(store.finish_run("never-started", false).await.is_err());
}

#[tokio::test]
async fn latest_incomplete_run_is_scoped_to_the_repository() {
    let dir = tempdir().unwrap();
    let store = SqliteCheckpointStore::new(dir.path().join("checkpoints.sqlite")).unwrap();

    store.begin_run("older", "/repo", "fp", true).await.unwrap();
    store.begin_run("newer", "/repo", "fp", true).await.unwrap();
    store.begin_run("elsewhere", "/other", "fp", true).await.unwrap();

    let latest = store.latest_incomplete_run("/repo").await.unwrap().unwrap();
    assert_eq!(latest.run_id, "newer");
    assert_eq!(latest.fingerprint, "fp");

    store.finish_run("newer", false).await.unwrap();
    let latest = store.latest_incomplete_run("/repo").await.unwrap().unwrap();
    assert_eq!(latest.run_id, "older");

    assert!(store.latest_incomplete_run("/missing").await.unwrap().is_none());
}

#[tokio::test]
async fn memory_store_follows_the_same_rules() {
    let store = MemoryCheckpointStore::new();
    assert_eq!(
        store.begin_run("run-1", "/repo", "fp", true).await.unwrap(),
        RunResume::Fresh
    );
    store
        .record("run-1", &done("file:a.py", "k", "first"))
        .await
        .unwrap();
    store
        .record("run-1", &done("file:a.py", "k", "second"))
        .await
        .unwrap();
    assert_eq!(
        store.records("run-1")["file:a.py"].summary.as_deref(),
        Some("first")
    );

    let latest = store.latest_incomplete_run("/repo").await.unwrap().unwrap();
    assert_eq!(latest.run_id, "run-1");
    store.finish_run("run-1", false).await.unwrap();
    assert!(store.latest_incomplete_run("/repo").await.unwrap().is_none());
    assert!(store.records("run-1").is_empty());

    assert!(matches!(
        store.begin_run("run-1", "/repo", "changed", true).await.unwrap(),
        RunResume::Mismatch { .. }
    ));
}
