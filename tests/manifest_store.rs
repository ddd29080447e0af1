use std::collections::BTreeMap;

use synopsis_harness::engine::RunStats;
use synopsis_harness::hashing::{hash_bytes, hash_text};
use synopsis_harness::manifest::{
    canonical_repo_path, compute_repo_changes, diff, FileRecord, ManifestStore, RunManifest,
};
use tempfile::tempdir;

fn record(content_hash: &str, summary: &str) -> FileRecord {
    FileRecord {
        content_hash: content_hash.to_string(),
        summary_hash: hash_text(summary),
        summary: summary.to_string(),
        language: "python".to_string(),
        unit_count: 1,
        last_seen: "2026-03-01T00:00:00.000000Z".to_string(),
    }
}

fn manifest(repo: &str, run_id: &str, ts: &str, files: &[(&str, FileRecord)]) -> RunManifest {
    let files: BTreeMap<String, FileRecord> = files
        .iter()
        .map(|(p, r)| (p.to_string(), r.clone()))
        .collect();
    RunManifest {
        run_id: run_id.to_string(),
        repo_path: repo.to_string(),
        repo_url: None,
        timestamp: ts.to_string(),
        duration_secs: 2.5,
        total_files: files.len(),
        total_units: files.len(),
        api_cost_usd: 0.01,
        final_summary: format!("overview {run_id}"),
        stats: RunStats::default(),
        files,
    }
}

#[test]
fn save_then_load_round_trips() {
    let dir = tempdir().unwrap();
    let store = ManifestStore::new(dir.path().join("manifests")).unwrap();
    let original = manifest(
        "/work/project",
        "abc123",
        "2026-03-01T10:00:00.000000Z",
        &[("src/a.py", record("h1", "Does a."))],
    );

    let path = store.save(&original).unwrap();
    assert!(path.starts_with(store.dir()));
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("json"));
    assert!(!path.with_extension("json.tmp").exists());

    let loaded = store.load(&path).unwrap();
    assert_eq!(loaded, original);
}

#[test]
fn lookups_are_newest_first_and_scoped_to_the_repository() {
    let dir = tempdir().unwrap();
    let store = ManifestStore::new(dir.path()).unwrap();
    for (run_id, ts) in [
        ("run-a", "2026-03-01T10:00:00.000000Z"),
        ("run-c", "2026-03-03T10:00:00.000000Z"),
        ("run-b", "2026-03-02T10:00:00.000000Z"),
    ] {
        store.save(&manifest("/work/project", run_id, ts, &[])).unwrap();
    }
    store
        .save(&manifest("/work/other", "run-z", "2026-03-09T10:00:00.000000Z", &[]))
        .unwrap();

    let all: Vec<String> = store
        .find_all("/work/project", 10)
        .unwrap()
        .into_iter()
        .map(|m| m.run_id)
        .collect();
    assert_eq!(all, vec!["run-c", "run-b", "run-a"]);
    assert_eq!(store.find_all("/work/project", 1).unwrap().len(), 1);

    let latest = store.find_latest("/work/project", None).unwrap().unwrap();
    assert_eq!(latest.run_id, "run-c");
    let by_prefix = store.find_latest("/work/project", Some("run-a")).unwrap().unwrap();
    assert_eq!(by_prefix.run_id, "run-a");
    assert!(store.find_latest("/work/project", Some("nope")).unwrap().is_none());
    assert!(store.find_latest("/work/missing", None).unwrap().is_none());
}

#[test]
fn prune_keeps_the_newest_manifests() {
    let dir = tempdir().unwrap();
    let store = ManifestStore::new(dir.path()).unwrap();
    for i in 0..4 {
        store
            .save(&manifest(
                "/work/project",
                &format!("run-{i}"),
                &format!("2026-03-0{}T10:00:00.000000Z", i + 1),
                &[],
            ))
            .unwrap();
    }
    store
        .save(&manifest("/work/other", "keep-me", "2026-01-01T00:00:00.000000Z", &[]))
        .unwrap();

    let removed = store.prune("/work/project", 2).unwrap();
    assert_eq!(removed.len(), 2);
    assert!(removed.iter().all(|p| !p.exists()));

    let left: Vec<String> = store
        .find_all("/work/project", 10)
        .unwrap()
        .into_iter()
        .map(|m| m.run_id)
        .collect();
    assert_eq!(left, vec!["run-3", "run-2"]);
    assert_eq!(store.find_all("/work/other", 10).unwrap().len(), 1);
}

#[test]
fn unreadable_manifests_are_skipped() {
    let dir = tempdir().unwrap();
    let store = ManifestStore::new(dir.path()).unwrap();
    store
        .save(&manifest("/work/project", "good", "2026-03-01T10:00:00.000000Z", &[]))
        .unwrap();
    std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let all = store.find_all("/work/project", 10).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].run_id, "good");
}

#[test]
fn manifest_without_optional_fields_still_loads() {
    let dir = tempdir().unwrap();
    let store = ManifestStore::new(dir.path()).unwrap();
    let path = dir.path().join("legacy.json");
    std::fs::write(
        &path,
        r#"{
  "run_id": "legacy",
  "repo_path": "/work/project",
  "timestamp": "2026-02-01T00:00:00Z",
  "final_summary": "old overview",
  "files": {}
}"#,
    )
    .unwrap();

    let loaded = store.load(&path).unwrap();
    assert_eq!(loaded.run_id, "legacy");
    assert!(loaded.files.is_empty());
    assert_eq!(loaded.stats, RunStats::default());
}

#[test]
fn repo_changes_classify_the_working_tree() {
    let repo = tempdir().unwrap();
    std::fs::write(repo.path().join("same.py"), "def same():\n    pass\n").unwrap();
    std::fs::write(repo.path().join("edited.py"), "def edited():\n    return 2\n").unwrap();
    std::fs::write(repo.path().join("new.py"), "def new():\n    pass\n").unwrap();

    let previous = manifest(
        &canonical_repo_path(repo.path()),
        "prev",
        "2026-03-01T10:00:00.000000Z",
        &[
            ("same.py", record(&hash_bytes(b"def same():\n    pass\n"), "same")),
            ("edited.py", record(&hash_bytes(b"def edited():\n    return 1\n"), "edited")),
            ("gone.py", record("whatever", "gone")),
        ],
    );
    let paths = vec![
        "edited.py".to_string(),
        "new.py".to_string(),
        "same.py".to_string(),
    ];

    let changes = compute_repo_changes(repo.path(), &paths, &previous).unwrap();
    assert_eq!(changes.added, vec!["new.py"]);
    assert_eq!(changes.modified, vec!["edited.py"]);
    assert_eq!(changes.deleted, vec!["gone.py"]);
    assert_eq!(changes.unchanged, vec!["same.py"]);
    assert_eq!(changes.hashes.len(), 3);
    assert_eq!(
        changes.hashes["same.py"],
        hash_bytes(b"def same():\n    pass\n")
    );
}

#[test]
fn diff_between_stored_runs() {
    let old = manifest(
        "/work/project",
        "old",
        "2026-03-01T10:00:00.000000Z",
        &[("a.py", record("h1", "a")), ("b.py", record("h2", "b"))],
    );
    let new = manifest(
        "/work/project",
        "new",
        "2026-03-02T10:00:00.000000Z",
        &[("a.py", record("h1", "a")), ("c.py", record("h3", "c"))],
    );
    let changes = diff(&old, &new);
    assert_eq!(changes.added, vec!["c.py"]);
    assert_eq!(changes.deleted, vec!["b.py"]);
    assert_eq!(changes.unchanged, vec!["a.py"]);
    assert!(changes.modified.is_empty());
    assert!(!changes.is_empty());
    assert!(diff(&old, &old).is_empty());
}
