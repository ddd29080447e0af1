use std::process::Command;

use tempfile::tempdir;

fn synopsis() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_synopsis"));
    cmd.env_remove("OPENROUTER_API_KEY");
    cmd
}

#[test]
fn manifests_list_on_empty_store_succeeds() {
    let repo = tempdir().unwrap();
    let store = tempdir().unwrap();

    let output = synopsis()
        .args(["manifests", "list", "--repo"])
        .arg(repo.path())
        .arg("--manifests")
        .arg(store.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn manifests_prune_rejects_keep_zero() {
    let repo = tempdir().unwrap();
    let store = tempdir().unwrap();

    let status = synopsis()
        .args(["manifests", "prune", "--keep", "0", "--repo"])
        .arg(repo.path())
        .arg("--manifests")
        .arg(store.path())
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn cache_prune_requires_a_limit() {
    let dir = tempdir().unwrap();
    let status = synopsis()
        .args(["cache", "prune", "--db"])
        .arg(dir.path().join("cache.sqlite"))
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn cache_export_of_empty_db_writes_nothing() {
    let dir = tempdir().unwrap();
    let out_path = dir.path().join("export.jsonl");

    let output = synopsis()
        .args(["cache", "export", "--db"])
        .arg(dir.path().join("cache.sqlite"))
        .arg("--out")
        .arg(&out_path)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("exported 0 rows"));
    assert_eq!(std::fs::read_to_string(&out_path).unwrap(), "");
}

#[test]
fn run_without_api_key_fails_before_any_work() {
    let repo = tempdir().unwrap();
    std::fs::write(repo.path().join("main.py"), "def main():\n    pass\n").unwrap();
    let store = tempdir().unwrap();

    let output = synopsis()
        .arg("run")
        .arg(repo.path())
        .arg("--cache")
        .arg(store.path().join("cache.sqlite"))
        .arg("--checkpoints")
        .arg(store.path().join("checkpoints.sqlite"))
        .arg("--manifests")
        .arg(store.path().join("manifests"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("OPENROUTER_API_KEY"));
    assert!(!store.path().join("manifests").exists());
}
