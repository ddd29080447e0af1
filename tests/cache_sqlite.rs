use synopsis_harness::cache::{CacheEntry, SqliteSummaryCache, SummaryCacheKey};
use synopsis_harness::caller::Tier;
use synopsis_harness::engine::Level;
use synopsis_harness::SummaryCache;
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct ExportRow {
    key_hash: String,
    level: u8,
    node_id: String,
    tier: String,
    model: String,
    template_slug: String,
    summary: String,
    input_tokens: u32,
    output_tokens: u32,
    cost_nanodollars: i64,
    hit_count: i64,
}

fn file_key(path: &str, children: &[&str]) -> SummaryCacheKey {
    let children: Vec<String> = children.iter().map(|c| c.to_string()).collect();
    SummaryCacheKey::new(
        Level::File,
        &format!("file:{path}"),
        "content-hash",
        &children,
        "file_v1",
        "template_hash",
        Tier::Fast,
        "openai/gpt-5-mini",
    )
}

fn entry(summary: &str) -> CacheEntry {
    CacheEntry {
        summary: summary.to_string(),
        tier: Tier::Fast,
        model: "openai/gpt-5-mini".to_string(),
        input_tokens: 10,
        output_tokens: 5,
        cost_nanodollars: 123,
        created_at: now(),
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn read_export(path: &std::path::Path) -> Vec<ExportRow> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn sqlite_cache_put_get_and_export_increments_hit_count() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteSummaryCache::new(&db_path).unwrap();
    let key = file_key("src/lib.rs", &["h1", "h2"]);

    assert!(cache.get(&key).await.unwrap().is_none());
    cache.put(&key, &entry("Parses the config.")).await.unwrap();

    let hit = cache.get(&key).await.unwrap().unwrap();
    assert_eq!(hit.summary, "Parses the config.");
    assert_eq!(hit.tier, Tier::Fast);
    assert_eq!(hit.input_tokens, 10);
    assert_eq!(hit.output_tokens, 5);
    assert_eq!(hit.cost_nanodollars, 123);
    let _ = cache.get(&key).await.unwrap().unwrap();

    let export_path = dir.path().join("export.jsonl");
    let written = cache.export_jsonl(&export_path).await.unwrap();
    assert_eq!(written, 1);

    let row = read_export(&export_path)
        .into_iter()
        .find(|r| r.key_hash == key.key_hash)
        .unwrap();
    assert_eq!(row.hit_count, 2);
    assert_eq!(row.level, 2);
    assert_eq!(row.node_id, "file:src/lib.rs");
    assert_eq!(row.tier, "fast");
    assert_eq!(row.model, "openai/gpt-5-mini");
    assert_eq!(row.template_slug, "file_v1");
    assert_eq!(row.summary, "Parses the config.");
    assert_eq!(row.input_tokens, 10);
    assert_eq!(row.output_tokens, 5);
    assert_eq!(row.cost_nanodollars, 123);
}

#[tokio::test]
async fn sqlite_cache_first_write_wins() {
    let dir = tempdir().unwrap();
    let cache = SqliteSummaryCache::new(dir.path().join("cache.sqlite")).unwrap();
    let key = file_key("src/lib.rs", &[]);

    cache.put(&key, &entry("first")).await.unwrap();
    cache.put(&key, &entry("second")).await.unwrap();

    assert_eq!(cache.get(&key).await.unwrap().unwrap().summary, "first");
    assert_eq!(cache.len().await.unwrap(), 1);
}

#[tokio::test]
async fn sqlite_cache_survives_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let key = file_key("src/main.rs", &["a"]);
    {
        let cache = SqliteSummaryCache::new(&db_path).unwrap();
        cache.put(&key, &entry("durable")).await.unwrap();
    }
    let reopened = SqliteSummaryCache::new(&db_path).unwrap();
    assert_eq!(reopened.get(&key).await.unwrap().unwrap().summary, "durable");
}

#[tokio::test]
async fn child_summary_changes_produce_a_new_key() {
    let dir = tempdir().unwrap();
    let cache = SqliteSummaryCache::new(dir.path().join("cache.sqlite")).unwrap();
    let before = file_key("src/lib.rs", &["h1", "h2"]);
    let after = file_key("src/lib.rs", &["h1", "failed:unit:src/lib.rs::b#0"]);
    assert_ne!(before.key_hash, after.key_hash);

    cache.put(&before, &entry("whole")).await.unwrap();
    assert!(cache.get(&after).await.unwrap().is_none());
}

#[tokio::test]
async fn sqlite_cache_prune_max_rows_keeps_most_recent() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteSummaryCache::new(&db_path).unwrap();

    let old_key = file_key("a.py", &[]);
    let new_key = file_key("b.py", &[]);
    cache.put(&old_key, &entry("old")).await.unwrap();
    cache.put(&new_key, &entry("new")).await.unwrap();

    // Make the "old" row deterministically older so prune ordering is stable.
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE summary_cache SET last_hit_at = 0 WHERE key_hash = ?1",
        rusqlite::params![old_key.key_hash],
    )
    .unwrap();

    let stats = cache.prune(None, Some(1)).await.unwrap();
    assert_eq!(stats.remaining, 1);
    assert_eq!(stats.deleted, 1);

    let export_path = dir.path().join("export.jsonl");
    cache.export_jsonl(&export_path).await.unwrap();
    let rows = read_export(&export_path);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key_hash, new_key.key_hash);
}

#[tokio::test]
async fn sqlite_cache_prune_by_age_drops_stale_rows() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteSummaryCache::new(&db_path).unwrap();

    let stale = file_key("stale.py", &[]);
    let fresh = file_key("fresh.py", &[]);
    cache.put(&stale, &entry("stale")).await.unwrap();
    cache.put(&fresh, &entry("fresh")).await.unwrap();

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE summary_cache SET last_hit_at = 0 WHERE key_hash = ?1",
        rusqlite::params![stale.key_hash],
    )
    .unwrap();

    let stats = cache.prune(Some(30), None).await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.remaining, 1);
    assert!(cache.get(&stale).await.unwrap().is_none());
    assert!(cache.get(&fresh).await.unwrap().is_some());
}

#[test]
fn sqlite_cache_lock_does_not_truncate_lockfile() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteSummaryCache::new(&db_path).unwrap();

    let mut lock_path = db_path.clone();
    lock_path.set_extension("lock");
    std::fs::write(&lock_path, "keep").unwrap();

    let lock = cache.lock_exclusive().unwrap();
    drop(lock);

    let contents = std::fs::read_to_string(&lock_path).unwrap();
    assert_eq!(contents, "keep");
}
