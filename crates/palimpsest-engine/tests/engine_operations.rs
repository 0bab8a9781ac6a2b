use std::collections::BTreeSet;
use std::path::Path;

use palimpsest_core::{
    ErrorKind, IndexStats, RecordStore, SearchFilters, SearchIndex, TagCount, TraceError, TraceId,
    TraceMetadata, CURRENT_SCHEMA_VERSION, LEGACY_SCHEMA_VERSION,
};
use palimpsest_engine::{api, EngineConfig, TraceEngine};
use palimpsest_store_fs::FileRecordStore;
use serde_json::{json, Value};

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("unexpected error: {err}"),
    }
}

fn must_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
    match result {
        Ok(value) => panic!("expected error, got {value:?}"),
        Err(err) => err,
    }
}

fn fixture_engine() -> (tempfile::TempDir, TraceEngine) {
    let dir = must(tempfile::tempdir());
    let engine = must(TraceEngine::open(EngineConfig::new(dir.path())));
    (dir, engine)
}

fn payload(problem: &str, domain: &str, success: bool, tags: &[&str]) -> Value {
    json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "problem_statement": problem,
        "outcome": "Resolved after investigation",
        "execution_steps": [
            {"step_number": 1, "action": "analyze", "content": "Collect measurements"},
            {"step_number": 2, "action": "implement", "content": "Apply the fix"}
        ],
        "context": {"tags": tags},
        "success": success,
        "domain": domain,
        "complexity": "moderate"
    })
}

fn pause() {
    std::thread::sleep(std::time::Duration::from_millis(20));
}

fn ids_of(traces: &[palimpsest_core::ExecutionTrace]) -> Vec<TraceId> {
    traces.iter().filter_map(|trace| trace.trace_id().cloned()).collect()
}

#[test]
fn created_trace_round_trips_through_get() {
    let (_dir, engine) = fixture_engine();
    let id = must(engine.create(&payload("Speed up the nightly build", "ci", true, &["Build", "cache"]), None));

    let trace = must(engine.get(&id));
    assert_eq!(trace.trace_id(), Some(&id));
    assert_eq!(trace.problem_statement, "Speed up the nightly build");
    assert_eq!(trace.schema_version, CURRENT_SCHEMA_VERSION);
    assert_eq!(
        trace.context.tags,
        BTreeSet::from(["build".to_string(), "cache".to_string()])
    );

    let mut resaved = trace.clone();
    must(engine.store().save(&mut resaved));
    assert_eq!(must(engine.get(&id)), trace);
}

#[test]
fn create_renumbers_steps_but_validate_rejects_gaps() {
    let (_dir, engine) = fixture_engine();
    let mut raw = payload("Steps supplied out of order", "tooling", true, &[]);
    raw["execution_steps"] = json!([
        {"step_number": 1, "action": "analyze", "content": "one"},
        {"step_number": 2, "action": "implement", "content": "two"},
        {"step_number": 4, "action": "test", "content": "three"}
    ]);

    let report = engine.validate(&raw);
    assert!(!report.valid);
    assert!(report.errors.iter().any(|issue| issue.contains("step_number")));

    let id = must(engine.create(&raw, None));
    let numbers: Vec<u32> = must(engine.get(&id))
        .execution_steps
        .iter()
        .map(|step| step.step_number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[test]
fn invalid_payload_is_rejected_before_any_write() {
    let (_dir, engine) = fixture_engine();
    let err = must_err(engine.create(&json!({"problem_statement": "short"}), None));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(must(engine.store().list(None)).is_empty());
    assert_eq!(must(engine.index().count()), 0);
}

#[test]
fn search_recall_and_recency_ordering() {
    let (_dir, engine) = fixture_engine();
    let frontend = must(engine.create(&payload("Frontend performance optimization", "frontend", true, &[]), None));
    pause();
    let backend = must(engine.create(&payload("Backend API response time improvement", "backend", true, &[]), None));
    pause();
    let filler = must(engine.create(&payload("Quarterly dependency upgrade chores", "ops", true, &[]), None));
    let none = SearchFilters::default();

    assert_eq!(ids_of(&must(engine.search("frontend", &none, None))), vec![frontend.clone()]);
    assert_eq!(ids_of(&must(engine.search("backend", &none, None))), vec![backend.clone()]);
    assert_eq!(
        ids_of(&must(engine.search("", &none, None))),
        vec![filler, backend, frontend]
    );
}

#[test]
fn filters_combine_with_and() {
    let (_dir, engine) = fixture_engine();
    let passing = must(engine.create(&payload("Python packaging migration", "python", true, &[]), None));
    must(engine.create(&payload("Python packaging regression", "python", false, &[]), None));

    let filters = must(SearchFilters::from_value(&json!({"domain": "python", "success": true})));
    assert_eq!(ids_of(&must(engine.search("", &filters, None))), vec![passing.clone()]);

    let rows = must(engine.search_metadata("packaging", &filters, Some(5)));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].trace_id, passing);
}

#[test]
fn deletion_removes_record_and_index_entry() {
    let (_dir, engine) = fixture_engine();
    let id = must(engine.create(&payload("Delete me after review", "misc", true, &["temp"]), None));
    must(engine.delete(&id));

    assert_eq!(must_err(engine.get(&id)).kind(), ErrorKind::NotFound);
    assert!(must(engine.search("delete", &SearchFilters::default(), None)).is_empty());
    assert!(must(engine.index().get_metadata(&id)).is_none());
    assert_eq!(must_err(engine.delete(&id)).kind(), ErrorKind::NotFound);
}

#[test]
fn search_skips_ids_whose_record_vanished() {
    let (_dir, engine) = fixture_engine();
    let kept = must(engine.create(&payload("Cache warming strategy", "infra", true, &[]), None));
    let lost = must(engine.create(&payload("Cache eviction strategy", "infra", true, &[]), None));
    assert!(must(engine.store().delete(&lost)));

    let found = ids_of(&must(engine.search("cache", &SearchFilters::default(), None)));
    assert_eq!(found, vec![kept]);
}

#[test]
fn legacy_record_on_disk_is_migrated_on_read() {
    let (_dir, engine) = fixture_engine();
    let id = must(TraceId::parse("legacy-trace"));
    let legacy = json!({
        "problem_statement": "Legacy trace from before versioning",
        "outcome": "Still readable",
        "execution_steps": [{"step_number": 1, "action": "debug", "content": "Old format"}]
    });
    must(std::fs::write(
        engine.config().traces_dir().join("legacy-trace.json"),
        legacy.to_string(),
    ));

    let trace = must(engine.get(&id));
    assert_eq!(trace.schema_version, CURRENT_SCHEMA_VERSION);
    assert_eq!(trace.trace_id(), Some(&id));
    let environment = trace.context.environment.unwrap_or_default();
    assert_eq!(environment.get("migrated_from"), Some(&json!(LEGACY_SCHEMA_VERSION)));
}

#[test]
fn legacy_payload_gets_real_id_on_create() {
    let (_dir, engine) = fixture_engine();
    let legacy = json!({
        "problem_statement": "Legacy payload handed to create",
        "outcome": "Stored with fresh id",
        "execution_steps": [{"step_number": 1, "action": "analyze", "content": "Import"}]
    });
    let id = must(engine.create(&legacy, None));
    assert!(!id.is_placeholder());
    let trace = must(engine.get(&id));
    let environment = trace.context.environment.unwrap_or_default();
    assert_eq!(environment.get("migrated_from"), Some(&json!(LEGACY_SCHEMA_VERSION)));
}

#[test]
fn rebuild_restores_equivalence_with_store() {
    let (dir, engine) = fixture_engine();
    for n in 0..4 {
        must(engine.create(&payload(&format!("Rebuild candidate number {n}"), "ops", true, &["rebuild"]), None));
    }
    must(std::fs::write(
        engine.config().traces_dir().join("corrupt.json"),
        "{ definitely not json",
    ));

    let conn = must(rusqlite::Connection::open(engine.config().index_path()));
    must(conn.execute_batch(
        "DELETE FROM traces WHERE row_id = (SELECT MIN(row_id) FROM traces);
         INSERT INTO traces(trace_id, problem_statement, outcome, success, timestamp, timestamp_ns, tags, execution_steps_count)
         VALUES ('ghost', 'Ghost row left behind', 'none', 1, '2025-01-01T00:00:00Z', 0, '[]', 0);",
    ));
    drop(conn);

    assert_eq!(must(engine.rebuild_index()), 4);

    let listed: BTreeSet<TraceId> = must(engine.store().list(None))
        .into_iter()
        .filter(|id| id.as_str() != "corrupt")
        .collect();
    let searched: BTreeSet<TraceId> = must(engine.index().search("", &SearchFilters::default(), 100))
        .into_iter()
        .collect();
    assert_eq!(searched, listed);
    drop(dir);
}

#[test]
fn rebuild_recovers_from_deleted_index_file() {
    let (_dir, engine) = fixture_engine();
    let id = must(engine.create(&payload("Survives index loss", "ops", true, &[]), None));
    let index_path = engine.config().index_path();
    must(std::fs::remove_file(&index_path));
    for suffix in ["-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", index_path.display()));
    }

    assert_eq!(must(engine.rebuild_index()), 1);
    assert_eq!(
        ids_of(&must(engine.search("survives", &SearchFilters::default(), None))),
        vec![id]
    );
}

#[test]
fn garbage_index_file_degrades_record_operations_and_rebuild_replaces_it() {
    let dir = must(tempfile::tempdir());
    let config = EngineConfig::new(dir.path());
    let earlier = {
        let engine = must(TraceEngine::open(config.clone()));
        must(engine.create(&payload("Written before the index broke", "ops", true, &[]), None))
    };
    must(std::fs::write(config.index_path(), vec![0x5a_u8; 8192]));

    let engine = must(TraceEngine::open(config));
    assert_eq!(must(engine.get(&earlier)).trace_id(), Some(&earlier));
    let later = must(engine.create(&payload("Written while the index is broken", "ops", true, &[]), None));
    assert_eq!(ids_of(&must(engine.list(None))).len(), 2);
    assert_eq!(
        must_err(engine.search("written", &SearchFilters::default(), None)).kind(),
        ErrorKind::Index
    );

    assert_eq!(must(engine.rebuild_index()), 2);
    let found: BTreeSet<TraceId> = ids_of(&must(engine.search("written", &SearchFilters::default(), None)))
        .into_iter()
        .collect();
    assert_eq!(found, BTreeSet::from([earlier.clone(), later]));

    must(engine.delete(&earlier));
    assert!(must(engine.index().get_metadata(&earlier)).is_none());
}

#[test]
fn api_calls_survive_a_garbage_index_file() {
    let dir = must(tempfile::tempdir());
    let base: &Path = dir.path();
    let id = must(api::create_trace(&api_payload(), false, base));
    must(std::fs::write(
        EngineConfig::new(base).index_path(),
        vec![0x5a_u8; 8192],
    ));

    assert_eq!(must(api::get_trace(&id, base))["context"]["trace_id"], json!(id));
    assert_eq!(must(api::list_traces(None, base)).len(), 1);
    let second = must(api::create_trace(&api_payload(), false, base));
    assert_eq!(must(api::rebuild_index(base)), 2);
    must(api::delete_trace(&second, base));
    assert_eq!(must(api::search_traces("contract", &Value::Null, None, base)).len(), 1);
}

#[test]
fn stats_report_store_and_index_figures() {
    let (_dir, engine) = fixture_engine();
    must(engine.create(&payload("Stats first trace body", "web", true, &["alpha", "beta"]), None));
    pause();
    let newest = must(engine.create(&payload("Stats second trace body", "web", false, &["alpha"]), None));

    let stats = must(engine.stats());
    assert_eq!(stats.count, 2);
    assert!(stats.storage_size_bytes > 0);
    assert_eq!(stats.newest_trace, Some(newest));
    assert_eq!(stats.index.failed_traces, 1);
    assert_eq!(
        stats.common_tags.first(),
        Some(&TagCount {
            tag: "alpha".to_string(),
            count: 2
        })
    );
}

#[test]
fn list_returns_newest_first_within_limit() {
    let (_dir, engine) = fixture_engine();
    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(must(engine.create(&payload(&format!("Listing order sample {n}"), "docs", true, &[]), None)));
        pause();
    }
    ids.reverse();
    assert_eq!(ids_of(&must(engine.list(None))), ids);
    assert_eq!(ids_of(&must(engine.list(Some(1)))), vec![ids[0].clone()]);
}

struct BrokenIndex;

impl SearchIndex for BrokenIndex {
    fn index(&self, _trace: &palimpsest_core::ExecutionTrace) -> Result<(), TraceError> {
        Err(TraceError::index("indexing trace", "index unavailable"))
    }
    fn remove(&self, _trace_id: &TraceId) -> Result<(), TraceError> {
        Err(TraceError::index("removing trace", "index unavailable"))
    }
    fn search(&self, _: &str, _: &SearchFilters, _: usize) -> Result<Vec<TraceId>, TraceError> {
        Err(TraceError::index("searching", "index unavailable"))
    }
    fn search_metadata(
        &self,
        _: &str,
        _: &SearchFilters,
        _: usize,
    ) -> Result<Vec<TraceMetadata>, TraceError> {
        Err(TraceError::index("searching", "index unavailable"))
    }
    fn get_metadata(&self, _: &TraceId) -> Result<Option<TraceMetadata>, TraceError> {
        Ok(None)
    }
    fn rebuild(&self) -> Result<usize, TraceError> {
        Ok(0)
    }
    fn clear(&self) -> Result<(), TraceError> {
        Ok(())
    }
    fn count(&self) -> Result<usize, TraceError> {
        Ok(0)
    }
    fn stats(&self) -> Result<IndexStats, TraceError> {
        Ok(IndexStats::default())
    }
    fn common_tags(&self, _: usize) -> Result<Vec<TagCount>, TraceError> {
        Ok(Vec::new())
    }
}

#[test]
fn index_failure_after_save_degrades_without_losing_the_record() {
    let dir = must(tempfile::tempdir());
    let config = EngineConfig::new(dir.path());
    let store = must(FileRecordStore::open(config.traces_dir()));
    let engine = TraceEngine::from_parts(config, store, BrokenIndex);

    let id = must(engine.create(&payload("Index is down but data is safe", "ops", true, &[]), None));
    assert_eq!(must(engine.get(&id)).trace_id(), Some(&id));
    assert_eq!(ids_of(&must(engine.list(None))), vec![id.clone()]);
    assert_eq!(
        must_err(engine.search("index", &SearchFilters::default(), None)).kind(),
        ErrorKind::Index
    );

    must(engine.delete(&id));
    assert!(!must(engine.store().exists(&id)));
    assert_eq!(must(engine.rebuild_index()), 0);
}

fn api_payload() -> Value {
    payload("Operation contract via plain data", "api", true, &["contract"])
}

#[test]
fn api_functions_speak_plain_json() {
    let dir = must(tempfile::tempdir());
    let base: &Path = dir.path();

    let id = must(api::create_trace(&api_payload(), true, base));
    let record = must(api::get_trace(&id, base));
    assert_eq!(record["context"]["trace_id"], json!(id));
    assert_eq!(
        record["context"]["environment"]["os"],
        json!(std::env::consts::OS)
    );

    let hits = must(api::search_traces("contract", &json!({"tags": ["contract"]}), None, base));
    assert_eq!(hits.len(), 1);
    let rows = must(api::search_metadata("contract", &Value::Null, Some(5), base));
    assert_eq!(rows[0]["trace_id"], json!(id));
    assert_eq!(must(api::list_traces(Some(10), base)).len(), 1);

    let stats = must(api::get_stats(base));
    assert_eq!(stats["count"], json!(1));
    assert_eq!(must(api::rebuild_index(base)), 1);

    let bad_filters = must_err(api::search_traces("x", &json!({"success": "yes"}), None, base));
    assert_eq!(bad_filters.kind(), ErrorKind::Validation);

    must(api::delete_trace(&id, base));
    assert_eq!(must_err(api::get_trace(&id, base)).kind(), ErrorKind::NotFound);
    assert_eq!(must_err(api::get_trace("../escape", base)).kind(), ErrorKind::Validation);
}

#[test]
fn api_create_without_auto_context_keeps_environment_absent() {
    let dir = must(tempfile::tempdir());
    let id = must(api::create_trace(&api_payload(), false, dir.path()));
    let record = must(api::get_trace(&id, dir.path()));
    assert_eq!(record["context"]["environment"], Value::Null);
}

#[test]
fn api_validate_reports_every_issue() {
    let report = api::validate_trace(&json!({
        "schema_version": CURRENT_SCHEMA_VERSION,
        "problem_statement": "tiny",
        "outcome": "no",
        "execution_steps": []
    }));
    assert!(!report.valid);
    assert_eq!(report.errors.len(), 3);
    assert!(api::validate_trace(&api_payload()).valid);
}
