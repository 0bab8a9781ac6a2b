//! One-JSON-file-per-trace record store with atomic replacement.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use palimpsest_core::{
    ExecutionTrace, RecordStore, ResultExt, TraceError, TraceId, TraceSchema,
};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use ulid::{Generator, Ulid};

const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_traces: usize,
    pub storage_size_bytes: u64,
    pub newest_trace: Option<TraceId>,
    pub oldest_trace: Option<TraceId>,
    pub storage_directory: PathBuf,
}

/// A record file that failed to read, parse or validate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptRecord {
    pub trace_id: TraceId,
    pub path: PathBuf,
    pub reason: String,
}

pub struct FileRecordStore {
    traces_dir: PathBuf,
    schema: TraceSchema,
    ids: Mutex<Generator>,
}

impl fmt::Debug for FileRecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRecordStore")
            .field("traces_dir", &self.traces_dir)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

struct RecordEntry {
    trace_id: TraceId,
    modified: SystemTime,
    len: u64,
}

/// Fully written and synced temp file waiting to be renamed into place.
struct StagedRecord {
    file: NamedTempFile,
    target: PathBuf,
}

impl StagedRecord {
    fn commit(self) -> Result<(), TraceError> {
        let Self { file, target } = self;
        file.persist(&target)
            .map_err(|err| TraceError::storage(format!("renaming into {}", target.display()), err.error))?;
        sync_parent_dir(&target);
        Ok(())
    }
}

impl FileRecordStore {
    /// Opens (creating if needed) the record directory.
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] when the directory cannot be created.
    pub fn open(traces_dir: impl Into<PathBuf>) -> Result<Self, TraceError> {
        Self::with_schema(traces_dir, TraceSchema::default())
    }

    /// # Errors
    /// Returns [`TraceError::Storage`] when the directory cannot be created.
    pub fn with_schema(
        traces_dir: impl Into<PathBuf>,
        schema: TraceSchema,
    ) -> Result<Self, TraceError> {
        let traces_dir = traces_dir.into();
        fs::create_dir_all(&traces_dir)
            .storage_context(|| format!("creating {}", traces_dir.display()))?;
        Ok(Self {
            traces_dir,
            schema,
            ids: Mutex::new(Generator::new()),
        })
    }

    #[must_use]
    pub fn traces_dir(&self) -> &Path {
        &self.traces_dir
    }

    #[must_use]
    pub fn path_for(&self, trace_id: &TraceId) -> PathBuf {
        self.traces_dir
            .join(format!("{}.{RECORD_EXTENSION}", trace_id.as_str()))
    }

    /// # Errors
    /// Returns [`TraceError::Storage`] when the directory cannot be scanned.
    pub fn stats(&self) -> Result<StoreStats, TraceError> {
        let entries = self.entries()?;
        Ok(StoreStats {
            total_traces: entries.len(),
            storage_size_bytes: entries.iter().map(|entry| entry.len).sum(),
            newest_trace: entries.first().map(|entry| entry.trace_id.clone()),
            oldest_trace: entries.last().map(|entry| entry.trace_id.clone()),
            storage_directory: self.traces_dir.clone(),
        })
    }

    /// Reports every record that would fail to load. Nothing is removed.
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] when the directory cannot be scanned.
    pub fn scan_corrupted(&self) -> Result<Vec<CorruptRecord>, TraceError> {
        let mut corrupted = Vec::new();
        for entry in self.entries()? {
            match self.load(&entry.trace_id) {
                Ok(_) | Err(TraceError::NotFound { .. }) => {}
                Err(err) => {
                    warn!(trace_id = %entry.trace_id, error = %err, "corrupt trace record");
                    corrupted.push(CorruptRecord {
                        path: self.path_for(&entry.trace_id),
                        trace_id: entry.trace_id,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(corrupted)
    }

    fn write_staged(&self, trace_id: &TraceId, bytes: &[u8]) -> Result<StagedRecord, TraceError> {
        let context = || format!("staging trace {trace_id}");
        let mut file = tempfile::Builder::new()
            .prefix(".trace-")
            .suffix(".tmp")
            .tempfile_in(&self.traces_dir)
            .storage_context(context)?;
        file.write_all(bytes).storage_context(context)?;
        file.as_file().sync_all().storage_context(context)?;
        Ok(StagedRecord {
            file,
            target: self.path_for(trace_id),
        })
    }

    /// Record files sorted newest first; ties fall back to id descending.
    fn entries(&self) -> Result<Vec<RecordEntry>, TraceError> {
        let read_dir = fs::read_dir(&self.traces_dir)
            .storage_context(|| format!("listing {}", self.traces_dir.display()))?;

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry =
                dir_entry.storage_context(|| format!("listing {}", self.traces_dir.display()))?;
            let path = dir_entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(trace_id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| TraceId::parse(stem).ok())
            else {
                continue;
            };

            let metadata = match dir_entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(TraceError::storage(format!("inspecting {}", path.display()), err))
                }
            };
            let modified = metadata
                .modified()
                .storage_context(|| format!("reading mtime of {}", path.display()))?;
            entries.push(RecordEntry {
                trace_id,
                modified,
                len: metadata.len(),
            });
        }

        entries.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.trace_id.cmp(&a.trace_id))
        });
        Ok(entries)
    }
}

impl RecordStore for FileRecordStore {
    fn generate_id(&self) -> TraceId {
        let ulid = match self.ids.lock() {
            Ok(mut generator) => generator.generate().unwrap_or_else(|_| Ulid::new()),
            Err(_) => Ulid::new(),
        };
        TraceId::from(ulid)
    }

    fn save(&self, trace: &mut ExecutionTrace) -> Result<TraceId, TraceError> {
        let trace_id = match &trace.context.trace_id {
            Some(existing) if !existing.is_placeholder() => existing.clone(),
            _ => {
                let fresh = self.generate_id();
                trace.context.trace_id = Some(fresh.clone());
                fresh
            }
        };

        let bytes = serde_json::to_vec_pretty(trace)
            .storage_context(|| format!("serializing trace {trace_id}"))?;
        self.write_staged(&trace_id, &bytes)?.commit()?;

        info!(trace_id = %trace_id, bytes = bytes.len(), "saved trace");
        Ok(trace_id)
    }

    fn load(&self, trace_id: &TraceId) -> Result<ExecutionTrace, TraceError> {
        let path = self.path_for(trace_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TraceError::NotFound {
                    trace_id: trace_id.clone(),
                })
            }
            Err(err) => return Err(TraceError::storage(format!("reading trace {trace_id}"), err)),
        };
        let payload: serde_json::Value = serde_json::from_str(&raw)
            .storage_context(|| format!("parsing trace {trace_id}"))?;

        let mut trace = self
            .schema
            .validate_and_construct(&payload)
            .map_err(|err| TraceError::validation(format!("trace {trace_id}"), err))?;

        match &trace.context.trace_id {
            Some(embedded) if embedded == trace_id => {}
            Some(embedded) if !embedded.is_placeholder() => {
                warn!(trace_id = %trace_id, embedded = %embedded, "record id differs from file name");
                trace.context.trace_id = Some(trace_id.clone());
            }
            _ => trace.context.trace_id = Some(trace_id.clone()),
        }

        debug!(trace_id = %trace_id, "loaded trace");
        Ok(trace)
    }

    fn delete(&self, trace_id: &TraceId) -> Result<bool, TraceError> {
        match fs::remove_file(self.path_for(trace_id)) {
            Ok(()) => {
                info!(trace_id = %trace_id, "deleted trace");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(TraceError::storage(format!("deleting trace {trace_id}"), err)),
        }
    }

    fn list(&self, limit: Option<usize>) -> Result<Vec<TraceId>, TraceError> {
        let entries = self.entries()?;
        let limit = limit.unwrap_or(entries.len());
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|entry| entry.trace_id)
            .collect())
    }

    fn exists(&self, trace_id: &TraceId) -> Result<bool, TraceError> {
        self.path_for(trace_id)
            .try_exists()
            .storage_context(|| format!("checking trace {trace_id}"))
    }

    fn size_of(&self, trace_id: &TraceId) -> Result<u64, TraceError> {
        match fs::metadata(self.path_for(trace_id)) {
            Ok(metadata) => Ok(metadata.len()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(TraceError::NotFound {
                trace_id: trace_id.clone(),
            }),
            Err(err) => Err(TraceError::storage(format!("sizing trace {trace_id}"), err)),
        }
    }
}

fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palimpsest_core::{
        now_utc, normalize_tags, ErrorKind, ExecutionStep, StepAction, TraceContext,
        CURRENT_SCHEMA_VERSION,
    };
    use proptest::prelude::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
        match result {
            Ok(value) => panic!("expected Err(..), got {value:?}"),
            Err(err) => err,
        }
    }

    fn temp_store() -> (tempfile::TempDir, FileRecordStore) {
        let dir = must_ok(tempfile::tempdir());
        let store = must_ok(FileRecordStore::open(dir.path().join("traces")));
        (dir, store)
    }

    fn sample_trace(problem: &str) -> ExecutionTrace {
        let mut context = TraceContext::at(now_utc());
        context.tags = normalize_tags(["storage"]);
        ExecutionTrace {
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            problem_statement: problem.to_string(),
            outcome: "Completed successfully".to_string(),
            execution_steps: vec![ExecutionStep {
                step_number: 1,
                action: StepAction::Implement,
                content: "Write the code".to_string(),
                success: true,
                error_message: None,
            }],
            context,
            success: true,
            domain: Some("backend".to_string()),
            complexity: None,
        }
    }

    fn temp_files(store: &FileRecordStore) -> usize {
        must_ok(fs::read_dir(store.traces_dir()))
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count()
    }

    #[test]
    fn save_assigns_id_and_load_round_trips() {
        let (_dir, store) = temp_store();
        let mut trace = sample_trace("Persist a trace to disk");
        let id = must_ok(store.save(&mut trace));

        assert_eq!(trace.trace_id(), Some(&id));
        assert!(must_ok(store.exists(&id)));
        assert_eq!(must_ok(store.load(&id)), trace);
        assert_eq!(temp_files(&store), 0);

        let raw = must_ok(fs::read_to_string(store.path_for(&id)));
        assert!(raw.contains("\n  \"schema_version\""));
    }

    #[test]
    fn debug_output_names_directory_and_skips_id_generator() {
        let (_dir, store) = temp_store();
        let rendered = format!("{store:?}");
        assert!(rendered.starts_with("FileRecordStore"));
        assert!(rendered.contains("traces_dir"));
        assert!(!rendered.contains("ids:"));
    }

    #[test]
    fn save_replaces_placeholder_ids() {
        let (_dir, store) = temp_store();
        let mut trace = sample_trace("Replace legacy placeholder id");
        trace.context.trace_id = Some(TraceId::placeholder(42));
        let id = must_ok(store.save(&mut trace));
        assert!(!id.is_placeholder());
    }

    #[test]
    fn missing_records_are_not_found_and_delete_is_idempotent() {
        let (_dir, store) = temp_store();
        let ghost = must_ok(TraceId::parse("01GHOST"));
        assert_eq!(must_err(store.load(&ghost)).kind(), ErrorKind::NotFound);
        assert!(!must_ok(store.delete(&ghost)));

        let mut trace = sample_trace("Delete a stored trace");
        let id = must_ok(store.save(&mut trace));
        assert!(must_ok(store.delete(&id)));
        assert!(!must_ok(store.delete(&id)));
        assert!(!must_ok(store.exists(&id)));
    }

    #[test]
    fn interrupted_write_leaves_previous_version_intact() {
        let (_dir, store) = temp_store();
        let mut trace = sample_trace("First saved problem statement");
        let id = must_ok(store.save(&mut trace));

        let mut updated = trace.clone();
        updated.outcome = "Updated outcome text".to_string();
        let bytes = must_ok(serde_json::to_vec_pretty(&updated));
        let staged = must_ok(store.write_staged(&id, &bytes));
        assert_eq!(temp_files(&store), 1);
        drop(staged);

        assert_eq!(must_ok(store.load(&id)).outcome, "Completed successfully");
        assert_eq!(temp_files(&store), 0);
        assert_eq!(must_ok(store.list(None)), vec![id]);
    }

    #[test]
    fn list_orders_newest_first_and_honours_limit() {
        let (_dir, store) = temp_store();
        let mut ids = Vec::new();
        for n in 0..3 {
            let mut trace = sample_trace(&format!("Problem statement number {n}"));
            ids.push(must_ok(store.save(&mut trace)));
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        must_ok(fs::write(store.traces_dir().join("notes.txt"), "ignored"));

        let listed = must_ok(store.list(None));
        assert_eq!(listed, ids.iter().rev().cloned().collect::<Vec<_>>());
        assert_eq!(must_ok(store.list(Some(2))).len(), 2);

        let stats = must_ok(store.stats());
        assert_eq!(stats.total_traces, 3);
        assert_eq!(stats.newest_trace.as_ref(), ids.last());
        assert_eq!(stats.oldest_trace.as_ref(), ids.first());
        assert!(stats.storage_size_bytes > 0);
    }

    #[test]
    fn legacy_file_loads_with_migrated_defaults() {
        let (_dir, store) = temp_store();
        let id = must_ok(TraceId::parse("legacy-001"));
        let legacy = json!({
            "problem_statement": "Legacy problem from an old release",
            "outcome": "Legacy outcome",
            "execution_steps": [{"step_number": 1, "action": "analyze", "content": "Look around"}]
        });
        must_ok(fs::write(store.path_for(&id), legacy.to_string()));

        let trace = must_ok(store.load(&id));
        assert_eq!(trace.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(trace.trace_id(), Some(&id));
        assert!(trace.success);
        let on_disk = must_ok(fs::read_to_string(store.path_for(&id)));
        assert!(!on_disk.contains("schema_version"));
    }

    #[test]
    fn corrupt_records_are_reported_not_removed() {
        let (_dir, store) = temp_store();
        let mut trace = sample_trace("A healthy trace on disk");
        must_ok(store.save(&mut trace));
        let broken = must_ok(TraceId::parse("broken"));
        must_ok(fs::write(store.path_for(&broken), "{ not json"));

        assert_eq!(must_err(store.load(&broken)).kind(), ErrorKind::Storage);
        let corrupted = must_ok(store.scan_corrupted());
        assert_eq!(corrupted.len(), 1);
        assert_eq!(corrupted[0].trace_id, broken);
        assert!(must_ok(store.exists(&broken)));
    }

    #[test]
    fn readers_never_observe_partial_writes() {
        let (_dir, store) = temp_store();
        let mut trace = sample_trace("Concurrent reader and writer");
        let id = must_ok(store.save(&mut trace));

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut trace = trace.clone();
                for round in 0..50 {
                    trace.outcome = format!("Outcome revision {round} {}", "x".repeat(round * 40));
                    must_ok(store.save(&mut trace));
                }
            });
            scope.spawn(|| {
                for _ in 0..200 {
                    let loaded = must_ok(store.load(&id));
                    assert!(loaded.outcome.starts_with("Outcome revision") || loaded.outcome == "Completed successfully");
                }
            });
        });
    }

    proptest! {
        #[test]
        fn generated_ids_are_unique_and_sorted(count in 2_usize..64) {
            let (_dir, store) = temp_store();
            let ids: Vec<TraceId> = (0..count).map(|_| store.generate_id()).collect();
            let mut sorted = ids.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(sorted, ids);
        }
    }
}
