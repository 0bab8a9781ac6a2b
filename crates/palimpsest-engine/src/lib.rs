//! Orchestrates the record store and search index into the operations
//! exposed to collaborators.

use std::path::PathBuf;

use palimpsest_core::{
    format_rfc3339, now_utc, ExecutionTrace, IndexStats, RecordStore, ResultExt, SearchFilters,
    SearchIndex, StepNumbering, TagCount, TraceError, TraceId, TraceMetadata, TraceSchema,
    ValidationError,
};
use palimpsest_index_sqlite::SqliteTraceIndex;
use palimpsest_store_fs::FileRecordStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

pub mod api;

pub const DATA_DIR_NAME: &str = ".palimpsest";
pub const DEFAULT_LIMIT: usize = 50;
const COMMON_TAGS_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub base_dir: PathBuf,
    pub default_limit: usize,
}

impl EngineConfig {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            default_limit: DEFAULT_LIMIT,
        }
    }

    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join(DATA_DIR_NAME)
    }

    #[must_use]
    pub fn traces_dir(&self) -> PathBuf {
        self.data_dir().join("traces")
    }

    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.data_dir().join("index.db")
    }

    /// # Errors
    /// Returns [`ValidationError`] when `default_limit` is zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.default_limit == 0 {
            return Err(ValidationError::single("default_limit MUST be >= 1"));
        }
        Ok(())
    }
}

/// Outcome of a dry-run validation; never persists anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    #[must_use]
    pub fn check(schema: &TraceSchema, payload: &Value) -> Self {
        match schema.validate_and_construct(payload) {
            Ok(_) => Self {
                valid: true,
                errors: Vec::new(),
            },
            Err(err) => Self {
                valid: false,
                errors: err.into_issues(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub count: usize,
    pub storage_size_bytes: u64,
    pub common_tags: Vec<TagCount>,
    pub index: IndexStats,
    pub newest_trace: Option<TraceId>,
    pub oldest_trace: Option<TraceId>,
    pub updated_at: String,
}

#[derive(Debug)]
pub struct TraceEngine<R = FileRecordStore, I = SqliteTraceIndex> {
    config: EngineConfig,
    schema: TraceSchema,
    store: R,
    index: I,
}

impl TraceEngine {
    /// Opens the file store and sqlite index under `config.base_dir`.
    ///
    /// An index that cannot be opened leaves the engine degraded: record
    /// operations work, index operations fail until
    /// [`TraceEngine::rebuild_index`] recreates it.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] for an invalid config, or the
    /// storage error raised while creating the record directory.
    pub fn open(config: EngineConfig) -> Result<Self, TraceError> {
        config
            .validate()
            .map_err(|err| TraceError::validation("engine configuration", err))?;
        let store = FileRecordStore::open(config.traces_dir())?;
        let index_path = config.index_path();
        let index = SqliteTraceIndex::open(&index_path).unwrap_or_else(|err| {
            warn!(
                path = %index_path.display(),
                error = %err,
                "search index unavailable; rebuild the index to restore search"
            );
            SqliteTraceIndex::at(&index_path)
        });
        debug!(base_dir = %config.base_dir.display(), "opened trace engine");
        Ok(Self::from_parts(config, store, index))
    }
}

impl<R: RecordStore, I: SearchIndex> TraceEngine<R, I> {
    pub fn from_parts(config: EngineConfig, store: R, index: I) -> Self {
        Self {
            config,
            schema: TraceSchema::default(),
            store,
            index,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &R {
        &self.store
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    /// Turns a caller payload into a trace ready for its first save.
    ///
    /// Any caller-supplied `trace_id` is dropped and a missing timestamp
    /// becomes the creation time. The environment snapshot is merged over
    /// `context.environment`. Steps are renumbered by position.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] listing every violated constraint.
    pub fn prepare(
        &self,
        payload: &Value,
        environment: Option<Map<String, Value>>,
    ) -> Result<ExecutionTrace, TraceError> {
        let Value::Object(object) = payload else {
            return Err(TraceError::validation(
                "creating trace",
                ValidationError::single("trace payload MUST be a JSON object"),
            ));
        };
        let mut object = object.clone();

        let context = object
            .entry("context")
            .or_insert_with(|| Value::Object(Map::new()));
        if context.is_null() {
            *context = Value::Object(Map::new());
        }
        if let Value::Object(context) = context {
            if context.remove("trace_id").is_some_and(|id| !id.is_null()) {
                debug!("ignoring caller-supplied trace_id");
            }
            if matches!(context.get("timestamp"), None | Some(Value::Null)) {
                let created_at = format_rfc3339(now_utc())
                    .map_err(|err| TraceError::validation("creating trace", err))?;
                context.insert("timestamp".to_string(), Value::String(created_at));
            }
            if let Some(snapshot) = environment {
                let merged = context
                    .entry("environment")
                    .or_insert_with(|| Value::Object(Map::new()));
                if merged.is_null() {
                    *merged = Value::Object(Map::new());
                }
                if let Value::Object(merged) = merged {
                    merged.extend(snapshot);
                }
            }
        }

        self.schema
            .construct(&Value::Object(object), StepNumbering::Renumber)
            .map_err(|err| TraceError::validation("creating trace", err))
    }

    /// Validates, saves and indexes a new trace. A failure to index after
    /// the save committed is logged and the id is still returned; the trace
    /// stays retrievable and reappears in search after a rebuild.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] or [`TraceError::Storage`].
    pub fn create(
        &self,
        payload: &Value,
        environment: Option<Map<String, Value>>,
    ) -> Result<TraceId, TraceError> {
        let mut trace = self.prepare(payload, environment)?;
        let trace_id = self.store.save(&mut trace)?;

        if let Err(err) = self.index.index(&trace) {
            warn!(
                trace_id = %trace_id,
                error = %err,
                "trace saved but not indexed; rebuild the index to restore search"
            );
        }
        info!(trace_id = %trace_id, "created trace");
        Ok(trace_id)
    }

    /// Strict validation of raw input: step numbers must already be
    /// sequential.
    pub fn validate(&self, payload: &Value) -> ValidationReport {
        ValidationReport::check(&self.schema, payload)
    }

    /// Ranked ids from the index, resolved to full records. Ids whose
    /// record is missing or unreadable are skipped.
    ///
    /// # Errors
    /// Returns [`TraceError::Index`] when the query itself fails.
    pub fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionTrace>, TraceError> {
        let ids = self
            .index
            .search(query, filters, limit.unwrap_or(self.config.default_limit))?;
        Ok(self.load_all(ids, "search"))
    }

    /// # Errors
    /// Returns [`TraceError::Index`] when the query fails.
    pub fn search_metadata(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: Option<usize>,
    ) -> Result<Vec<TraceMetadata>, TraceError> {
        self.index
            .search_metadata(query, filters, limit.unwrap_or(self.config.default_limit))
    }

    /// # Errors
    /// Returns [`TraceError::NotFound`] when no record exists.
    pub fn get(&self, trace_id: &TraceId) -> Result<ExecutionTrace, TraceError> {
        self.store.load(trace_id)
    }

    /// Newest records first; unreadable records are skipped.
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] when the store cannot be enumerated.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<ExecutionTrace>, TraceError> {
        let ids = self
            .store
            .list(Some(limit.unwrap_or(self.config.default_limit)))?;
        Ok(self.load_all(ids, "list"))
    }

    /// Removes the record, then its index entries. A failed index removal
    /// is logged; the record deletion stands.
    ///
    /// # Errors
    /// Returns [`TraceError::NotFound`] when there was nothing to delete.
    pub fn delete(&self, trace_id: &TraceId) -> Result<(), TraceError> {
        if !self.store.delete(trace_id)? {
            return Err(TraceError::NotFound {
                trace_id: trace_id.clone(),
            });
        }
        if let Err(err) = self.index.remove(trace_id) {
            warn!(trace_id = %trace_id, error = %err, "trace deleted but index entry remains");
        }
        info!(trace_id = %trace_id, "deleted trace");
        Ok(())
    }

    /// # Errors
    /// Returns the storage or index error raised while collecting figures.
    pub fn stats(&self) -> Result<EngineStats, TraceError> {
        let ids = self.store.list(None)?;
        let mut storage_size_bytes = 0_u64;
        for trace_id in &ids {
            match self.store.size_of(trace_id) {
                Ok(size) => storage_size_bytes += size,
                Err(TraceError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(EngineStats {
            count: ids.len(),
            storage_size_bytes,
            common_tags: self.index.common_tags(COMMON_TAGS_LIMIT)?,
            index: self.index.stats()?,
            newest_trace: ids.first().cloned(),
            oldest_trace: ids.last().cloned(),
            updated_at: format_rfc3339(now_utc()).storage_context(|| "formatting stats time")?,
        })
    }

    /// Repopulates the index from every stored record and returns how many
    /// were indexed. Records that fail to load or index are skipped. An
    /// index file that is not a database is replaced.
    ///
    /// # Errors
    /// Returns [`TraceError::Index`] when the index cannot be cleared, or
    /// [`TraceError::Storage`] when the store cannot be enumerated.
    pub fn rebuild_index(&self) -> Result<usize, TraceError> {
        self.index.clear()?;
        let ids = self.store.list(None)?;
        let total = ids.len();

        let mut indexed = 0_usize;
        for trace_id in ids {
            let outcome = self
                .store
                .load(&trace_id)
                .and_then(|trace| self.index.index(&trace));
            match outcome {
                Ok(()) => indexed += 1,
                Err(err) => {
                    warn!(trace_id = %trace_id, error = %err, "skipping trace during rebuild");
                }
            }
        }

        info!(indexed, skipped = total - indexed, "rebuilt index");
        Ok(indexed)
    }

    fn load_all(&self, ids: Vec<TraceId>, operation: &str) -> Vec<ExecutionTrace> {
        let mut traces = Vec::with_capacity(ids.len());
        for trace_id in ids {
            match self.store.load(&trace_id) {
                Ok(trace) => traces.push(trace),
                Err(err) => {
                    warn!(trace_id = %trace_id, error = %err, operation, "could not load trace");
                }
            }
        }
        traces
    }
}
