use crate::error::TraceError;
use crate::model::{ExecutionTrace, TraceId};
use crate::search::{IndexStats, SearchFilters, TagCount, TraceMetadata};

/// System of record: one durable document per trace id.
pub trait RecordStore {
    fn generate_id(&self) -> TraceId;

    /// Persists `trace`, first assigning a fresh id when it has none or
    /// carries a migration placeholder. The assigned id is written back into
    /// `trace.context.trace_id` and returned.
    #[allow(clippy::missing_errors_doc)]
    fn save(&self, trace: &mut ExecutionTrace) -> Result<TraceId, TraceError>;

    /// Reads, migrates and validates the record stored under `trace_id`.
    #[allow(clippy::missing_errors_doc)]
    fn load(&self, trace_id: &TraceId) -> Result<ExecutionTrace, TraceError>;

    /// Returns `false` when nothing was stored under `trace_id`.
    #[allow(clippy::missing_errors_doc)]
    fn delete(&self, trace_id: &TraceId) -> Result<bool, TraceError>;

    /// Ids ordered newest first by modification time.
    #[allow(clippy::missing_errors_doc)]
    fn list(&self, limit: Option<usize>) -> Result<Vec<TraceId>, TraceError>;

    #[allow(clippy::missing_errors_doc)]
    fn exists(&self, trace_id: &TraceId) -> Result<bool, TraceError>;

    /// Size in bytes of the stored document.
    #[allow(clippy::missing_errors_doc)]
    fn size_of(&self, trace_id: &TraceId) -> Result<u64, TraceError>;
}

/// Derived, rebuildable projection used for ranked and filtered lookups.
pub trait SearchIndex {
    #[allow(clippy::missing_errors_doc)]
    fn index(&self, trace: &ExecutionTrace) -> Result<(), TraceError>;

    /// Removing an id that was never indexed is a no-op.
    #[allow(clippy::missing_errors_doc)]
    fn remove(&self, trace_id: &TraceId) -> Result<(), TraceError>;

    #[allow(clippy::missing_errors_doc)]
    fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<TraceId>, TraceError>;

    /// Same ordering as [`SearchIndex::search`], returning projections.
    #[allow(clippy::missing_errors_doc)]
    fn search_metadata(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<TraceMetadata>, TraceError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_metadata(&self, trace_id: &TraceId) -> Result<Option<TraceMetadata>, TraceError>;

    /// Recomputes full-text structures from the rows already indexed and
    /// returns the row count.
    #[allow(clippy::missing_errors_doc)]
    fn rebuild(&self) -> Result<usize, TraceError>;

    #[allow(clippy::missing_errors_doc)]
    fn clear(&self) -> Result<(), TraceError>;

    #[allow(clippy::missing_errors_doc)]
    fn count(&self) -> Result<usize, TraceError>;

    #[allow(clippy::missing_errors_doc)]
    fn stats(&self) -> Result<IndexStats, TraceError>;

    #[allow(clippy::missing_errors_doc)]
    fn common_tags(&self, limit: usize) -> Result<Vec<TagCount>, TraceError>;
}
