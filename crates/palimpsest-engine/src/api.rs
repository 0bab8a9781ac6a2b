//! Plain-data operation contract for collaborators (CLI, protocol
//! adapters). Every call opens a short-lived engine on `base_dir`; inputs
//! and outputs are `serde_json::Value`s or plain ids.

use std::path::Path;

use palimpsest_core::{
    format_rfc3339, now_utc, ResultExt, SearchFilters, TraceError, TraceId, TraceSchema,
};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{EngineConfig, TraceEngine, ValidationReport};

fn open(base_dir: &Path) -> Result<TraceEngine, TraceError> {
    TraceEngine::open(EngineConfig::new(base_dir))
}

fn parse_id(trace_id: &str) -> Result<TraceId, TraceError> {
    TraceId::parse(trace_id).map_err(|err| TraceError::validation("parsing trace id", err))
}

fn parse_filters(filters: &Value) -> Result<SearchFilters, TraceError> {
    SearchFilters::from_value(filters).map_err(|err| TraceError::validation("parsing filters", err))
}

fn to_value<T: Serialize>(value: &T, what: &str) -> Result<Value, TraceError> {
    serde_json::to_value(value).storage_context(|| format!("serializing {what}"))
}

fn to_values<T: Serialize>(values: &[T], what: &str) -> Result<Vec<Value>, TraceError> {
    values.iter().map(|value| to_value(value, what)).collect()
}

/// Platform facts merged into `context.environment` when auto-context is on.
#[must_use]
pub fn environment_snapshot() -> Map<String, Value> {
    let mut snapshot = Map::new();
    snapshot.insert("os".to_string(), Value::from(std::env::consts::OS));
    snapshot.insert("arch".to_string(), Value::from(std::env::consts::ARCH));
    snapshot.insert("family".to_string(), Value::from(std::env::consts::FAMILY));
    snapshot.insert(
        "tool_version".to_string(),
        Value::from(env!("CARGO_PKG_VERSION")),
    );
    if let Ok(collected_at) = format_rfc3339(now_utc()) {
        snapshot.insert("collected_at".to_string(), Value::from(collected_at));
    }
    snapshot
}

/// # Errors
/// Returns [`TraceError::Validation`] for a bad payload, or the storage
/// error raised while saving.
pub fn create_trace(payload: &Value, auto_context: bool, base_dir: &Path) -> Result<String, TraceError> {
    let environment = auto_context.then(environment_snapshot);
    let trace_id = open(base_dir)?.create(payload, environment)?;
    Ok(trace_id.to_string())
}

/// # Errors
/// Returns [`TraceError::Validation`] for malformed filters or
/// [`TraceError::Index`] when the query fails.
pub fn search_traces(
    query: &str,
    filters: &Value,
    limit: Option<usize>,
    base_dir: &Path,
) -> Result<Vec<Value>, TraceError> {
    let filters = parse_filters(filters)?;
    let traces = open(base_dir)?.search(query, &filters, limit)?;
    to_values(&traces, "search results")
}

/// # Errors
/// Returns [`TraceError::Validation`] for malformed filters or
/// [`TraceError::Index`] when the query fails.
pub fn search_metadata(
    query: &str,
    filters: &Value,
    limit: Option<usize>,
    base_dir: &Path,
) -> Result<Vec<Value>, TraceError> {
    let filters = parse_filters(filters)?;
    let rows = open(base_dir)?.search_metadata(query, &filters, limit)?;
    to_values(&rows, "search metadata")
}

/// # Errors
/// Returns [`TraceError::NotFound`] when no record exists.
pub fn get_trace(trace_id: &str, base_dir: &Path) -> Result<Value, TraceError> {
    let trace_id = parse_id(trace_id)?;
    let trace = open(base_dir)?.get(&trace_id)?;
    to_value(&trace, "trace")
}

/// # Errors
/// Returns [`TraceError::Storage`] when the store cannot be enumerated.
pub fn list_traces(limit: Option<usize>, base_dir: &Path) -> Result<Vec<Value>, TraceError> {
    let traces = open(base_dir)?.list(limit)?;
    to_values(&traces, "trace list")
}

/// # Errors
/// Returns [`TraceError::NotFound`] when there was nothing to delete.
pub fn delete_trace(trace_id: &str, base_dir: &Path) -> Result<(), TraceError> {
    let trace_id = parse_id(trace_id)?;
    open(base_dir)?.delete(&trace_id)
}

/// # Errors
/// Returns the storage or index error raised while collecting figures.
pub fn get_stats(base_dir: &Path) -> Result<Value, TraceError> {
    let stats = open(base_dir)?.stats()?;
    to_value(&stats, "stats")
}

/// # Errors
/// Returns [`TraceError::Index`] when the index cannot be cleared.
pub fn rebuild_index(base_dir: &Path) -> Result<usize, TraceError> {
    open(base_dir)?.rebuild_index()
}

/// Strict validation without touching any storage.
#[must_use]
pub fn validate_trace(payload: &Value) -> ValidationReport {
    ValidationReport::check(&TraceSchema::default(), payload)
}
