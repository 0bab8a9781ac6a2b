#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use palimpsest_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Complexity, ExecutionTrace, IndexStats,
    ResultExt, SearchFilters, SearchIndex, TagCount, TraceError, TraceId, TraceMetadata,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

const INDEX_MIGRATION_VERSION: i64 = 1;

const SCHEMA_INDEX_V1: &str = r"
CREATE TABLE IF NOT EXISTS traces (
  row_id INTEGER PRIMARY KEY,
  trace_id TEXT NOT NULL UNIQUE,
  problem_statement TEXT NOT NULL,
  outcome TEXT NOT NULL,
  domain TEXT,
  complexity TEXT CHECK (complexity IS NULL OR complexity IN ('simple', 'moderate', 'complex')),
  success INTEGER NOT NULL CHECK (success IN (0, 1)),
  timestamp TEXT NOT NULL,
  timestamp_ns INTEGER NOT NULL,
  tags TEXT NOT NULL DEFAULT '[]',
  execution_steps_count INTEGER NOT NULL CHECK (execution_steps_count >= 0)
);

CREATE INDEX IF NOT EXISTS idx_traces_recency ON traces(timestamp_ns DESC, trace_id DESC);
CREATE INDEX IF NOT EXISTS idx_traces_domain ON traces(domain);
CREATE INDEX IF NOT EXISTS idx_traces_complexity ON traces(complexity);

CREATE VIRTUAL TABLE IF NOT EXISTS traces_fts USING fts5(
  problem_statement,
  outcome,
  execution_steps_content,
  tags
);
";

const METADATA_COLUMNS: &str = "traces.trace_id, traces.problem_statement, traces.outcome, \
     traces.domain, traces.complexity, traces.success, traces.timestamp, traces.tags, \
     traces.execution_steps_count";

const FTS_OPERATORS: [&str; 4] = ["AND", "OR", "NOT", "NEAR"];

/// Full-text and metadata index over traces, kept in one SQLite file.
///
/// The `traces` table and the `traces_fts` table share a rowid so both
/// projections of a trace are replaced or deleted in one transaction.
/// Every operation opens its own connection.
#[derive(Debug, Clone)]
pub struct SqliteTraceIndex {
    db_path: PathBuf,
}

impl SqliteTraceIndex {
    /// Opens the index at `path`, creating the parent directory and the
    /// schema when missing.
    pub fn open(path: &Path) -> Result<Self, TraceError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .index_context(|| format!("creating {}", parent.display()))?;
        }
        let index = Self::at(path);
        index.migrate()?;
        Ok(index)
    }

    /// Points at `path` without touching the file. Operations fail until
    /// the schema exists; [`SearchIndex::clear`] recreates it.
    #[must_use]
    pub fn at(path: &Path) -> Self {
        Self {
            db_path: path.to_path_buf(),
        }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn migrate(&self) -> Result<(), TraceError> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .index_context(|| "ensuring schema_migrations exists")?;

        conn.execute_batch(SCHEMA_INDEX_V1)
            .index_context(|| "applying index schema")?;

        let now = format_rfc3339(now_utc()).index_context(|| "formatting migration time")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![INDEX_MIGRATION_VERSION, now],
        )
        .index_context(|| "registering index schema migration")?;
        Ok(())
    }

    fn connect(&self) -> Result<Connection, TraceError> {
        let conn = Connection::open(&self.db_path)
            .index_context(|| format!("opening sqlite database at {}", self.db_path.display()))?;
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .index_context(|| "configuring sqlite pragmas")?;
        Ok(conn)
    }

    fn drop_tables(&self) -> Result<(), TraceError> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .index_context(|| "clearing index")?;
        tx.execute_batch("DROP TABLE IF EXISTS traces_fts; DROP TABLE IF EXISTS traces;")
            .index_context(|| "clearing index")?;
        tx.execute_batch(SCHEMA_INDEX_V1)
            .index_context(|| "recreating index schema")?;
        tx.commit().index_context(|| "clearing index")
    }

    fn recreate_file(&self) -> Result<(), TraceError> {
        let mut doomed = vec![self.db_path.clone()];
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = self.db_path.clone().into_os_string();
            sidecar.push(suffix);
            doomed.push(PathBuf::from(sidecar));
        }
        for path in doomed {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed index file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(TraceError::index(format!("removing {}", path.display()), err))
                }
            }
        }
        self.migrate()
    }

    fn query_metadata(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<TraceMetadata>, TraceError> {
        let mut params: Vec<SqlValue> = Vec::new();
        let mut sql = if query.trim().is_empty() {
            format!("SELECT {METADATA_COLUMNS} FROM traces WHERE 1 = 1")
        } else {
            let Some(expression) = fts_match_expression(query) else {
                debug!(query, "query has no searchable tokens");
                return Ok(Vec::new());
            };
            params.push(SqlValue::Text(expression));
            format!(
                "SELECT {METADATA_COLUMNS}
                 FROM traces_fts
                 JOIN traces ON traces.row_id = traces_fts.rowid
                 WHERE traces_fts MATCH ?"
            )
        };

        if let Some(domain) = &filters.domain {
            sql.push_str(" AND traces.domain = ?");
            params.push(SqlValue::Text(domain.clone()));
        }
        if let Some(complexity) = filters.complexity {
            sql.push_str(" AND traces.complexity = ?");
            params.push(SqlValue::Text(complexity.as_str().to_string()));
        }
        if let Some(success) = filters.success {
            sql.push_str(" AND traces.success = ?");
            params.push(SqlValue::Integer(bool_to_sql(success)));
        }
        for tag in &filters.tags {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM json_each(traces.tags) AS tag \
                 WHERE instr(tag.value, ?) > 0)",
            );
            params.push(SqlValue::Text(tag.clone()));
        }

        if query.trim().is_empty() {
            sql.push_str(" ORDER BY traces.timestamp_ns DESC, traces.trace_id DESC");
        } else {
            sql.push_str(
                " ORDER BY bm25(traces_fts), traces.timestamp_ns DESC, traces.trace_id DESC",
            );
        }
        sql.push_str(" LIMIT ?");
        params.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(&sql)
            .index_context(|| "preparing search query")?;
        let rows = stmt
            .query_map(params_from_iter(params), parse_metadata_row)
            .index_context(|| format!("searching for {query:?}"))?;
        let results = collect_rows(rows).index_context(|| format!("reading results for {query:?}"))?;
        debug!(query, hits = results.len(), "searched index");
        Ok(results)
    }
}

impl SearchIndex for SqliteTraceIndex {
    fn index(&self, trace: &ExecutionTrace) -> Result<(), TraceError> {
        let Some(trace_id) = trace.trace_id() else {
            return Err(TraceError::index(
                "indexing trace",
                "trace has no trace_id assigned",
            ));
        };
        let context = || format!("indexing trace {trace_id}");

        let timestamp = format_rfc3339(trace.context.timestamp).index_context(context)?;
        let timestamp_ns = i64::try_from(trace.context.timestamp.unix_timestamp_nanos())
            .unwrap_or(i64::MAX);
        let tags_json = serde_json::to_string(&trace.context.tags).index_context(context)?;
        let steps_count = i64::try_from(trace.execution_steps.len()).unwrap_or(i64::MAX);

        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .index_context(context)?;

        tx.execute(
            "INSERT INTO traces(
                trace_id, problem_statement, outcome, domain, complexity, success,
                timestamp, timestamp_ns, tags, execution_steps_count
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(trace_id) DO UPDATE SET
                problem_statement = excluded.problem_statement,
                outcome = excluded.outcome,
                domain = excluded.domain,
                complexity = excluded.complexity,
                success = excluded.success,
                timestamp = excluded.timestamp,
                timestamp_ns = excluded.timestamp_ns,
                tags = excluded.tags,
                execution_steps_count = excluded.execution_steps_count",
            params![
                trace_id.as_str(),
                trace.problem_statement,
                trace.outcome,
                trace.domain,
                trace.complexity.map(Complexity::as_str),
                bool_to_sql(trace.success),
                timestamp,
                timestamp_ns,
                tags_json,
                steps_count,
            ],
        )
        .index_context(context)?;

        let row_id: i64 = tx
            .query_row(
                "SELECT row_id FROM traces WHERE trace_id = ?1",
                params![trace_id.as_str()],
                |row| row.get(0),
            )
            .index_context(context)?;

        tx.execute("DELETE FROM traces_fts WHERE rowid = ?1", params![row_id])
            .index_context(context)?;
        tx.execute(
            "INSERT INTO traces_fts(rowid, problem_statement, outcome, execution_steps_content, tags)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row_id,
                trace.problem_statement,
                trace.outcome,
                trace.steps_content(),
                trace.context.tags_text(),
            ],
        )
        .index_context(context)?;

        tx.commit().index_context(context)?;
        debug!(trace_id = %trace_id, "indexed trace");
        Ok(())
    }

    fn remove(&self, trace_id: &TraceId) -> Result<(), TraceError> {
        let context = || format!("removing trace {trace_id} from index");
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .index_context(context)?;

        let row_id: Option<i64> = tx
            .query_row(
                "SELECT row_id FROM traces WHERE trace_id = ?1",
                params![trace_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .index_context(context)?;

        if let Some(row_id) = row_id {
            tx.execute("DELETE FROM traces_fts WHERE rowid = ?1", params![row_id])
                .index_context(context)?;
            tx.execute("DELETE FROM traces WHERE row_id = ?1", params![row_id])
                .index_context(context)?;
        }
        tx.commit().index_context(context)?;
        debug!(trace_id = %trace_id, removed = row_id.is_some(), "removed trace from index");
        Ok(())
    }

    fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<TraceId>, TraceError> {
        Ok(self
            .query_metadata(query, filters, limit)?
            .into_iter()
            .map(|metadata| metadata.trace_id)
            .collect())
    }

    fn search_metadata(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<TraceMetadata>, TraceError> {
        self.query_metadata(query, filters, limit)
    }

    fn get_metadata(&self, trace_id: &TraceId) -> Result<Option<TraceMetadata>, TraceError> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("SELECT {METADATA_COLUMNS} FROM traces WHERE trace_id = ?1"),
            params![trace_id.as_str()],
            parse_metadata_row,
        )
        .optional()
        .index_context(|| format!("reading metadata for {trace_id}"))
    }

    fn rebuild(&self) -> Result<usize, TraceError> {
        let conn = self.connect()?;
        conn.execute("INSERT INTO traces_fts(traces_fts) VALUES('rebuild')", [])
            .index_context(|| "rebuilding full-text index")?;
        let count = count_rows(&conn)?;
        info!(count, "rebuilt full-text index");
        Ok(count)
    }

    /// Drops and recreates both projections. When the file cannot be
    /// opened as a database at all, it is deleted with its WAL and shared
    /// memory files and created afresh.
    fn clear(&self) -> Result<(), TraceError> {
        if let Err(err) = self.drop_tables() {
            warn!(
                path = %self.db_path.display(),
                error = %err,
                "index file unusable; recreating it"
            );
            self.recreate_file()?;
        }
        info!("cleared index");
        Ok(())
    }

    fn count(&self) -> Result<usize, TraceError> {
        count_rows(&self.connect()?)
    }

    fn stats(&self) -> Result<IndexStats, TraceError> {
        let conn = self.connect()?;
        let (total, successful): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM traces",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .index_context(|| "counting indexed traces")?;

        let total_traces = u64::try_from(total).unwrap_or(0);
        let successful_traces = u64::try_from(successful).unwrap_or(0);
        Ok(IndexStats {
            total_traces,
            successful_traces,
            failed_traces: total_traces.saturating_sub(successful_traces),
            domains: histogram(&conn, "domain")?,
            complexities: histogram(&conn, "complexity")?,
        })
    }

    fn common_tags(&self, limit: usize) -> Result<Vec<TagCount>, TraceError> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT tag.value, COUNT(*) AS uses
                 FROM traces, json_each(traces.tags) AS tag
                 GROUP BY tag.value
                 ORDER BY uses DESC, tag.value ASC
                 LIMIT ?1",
            )
            .index_context(|| "preparing tag aggregation")?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                let count: i64 = row.get(1)?;
                Ok(TagCount {
                    tag: row.get(0)?,
                    count: u64::try_from(count).unwrap_or(0),
                })
            })
            .index_context(|| "aggregating tags")?;
        collect_rows(rows).index_context(|| "aggregating tags")
    }
}

/// Turns free text into an FTS5 expression: whitespace-separated tokens
/// OR-ed together, with anything beyond a plain bareword quoted so it
/// matches literally. Returns `None` when no token could match.
#[must_use]
pub fn fts_match_expression(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split_whitespace()
        .filter(|token| token.chars().any(char::is_alphanumeric))
        .map(|token| {
            let bareword = token
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || !ch.is_ascii());
            if bareword && !FTS_OPERATORS.contains(&token) {
                token.to_string()
            } else {
                format!("\"{}\"", token.replace('"', "\"\""))
            }
        })
        .collect();

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

fn count_rows(conn: &Connection) -> Result<usize, TraceError> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM traces", [], |row| row.get(0))
        .index_context(|| "counting indexed traces")?;
    Ok(usize::try_from(count).unwrap_or(0))
}

fn histogram(conn: &Connection, column: &str) -> Result<BTreeMap<String, u64>, TraceError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {column}, COUNT(*) FROM traces WHERE {column} IS NOT NULL GROUP BY {column}"
        ))
        .index_context(|| format!("preparing {column} histogram"))?;
    let rows = stmt
        .query_map([], |row| {
            let count: i64 = row.get(1)?;
            Ok((row.get::<_, String>(0)?, u64::try_from(count).unwrap_or(0)))
        })
        .index_context(|| format!("reading {column} histogram"))?;
    Ok(collect_rows(rows)
        .index_context(|| format!("reading {column} histogram"))?
        .into_iter()
        .collect())
}

fn parse_metadata_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TraceMetadata> {
    let trace_id_raw: String = row.get(0)?;
    let complexity_raw: Option<String> = row.get(4)?;
    let success_raw: i64 = row.get(5)?;
    let timestamp_raw: String = row.get(6)?;
    let tags_raw: String = row.get(7)?;
    let steps_raw: i64 = row.get(8)?;

    let trace_id = TraceId::parse(&trace_id_raw)
        .map_err(|err| conversion_failure(0, rusqlite::types::Type::Text, err.to_string()))?;
    let complexity = complexity_raw
        .as_deref()
        .map(Complexity::parse)
        .transpose()
        .map_err(|err| conversion_failure(4, rusqlite::types::Type::Text, err.to_string()))?;
    let timestamp = parse_rfc3339_utc(&timestamp_raw)
        .map_err(|err| conversion_failure(6, rusqlite::types::Type::Text, err.to_string()))?;
    let tags: Vec<String> = serde_json::from_str(&tags_raw).map_err(|err| {
        conversion_failure(7, rusqlite::types::Type::Text, format!("invalid tags: {err}"))
    })?;
    let execution_steps_count = u32::try_from(steps_raw).map_err(|_| {
        conversion_failure(
            8,
            rusqlite::types::Type::Integer,
            format!("invalid execution_steps_count: {steps_raw}"),
        )
    })?;

    Ok(TraceMetadata {
        trace_id,
        problem_statement: row.get(1)?,
        outcome: row.get(2)?,
        domain: row.get(3)?,
        complexity,
        success: success_raw != 0,
        timestamp,
        tags,
        execution_steps_count,
    })
}

fn conversion_failure(
    column: usize,
    kind: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> rusqlite::Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
