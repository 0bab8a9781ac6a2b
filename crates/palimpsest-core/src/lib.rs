//! Data model, schema migration and the storage seams shared by the
//! Palimpsest record store, search index and orchestration crates.

use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

mod error;
mod model;
mod schema;
mod search;
mod traits;

pub use error::{BoxError, ErrorKind, MigrationError, ResultExt, TraceError, ValidationError};
pub use model::{
    normalize_domain, normalize_tags, Complexity, ExecutionStep, ExecutionTrace, StepAction,
    TraceContext, TraceId,
};
pub use schema::{
    detect_version, MigrationFn, MigrationRegistry, StepNumbering, TraceSchema,
    CURRENT_SCHEMA_VERSION, LEGACY_DEFAULT_TIMESTAMP, LEGACY_SCHEMA_VERSION,
    MIN_OUTCOME_CHARS, MIN_PROBLEM_STATEMENT_CHARS, PLACEHOLDER_ID_PREFIX,
};
pub use search::{IndexStats, SearchFilters, TagCount, TraceMetadata};
pub use traits::{RecordStore, SearchIndex};

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ValidationError`] when parsing fails or the timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ValidationError> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339).map_err(|err| {
        ValidationError::single(format!("invalid RFC3339 timestamp {value:?}: {err}"))
    })?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ValidationError::single(format!(
            "timestamp {value:?} MUST use UTC offset Z"
        )));
    }

    Ok(parsed)
}

/// Parses an input timestamp leniently: RFC3339 with any offset is
/// normalised to UTC, and offset-less ISO-8601 values are read as UTC.
///
/// # Errors
/// Returns [`ValidationError`] when neither form parses.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, ValidationError> {
    if let Ok(parsed) = OffsetDateTime::parse(value, &Rfc3339) {
        return Ok(parsed.to_offset(UtcOffset::UTC));
    }

    PrimitiveDateTime::parse(value, &Iso8601::DEFAULT)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| ValidationError::single(format!("invalid timestamp {value:?}: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ValidationError`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ValidationError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| ValidationError::single(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Stable FNV-1a hash; used where the result must not depend on the
/// platform-randomized std hasher.
#[must_use]
pub fn fnv1a64(input: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn rfc3339_round_trips_through_utc() {
        let parsed = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
    }

    #[test]
    fn strict_parser_rejects_non_utc_offset() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
    }

    #[test]
    fn lenient_parser_normalises_offsets_and_naive_values() {
        let offset = must_ok(parse_timestamp("2026-02-07T14:00:00+02:00"));
        assert_eq!(must_ok(format_rfc3339(offset)), "2026-02-07T12:00:00Z");

        let naive = must_ok(parse_timestamp("2025-01-29T10:30:00"));
        assert_eq!(naive.offset(), UtcOffset::UTC);
        assert_eq!(must_ok(format_rfc3339(naive)), "2025-01-29T10:30:00Z");

        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn fnv1a_is_stable() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
