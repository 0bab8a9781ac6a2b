use std::fmt::{Display, Formatter};

use crate::model::TraceId;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Every constraint a payload violated, in detection order.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{}", .issues.join("; "))]
pub struct ValidationError {
    issues: Vec<String>,
}

impl ValidationError {
    #[must_use]
    pub fn new(issues: Vec<String>) -> Self {
        Self { issues }
    }

    #[must_use]
    pub fn single(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }

    #[must_use]
    pub fn issues(&self) -> &[String] {
        &self.issues
    }

    #[must_use]
    pub fn into_issues(self) -> Vec<String> {
        self.issues
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrationError {
    #[error("no migration registered from {from} to {to}")]
    NoPath { from: String, to: String },
    #[error("migration {from} -> {to} failed: {reason}")]
    Transform {
        from: String,
        to: String,
        reason: String,
    },
}

impl From<MigrationError> for ValidationError {
    fn from(err: MigrationError) -> Self {
        Self::single(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("validation failed for {context}: {source}")]
    Validation {
        context: String,
        #[source]
        source: ValidationError,
    },
    #[error("trace {trace_id} not found")]
    NotFound { trace_id: TraceId },
    #[error("storage error while {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("index error while {context}: {source}")]
    Index {
        context: String,
        #[source]
        source: BoxError,
    },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Storage,
    Index,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Storage => "storage",
            Self::Index => "index",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TraceError {
    pub fn validation(context: impl Into<String>, source: ValidationError) -> Self {
        Self::Validation {
            context: context.into(),
            source,
        }
    }

    pub fn storage(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Storage {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn index(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Index {
            context: context.into(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Index { .. } => ErrorKind::Index,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Attaches operation context to lower-level failures, mapping them onto
/// the storage or index kind of [`TraceError`].
pub trait ResultExt<T> {
    /// # Errors
    /// Returns [`TraceError::Storage`] wrapping the underlying error.
    fn storage_context<C, F>(self, context: F) -> Result<T, TraceError>
    where
        C: Into<String>,
        F: FnOnce() -> C;

    /// # Errors
    /// Returns [`TraceError::Index`] wrapping the underlying error.
    fn index_context<C, F>(self, context: F) -> Result<T, TraceError>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn storage_context<C, F>(self, context: F) -> Result<T, TraceError>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|err| TraceError::storage(context(), err))
    }

    fn index_context<C, F>(self, context: F) -> Result<T, TraceError>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|err| TraceError::index(context(), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_issue() {
        let err = ValidationError::new(vec![
            "problem_statement MUST be at least 10 characters".to_string(),
            "execution_steps MUST contain at least one step".to_string(),
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("problem_statement"));
        assert!(rendered.contains("execution_steps"));
        assert_eq!(err.issues().len(), 2);
    }

    #[test]
    fn storage_context_keeps_cause_and_kind() {
        let io: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = match io.storage_context(|| "saving trace 01ABC") {
            Ok(()) => panic!("expected storage error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.to_string().contains("saving trace 01ABC"));
        assert!(err.to_string().contains("denied"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn migration_error_folds_into_validation() {
        let err: ValidationError = MigrationError::NoPath {
            from: "99.0.0".to_string(),
            to: "0.1.0".to_string(),
        }
        .into();
        assert_eq!(
            err.issues(),
            ["no migration registered from 99.0.0 to 0.1.0".to_string()]
        );
    }
}
