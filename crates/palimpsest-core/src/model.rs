use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::error::ValidationError;
use crate::schema::PLACEHOLDER_ID_PREFIX;

const MAX_TRACE_ID_CHARS: usize = 128;

/// Opaque trace identifier. Doubles as the record file stem, so it is
/// restricted to a filesystem-safe alphabet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TraceId(String);

impl TraceId {
    /// # Errors
    /// Returns [`ValidationError`] when `raw` is empty, too long, starts with
    /// a dot, or contains characters outside `[A-Za-z0-9_.-]`.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if raw.is_empty() {
            return Err(ValidationError::single("trace_id MUST NOT be empty"));
        }
        if raw.chars().count() > MAX_TRACE_ID_CHARS {
            return Err(ValidationError::single(format!(
                "trace_id MUST be at most {MAX_TRACE_ID_CHARS} characters"
            )));
        }
        if raw.starts_with('.') {
            return Err(ValidationError::single("trace_id MUST NOT start with '.'"));
        }
        if let Some(bad) = raw
            .chars()
            .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')))
        {
            return Err(ValidationError::single(format!(
                "trace_id {raw:?} contains unsupported character {bad:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn placeholder(digest: u64) -> Self {
        Self(format!("{PLACEHOLDER_ID_PREFIX}{digest:016x}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for ids minted by the legacy migration rather than by a store.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(PLACEHOLDER_ID_PREFIX)
    }
}

impl Display for TraceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TraceId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TraceId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Ulid> for TraceId {
    fn from(value: Ulid) -> Self {
        Self(value.to_string())
    }
}

impl From<TraceId> for String {
    fn from(value: TraceId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Analyze,
    Implement,
    Test,
    Debug,
}

impl StepAction {
    pub const ALL: [Self; 4] = [Self::Analyze, Self::Implement, Self::Test, Self::Debug];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Implement => "implement",
            Self::Test => "test",
            Self::Debug => "debug",
        }
    }

    /// # Errors
    /// Returns [`ValidationError`] for anything outside the four actions.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value {
            "analyze" => Ok(Self::Analyze),
            "implement" => Ok(Self::Implement),
            "test" => Ok(Self::Test),
            "debug" => Ok(Self::Debug),
            _ => Err(ValidationError::single(format!(
                "unsupported action {value:?} (expected one of analyze, implement, test, debug)"
            ))),
        }
    }
}

impl Display for StepAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }

    /// # Errors
    /// Returns [`ValidationError`] for anything outside the three levels.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value {
            "simple" => Ok(Self::Simple),
            "moderate" => Ok(Self::Moderate),
            "complex" => Ok(Self::Complex),
            _ => Err(ValidationError::single(format!(
                "unsupported complexity {value:?} (expected one of simple, moderate, complex)"
            ))),
        }
    }
}

impl Display for Complexity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step_number: u32,
    pub action: StepAction,
    pub content: String,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    #[serde(default)]
    pub trace_id: Option<TraceId>,
    #[serde(with = "rfc3339_utc")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub environment: Option<Map<String, Value>>,
}

impl TraceContext {
    #[must_use]
    pub fn at(timestamp: OffsetDateTime) -> Self {
        Self {
            trace_id: None,
            timestamp,
            tags: BTreeSet::new(),
            environment: None,
        }
    }

    /// Tags joined by single spaces, in sorted order.
    #[must_use]
    pub fn tags_text(&self) -> String {
        self.tags.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub schema_version: String,
    pub problem_statement: String,
    pub outcome: String,
    pub execution_steps: Vec<ExecutionStep>,
    pub context: TraceContext,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub complexity: Option<Complexity>,
}

impl ExecutionTrace {
    #[must_use]
    pub fn trace_id(&self) -> Option<&TraceId> {
        self.context.trace_id.as_ref()
    }

    /// Flattened step text fed to the full-text index: each step renders
    /// as `action: content`, failed steps append `ERROR: message`, and the
    /// fragments are joined with ` | `.
    #[must_use]
    pub fn steps_content(&self) -> String {
        let mut parts = Vec::with_capacity(self.execution_steps.len());
        for step in &self.execution_steps {
            parts.push(format!("{}: {}", step.action, step.content));
            if let Some(message) = &step.error_message {
                parts.push(format!("ERROR: {message}"));
            }
        }
        parts.join(" | ")
    }

    /// Everything a keyword search should be able to hit, in one string.
    #[must_use]
    pub fn searchable_text(&self) -> String {
        let mut text = vec![
            self.problem_statement.clone(),
            self.outcome.clone(),
            self.steps_content(),
        ];
        if !self.context.tags.is_empty() {
            text.push(self.context.tags_text());
        }
        if let Some(domain) = &self.domain {
            text.push(domain.clone());
        }
        text.join(" ")
    }

    /// Assigns step numbers by list position, starting at 1.
    pub fn renumber_steps(&mut self) {
        for (number, step) in (1_u32..).zip(self.execution_steps.iter_mut()) {
            step.step_number = number;
        }
    }

    #[must_use]
    pub fn has_sequential_steps(&self) -> bool {
        (1_u32..)
            .zip(&self.execution_steps)
            .all(|(expected, step)| step.step_number == expected)
    }
}

/// Trims, lowercases and de-duplicates tags; blanks are dropped.
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|tag| tag.as_ref().trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Trims and lowercases a domain label; blank becomes `None`.
#[must_use]
pub fn normalize_domain(domain: &str) -> Option<String> {
    let normalized = domain.trim().to_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

fn default_true() -> bool {
    true
}

pub(crate) mod rfc3339_utc {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let rendered = crate::format_rfc3339(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&rendered)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        crate::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}
