use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{MigrationError, ValidationError};
use crate::model::{
    normalize_domain, normalize_tags, Complexity, ExecutionStep, ExecutionTrace, StepAction,
    TraceContext, TraceId,
};

pub const CURRENT_SCHEMA_VERSION: &str = "0.1.0";
/// Version assumed for payloads without a `schema_version` field.
pub const LEGACY_SCHEMA_VERSION: &str = "0.0.1";
pub const LEGACY_DEFAULT_TIMESTAMP: &str = "2025-01-01T00:00:00Z";
pub const PLACEHOLDER_ID_PREFIX: &str = "migrated-";

pub const MIN_PROBLEM_STATEMENT_CHARS: usize = 10;
pub const MIN_OUTCOME_CHARS: usize = 5;

pub type MigrationFn =
    dyn Fn(Map<String, Value>) -> Result<Map<String, Value>, MigrationError> + Send + Sync;

/// Reads the declared schema version; absent means legacy.
#[must_use]
pub fn detect_version(payload: &Map<String, Value>) -> String {
    match payload.get("schema_version") {
        None | Some(Value::Null) => LEGACY_SCHEMA_VERSION.to_string(),
        Some(Value::String(version)) => version.clone(),
        Some(other) => other.to_string(),
    }
}

/// Direct `(from, to)` payload transforms. Chains are not composed: a
/// missing pair is a [`MigrationError::NoPath`].
pub struct MigrationRegistry {
    current_version: String,
    transforms: BTreeMap<(String, String), Box<MigrationFn>>,
}

impl Debug for MigrationRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("current_version", &self.current_version)
            .field("transforms", &self.transforms.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl MigrationRegistry {
    /// An empty registry targeting `current_version`.
    #[must_use]
    pub fn new(current_version: impl Into<String>) -> Self {
        Self {
            current_version: current_version.into(),
            transforms: BTreeMap::new(),
        }
    }

    /// Registry targeting [`CURRENT_SCHEMA_VERSION`] with the legacy
    /// `0.0.1 -> 0.1.0` transform installed.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new(CURRENT_SCHEMA_VERSION);
        registry.register(LEGACY_SCHEMA_VERSION, CURRENT_SCHEMA_VERSION, migrate_legacy);
        registry
    }

    pub fn register<F>(&mut self, from: impl Into<String>, to: impl Into<String>, transform: F)
    where
        F: Fn(Map<String, Value>) -> Result<Map<String, Value>, MigrationError>
            + Send
            + Sync
            + 'static,
    {
        self.transforms
            .insert((from.into(), to.into()), Box::new(transform));
    }

    #[must_use]
    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    #[must_use]
    pub fn registered_pairs(&self) -> Vec<(String, String)> {
        self.transforms.keys().cloned().collect()
    }

    #[must_use]
    pub fn needs_migration(&self, payload: &Map<String, Value>) -> bool {
        detect_version(payload) != self.current_version
    }

    /// Brings `payload` to `target`. Equal versions yield an unchanged copy;
    /// otherwise the exact registered pair runs and the result is stamped
    /// with `target`.
    ///
    /// # Errors
    /// Returns [`MigrationError::NoPath`] when no transform is registered for
    /// the pair, or whatever the transform itself reports.
    pub fn migrate(
        &self,
        payload: &Map<String, Value>,
        target: &str,
    ) -> Result<Map<String, Value>, MigrationError> {
        let from = detect_version(payload);
        if from == target {
            return Ok(payload.clone());
        }

        let key = (from, target.to_string());
        let Some(transform) = self.transforms.get(&key) else {
            let (from, to) = key;
            return Err(MigrationError::NoPath { from, to });
        };

        debug!(from = %key.0, to = %key.1, "migrating trace payload");
        let mut migrated = transform(payload.clone())?;
        migrated.insert(
            "schema_version".to_string(),
            Value::String(target.to_string()),
        );
        Ok(migrated)
    }
}

fn migrate_legacy(mut payload: Map<String, Value>) -> Result<Map<String, Value>, MigrationError> {
    let transform_error = |reason: &str| MigrationError::Transform {
        from: LEGACY_SCHEMA_VERSION.to_string(),
        to: CURRENT_SCHEMA_VERSION.to_string(),
        reason: reason.to_string(),
    };

    let digest = serde_json::to_vec(&payload)
        .map(|bytes| crate::fnv1a64(&bytes))
        .map_err(|err| transform_error(&err.to_string()))?;

    let context = payload
        .entry("context")
        .or_insert_with(|| Value::Object(Map::new()));
    if context.is_null() {
        *context = Value::Object(Map::new());
    }
    let Value::Object(context) = context else {
        return Err(transform_error("context is not an object"));
    };

    fill_missing(context, "trace_id", || {
        Value::String(TraceId::placeholder(digest).to_string())
    });
    fill_missing(context, "timestamp", || {
        Value::String(LEGACY_DEFAULT_TIMESTAMP.to_string())
    });
    fill_missing(context, "tags", || Value::Array(Vec::new()));
    fill_missing(context, "environment", || Value::Object(Map::new()));
    match context.get_mut("environment") {
        Some(Value::Object(environment)) => {
            environment.insert(
                "migrated_from".to_string(),
                Value::String(LEGACY_SCHEMA_VERSION.to_string()),
            );
        }
        _ => return Err(transform_error("context.environment is not an object")),
    }

    fill_missing(&mut payload, "success", || Value::Bool(true));
    payload.insert(
        "schema_version".to_string(),
        Value::String(CURRENT_SCHEMA_VERSION.to_string()),
    );
    Ok(payload)
}

fn fill_missing(map: &mut Map<String, Value>, key: &str, value: impl FnOnce() -> Value) {
    match map.get(key) {
        None | Some(Value::Null) => {
            map.insert(key.to_string(), value());
        }
        Some(_) => {}
    }
}

/// How step numbers are treated when a payload becomes a trace.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StepNumbering {
    /// Numbers must already read 1, 2, .., n.
    Strict,
    /// Numbers are reassigned from list position; supplied values are ignored.
    Renumber,
}

/// Validator and constructor for trace payloads. Runs migration first,
/// then checks every field and reports all violations together.
#[derive(Debug, Default)]
pub struct TraceSchema {
    registry: MigrationRegistry,
}

impl TraceSchema {
    #[must_use]
    pub fn new(registry: MigrationRegistry) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Strict construction: step numbers must already be sequential.
    ///
    /// # Errors
    /// Returns [`ValidationError`] listing every violated constraint.
    pub fn validate_and_construct(&self, payload: &Value) -> Result<ExecutionTrace, ValidationError> {
        self.construct(payload, StepNumbering::Strict)
    }

    /// # Errors
    /// Returns [`ValidationError`] listing every violated constraint, or the
    /// migration failure when the payload version cannot be upgraded.
    pub fn construct(
        &self,
        payload: &Value,
        numbering: StepNumbering,
    ) -> Result<ExecutionTrace, ValidationError> {
        let Value::Object(object) = payload else {
            return Err(ValidationError::single("trace payload MUST be a JSON object"));
        };
        let migrated = self
            .registry
            .migrate(object, self.registry.current_version())?;

        let mut issues = Vec::new();
        let problem_statement = required_text(
            &migrated,
            "problem_statement",
            MIN_PROBLEM_STATEMENT_CHARS,
            &mut issues,
        );
        let outcome = required_text(&migrated, "outcome", MIN_OUTCOME_CHARS, &mut issues);
        let execution_steps = parse_steps(migrated.get("execution_steps"), numbering, &mut issues);
        let context = parse_context(migrated.get("context"), &mut issues);
        let success = optional_bool(migrated.get("success"), "success", &mut issues);
        let domain = parse_domain(migrated.get("domain"), &mut issues);
        let complexity = parse_complexity(migrated.get("complexity"), &mut issues);

        match (problem_statement, outcome, execution_steps, context) {
            (Some(problem_statement), Some(outcome), Some(execution_steps), Some(context))
                if issues.is_empty() =>
            {
                Ok(ExecutionTrace {
                    schema_version: self.registry.current_version().to_string(),
                    problem_statement,
                    outcome,
                    execution_steps,
                    context,
                    success,
                    domain,
                    complexity,
                })
            }
            _ => Err(ValidationError::new(issues)),
        }
    }
}

fn required_text(
    object: &Map<String, Value>,
    field: &str,
    min_chars: usize,
    issues: &mut Vec<String>,
) -> Option<String> {
    match object.get(field) {
        Some(Value::String(text)) if text.chars().count() >= min_chars => Some(text.clone()),
        Some(Value::String(_)) => {
            issues.push(format!("{field} MUST be at least {min_chars} characters"));
            None
        }
        None | Some(Value::Null) => {
            issues.push(format!("{field} is required"));
            None
        }
        Some(_) => {
            issues.push(format!("{field} MUST be a string"));
            None
        }
    }
}

fn optional_bool(value: Option<&Value>, field: &str, issues: &mut Vec<String>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Bool(flag)) => *flag,
        Some(_) => {
            issues.push(format!("{field} MUST be a boolean"));
            true
        }
    }
}

fn parse_steps(
    value: Option<&Value>,
    numbering: StepNumbering,
    issues: &mut Vec<String>,
) -> Option<Vec<ExecutionStep>> {
    let steps = match value {
        Some(Value::Array(steps)) => steps,
        None | Some(Value::Null) => {
            issues.push("execution_steps is required".to_string());
            return None;
        }
        Some(_) => {
            issues.push("execution_steps MUST be an array".to_string());
            return None;
        }
    };
    if steps.is_empty() {
        issues.push("execution_steps MUST contain at least one step".to_string());
        return None;
    }

    let before = issues.len();
    let parsed: Vec<ExecutionStep> = (1_u32..)
        .zip(steps)
        .filter_map(|(position, raw)| parse_step(position, raw, numbering, issues))
        .collect();
    (issues.len() == before).then_some(parsed)
}

fn parse_step(
    position: u32,
    raw: &Value,
    numbering: StepNumbering,
    issues: &mut Vec<String>,
) -> Option<ExecutionStep> {
    let at = format!("execution_steps[{}]", position - 1);
    let Value::Object(step) = raw else {
        issues.push(format!("{at} MUST be an object"));
        return None;
    };
    let before = issues.len();

    let step_number = match numbering {
        StepNumbering::Renumber => position,
        StepNumbering::Strict => match step.get("step_number").and_then(Value::as_u64) {
            Some(number) if number == u64::from(position) => position,
            Some(number) => {
                issues.push(format!(
                    "{at}.step_number MUST be {position} (sequential from 1), got {number}"
                ));
                position
            }
            None => {
                issues.push(format!("{at}.step_number MUST be a positive integer"));
                position
            }
        },
    };

    let action = match step.get("action") {
        Some(Value::String(action)) => match StepAction::parse(action) {
            Ok(action) => Some(action),
            Err(err) => {
                issues.push(format!("{at}.action: {err}"));
                None
            }
        },
        _ => {
            issues.push(format!("{at}.action is required"));
            None
        }
    };

    let content = match step.get("content") {
        Some(Value::String(content)) if !content.is_empty() => Some(content.clone()),
        Some(Value::String(_)) => {
            issues.push(format!("{at}.content MUST NOT be empty"));
            None
        }
        _ => {
            issues.push(format!("{at}.content is required"));
            None
        }
    };

    let success = optional_bool(step.get("success"), &format!("{at}.success"), issues);

    let error_message = match step.get("error_message") {
        None | Some(Value::Null) => None,
        Some(Value::String(message)) => Some(message.clone()),
        Some(_) => {
            issues.push(format!("{at}.error_message MUST be a string"));
            None
        }
    };
    if success && error_message.is_some() {
        issues.push(format!(
            "{at}.error_message is only allowed when success is false"
        ));
    }

    if issues.len() != before {
        return None;
    }
    Some(ExecutionStep {
        step_number,
        action: action?,
        content: content?,
        success,
        error_message,
    })
}

fn parse_context(value: Option<&Value>, issues: &mut Vec<String>) -> Option<TraceContext> {
    let context = match value {
        None | Some(Value::Null) => return Some(TraceContext::at(crate::now_utc())),
        Some(Value::Object(context)) => context,
        Some(_) => {
            issues.push("context MUST be an object".to_string());
            return None;
        }
    };
    let before = issues.len();

    let trace_id = match context.get("trace_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => match TraceId::parse(raw) {
            Ok(id) => Some(id),
            Err(err) => {
                issues.push(format!("context.{err}"));
                None
            }
        },
        Some(_) => {
            issues.push("context.trace_id MUST be a string".to_string());
            None
        }
    };

    let timestamp = match context.get("timestamp") {
        None | Some(Value::Null) => crate::now_utc(),
        Some(Value::String(raw)) => match crate::parse_timestamp(raw) {
            Ok(timestamp) => timestamp,
            Err(err) => {
                issues.push(format!("context.timestamp: {err}"));
                crate::now_utc()
            }
        },
        Some(_) => {
            issues.push("context.timestamp MUST be an ISO-8601 string".to_string());
            crate::now_utc()
        }
    };

    let tags = match context.get("tags") {
        None | Some(Value::Null) => normalize_tags(Vec::<String>::new()),
        Some(Value::Array(tags)) => {
            let mut texts = Vec::with_capacity(tags.len());
            for (index, tag) in tags.iter().enumerate() {
                match tag {
                    Value::String(text) => texts.push(text.as_str()),
                    _ => issues.push(format!("context.tags[{index}] MUST be a string")),
                }
            }
            normalize_tags(texts)
        }
        Some(_) => {
            issues.push("context.tags MUST be an array of strings".to_string());
            normalize_tags(Vec::<String>::new())
        }
    };

    let environment = match context.get("environment") {
        None | Some(Value::Null) => None,
        Some(Value::Object(environment)) => Some(environment.clone()),
        Some(_) => {
            issues.push("context.environment MUST be an object or null".to_string());
            None
        }
    };

    (issues.len() == before).then_some(TraceContext {
        trace_id,
        timestamp,
        tags,
        environment,
    })
}

fn parse_domain(value: Option<&Value>, issues: &mut Vec<String>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(domain)) => normalize_domain(domain),
        Some(_) => {
            issues.push("domain MUST be a string or null".to_string());
            None
        }
    }
}

fn parse_complexity(value: Option<&Value>, issues: &mut Vec<String>) -> Option<Complexity> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => match Complexity::parse(raw) {
            Ok(complexity) => Some(complexity),
            Err(err) => {
                issues.push(format!("complexity: {err}"));
                None
            }
        },
        Some(_) => {
            issues.push("complexity MUST be a string or null".to_string());
            None
        }
    }
}
