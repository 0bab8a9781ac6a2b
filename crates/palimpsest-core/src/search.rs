use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::ValidationError;
use crate::model::{normalize_domain, Complexity, TraceId};

/// Structured search constraints, AND-combined. Each requested tag must
/// occur as a substring of the trace's flattened tag text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl SearchFilters {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domain.is_none()
            && self.complexity.is_none()
            && self.success.is_none()
            && self.tags.is_empty()
    }

    /// Reads the recognized keys of a filter map. `null` means no filters;
    /// unknown keys are ignored; a recognized key with the wrong type is an
    /// error rather than a silent no-op.
    ///
    /// # Errors
    /// Returns [`ValidationError`] listing every malformed key.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let object = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(object) => object,
            _ => return Err(ValidationError::single("filters MUST be an object")),
        };

        let mut issues = Vec::new();
        let mut filters = Self::default();

        match object.get("domain") {
            None | Some(Value::Null) => {}
            Some(Value::String(domain)) => filters.domain = normalize_domain(domain),
            Some(_) => issues.push("filters.domain MUST be a string".to_string()),
        }
        match object.get("complexity") {
            None | Some(Value::Null) => {}
            Some(Value::String(raw)) => match Complexity::parse(raw) {
                Ok(complexity) => filters.complexity = Some(complexity),
                Err(err) => issues.push(format!("filters.complexity: {err}")),
            },
            Some(_) => issues.push("filters.complexity MUST be a string".to_string()),
        }
        match object.get("success") {
            None | Some(Value::Null) => {}
            Some(Value::Bool(flag)) => filters.success = Some(*flag),
            Some(_) => issues.push("filters.success MUST be a boolean".to_string()),
        }
        match object.get("tags") {
            None | Some(Value::Null) => {}
            Some(Value::Array(tags)) => {
                for (index, tag) in tags.iter().enumerate() {
                    match tag.as_str().map(|tag| tag.trim().to_lowercase()) {
                        Some(tag) if !tag.is_empty() => filters.tags.push(tag),
                        Some(_) => {}
                        None => issues.push(format!("filters.tags[{index}] MUST be a string")),
                    }
                }
            }
            Some(_) => issues.push("filters.tags MUST be an array of strings".to_string()),
        }

        if issues.is_empty() {
            Ok(filters)
        } else {
            Err(ValidationError::new(issues))
        }
    }
}

/// Structured projection of a trace, served by the index without touching
/// record files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMetadata {
    pub trace_id: TraceId,
    pub problem_statement: String,
    pub outcome: String,
    pub domain: Option<String>,
    pub complexity: Option<Complexity>,
    pub success: bool,
    #[serde(with = "crate::model::rfc3339_utc")]
    pub timestamp: OffsetDateTime,
    pub tags: Vec<String>,
    pub execution_steps_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_traces: u64,
    pub successful_traces: u64,
    pub failed_traces: u64,
    pub domains: BTreeMap<String, u64>,
    pub complexities: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: u64,
}
