use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A capability an agent declares, e.g. `summarize` with `{ "lang": ["en", "es"] }`.
///
/// Immutable once declared. Parameters are kept in a `BTreeMap` so that two
/// equal skills always serialize and compare the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    /// Skill identifier.
    pub id: String,
    /// Declared parameter schema.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

impl Skill {
    /// A skill with no parameters.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a declared parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Whether this declared skill can serve `request`.
    ///
    /// Identifiers must be equal and every requested parameter must be
    /// compatible with the declared one (see [`param_compatible`]).
    pub fn satisfies(&self, request: &SkillRequest) -> bool {
        self.id == request.id
            && request.params.iter().all(|(key, wanted)| {
                self.params
                    .get(key)
                    .is_some_and(|declared| param_compatible(declared, wanted))
            })
    }
}

impl std::fmt::Display for Skill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// The skill a task asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillRequest {
    /// Requested skill identifier.
    pub id: String,
    /// Parameters the serving agent must support.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

impl SkillRequest {
    /// A request with no parameter constraints.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a required parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for SkillRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Structured compatibility between a declared and a requested parameter value.
///
/// - equal values match;
/// - a declared array accepts any requested member, or a requested array
///   whose members are all declared;
/// - a declared object accepts a requested object whose keys are all
///   present and compatible, recursively.
pub fn param_compatible(declared: &Value, requested: &Value) -> bool {
    if declared == requested {
        return true;
    }
    match (declared, requested) {
        (Value::Array(options), Value::Array(wanted)) => {
            wanted.iter().all(|w| options.contains(w))
        }
        (Value::Array(options), scalar) => options.contains(scalar),
        (Value::Object(declared), Value::Object(wanted)) => wanted.iter().all(|(k, w)| {
            declared
                .get(k)
                .is_some_and(|d| param_compatible(d, w))
        }),
        _ => false,
    }
}
