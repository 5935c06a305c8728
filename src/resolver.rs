//! Substitution of `step:<N>.<path>` references with earlier step results.
//!
//! ```text
//! step:0.columns[0].name
//! step:2.results.0.count||0
//! "latency of step:1.name||'unknown service'"
//! ```
//!
//! A reference resolves to text. When the referenced step or path is
//! missing, the optional `||` fallback literal wins, then the configured
//! [`DefaultPolicy`].

use std::{collections::BTreeMap, fmt, sync::Arc};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;

use crate::error::ToolError;

static RE_STEP_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?x)
        step:(?P<step>\d+)
        \.(?P<path>[A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+|\[\d+\])*)
        (?:\|\|(?:'(?P<single>[^']*)'|"(?P<double>[^"]*)"|(?P<bare>[^\s,;)\]}'"]+)))?
        "#,
    )
    .unwrap()
});

static RE_INDEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]").unwrap());

/// Raw responses of completed steps, keyed by record index.
#[derive(Debug, Clone, Default)]
pub struct StepResults {
    results: BTreeMap<usize, Value>,
}

impl StepResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, step: usize, response: Value) {
        self.results.insert(step, response);
    }

    pub fn get(&self, step: usize) -> Option<&Value> {
        self.results.get(&step)
    }
}

/// A reference that could not be answered from a recorded value.
#[derive(Debug, Clone, Copy)]
pub struct StepReference<'a> {
    pub step: usize,
    /// Dotted path, with bracket indices already normalized.
    pub path: &'a str,
    pub expression: &'a str,
    /// The referenced step's response, when the step exists.
    pub result: Option<&'a Value>,
}

/// Supplies replacement text for references without a value or fallback.
pub trait DefaultPolicy: Send + Sync {
    fn default_for(&self, reference: &StepReference<'_>) -> String;
}

/// Ordered guesses: a duration field name, then a field inferred from the
/// referenced result, then a fixed generic value.
#[derive(Debug, Clone)]
pub struct HeuristicDefaults {
    duration_field: String,
    generic: String,
}

impl HeuristicDefaults {
    pub fn new() -> Self {
        Self {
            duration_field: "duration_ms".to_string(),
            generic: "*".to_string(),
        }
    }

    pub fn with_duration_field(mut self, field: impl Into<String>) -> Self {
        self.duration_field = field.into();
        self
    }

    pub fn with_generic(mut self, generic: impl Into<String>) -> Self {
        self.generic = generic.into();
        self
    }
}

impl Default for HeuristicDefaults {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultPolicy for HeuristicDefaults {
    fn default_for(&self, reference: &StepReference<'_>) -> String {
        let haystack = format!("{} {}", reference.path, reference.expression).to_lowercase();
        if haystack.contains("duration") {
            return self.duration_field.clone();
        }

        let field = reference
            .path
            .rsplit('.')
            .find(|segment| segment.parse::<usize>().is_err())
            .unwrap_or("name");

        reference
            .result
            .and_then(|result| infer_candidate(result, field))
            .unwrap_or_else(|| self.generic.clone())
    }
}

fn infer_candidate(result: &Value, field: &str) -> Option<String> {
    if let Some(first) = result
        .get("columns")
        .and_then(Value::as_array)
        .and_then(|columns| columns.first())
    {
        match first {
            Value::String(name) => return Some(name.clone()),
            Value::Object(map) => {
                if let Some(text) = map.get(field).or_else(|| map.get("name")).and_then(scalar_text) {
                    return Some(text);
                }
            }
            _ => {}
        }
    }
    first_string(result)
}

fn first_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Array(items) => items.iter().find_map(first_string),
        Value::Object(map) => map.values().find_map(first_string),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    MissingStep,
    MissingPath,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedReference {
    pub expression: String,
    pub reason: UnresolvedReason,
    pub substituted: String,
}

impl fmt::Display for UnresolvedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.reason {
            UnresolvedReason::MissingStep => "step has no result",
            UnresolvedReason::MissingPath => "path not found",
        };
        write!(f, "{} ({reason}; defaulted to '{}')", self.expression, self.substituted)
    }
}

/// Output of [`StepResolver::resolve`]: the substituted tree plus every
/// reference that fell through to the default policy.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub value: Value,
    pub unresolved: Vec<UnresolvedReference>,
}

#[derive(Clone)]
pub struct StepResolver {
    policy: Arc<dyn DefaultPolicy>,
    strict: bool,
}

impl fmt::Debug for StepResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepResolver")
            .field("strict", &self.strict)
            .finish()
    }
}

impl Default for StepResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl StepResolver {
    pub fn new() -> Self {
        Self {
            policy: Arc::new(HeuristicDefaults::new()),
            strict: false,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn DefaultPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// In strict mode [`StepResolver::check`] rejects defaulted references.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn resolve(&self, parameters: &Value, results: &StepResults) -> Resolution {
        let mut unresolved = Vec::new();
        let value = self.resolve_value(parameters, results, &mut unresolved);
        Resolution { value, unresolved }
    }

    /// Lenient mode logs defaulted references; strict mode turns them into
    /// an invocation error for the step.
    pub fn check(&self, resolution: &Resolution) -> Result<(), ToolError> {
        if resolution.unresolved.is_empty() {
            return Ok(());
        }
        let listed = resolution
            .unresolved
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        if self.strict {
            return Err(ToolError::UnresolvedReference(listed));
        }
        tracing::warn!(references = %listed, "step references resolved by default policy");
        Ok(())
    }

    /// Substitute every reference inside one string.
    pub fn resolve_str(&self, text: &str, results: &StepResults) -> String {
        let mut unresolved = Vec::new();
        self.substitute(text, results, &mut unresolved)
    }

    fn resolve_value(
        &self,
        value: &Value,
        results: &StepResults,
        unresolved: &mut Vec<UnresolvedReference>,
    ) -> Value {
        match value {
            Value::String(text) => Value::String(self.substitute(text, results, unresolved)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, results, unresolved))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (key.clone(), self.resolve_value(item, results, unresolved)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn substitute(
        &self,
        text: &str,
        results: &StepResults,
        unresolved: &mut Vec<UnresolvedReference>,
    ) -> String {
        if !text.contains("step:") {
            return text.to_string();
        }
        RE_STEP_REF
            .replace_all(text, |caps: &Captures<'_>| self.resolve_reference(caps, results, unresolved))
            .into_owned()
    }

    fn resolve_reference(
        &self,
        caps: &Captures<'_>,
        results: &StepResults,
        unresolved: &mut Vec<UnresolvedReference>,
    ) -> String {
        let expression = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let raw_path = caps.name("path").map(|m| m.as_str()).unwrap_or_default();
        let path = normalize_path(raw_path);
        let fallback = caps
            .name("single")
            .or_else(|| caps.name("double"))
            .or_else(|| caps.name("bare"))
            .map(|m| m.as_str().to_string());

        // The step number always fits unless it has absurdly many digits;
        // such a step can never exist, so treat it as missing.
        let step = caps
            .name("step")
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .unwrap_or(usize::MAX);

        let result = results.get(step);
        let reason = match result {
            None => UnresolvedReason::MissingStep,
            Some(response) => match lookup_path(response, &path) {
                Some(found) => {
                    if let Some(text) = scalar_text(found) {
                        return text;
                    }
                    UnresolvedReason::MissingPath
                }
                None => UnresolvedReason::MissingPath,
            },
        };

        if let Some(fallback) = fallback {
            return fallback;
        }

        let reference = StepReference {
            step,
            path: &path,
            expression,
            result,
        };
        let substituted = self.policy.default_for(&reference);
        unresolved.push(UnresolvedReference {
            expression: expression.to_string(),
            reason,
            substituted: substituted.clone(),
        });
        substituted
    }
}

/// `columns[0].name` → `columns.0.name`
pub fn normalize_path(path: &str) -> String {
    RE_INDEX
        .replace_all(path, ".$1")
        .trim_matches('.')
        .replace("..", ".")
}

pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            Value::Object(map) => map.get(segment),
            _ => None,
        })
}

/// Text form of a resolved value; `null` counts as absent.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).ok(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn table() -> StepResults {
        let mut results = StepResults::new();
        results.insert(0, json!({"columns": [{"name": "duration_ms", "type": "float"}, {"name": "service.name"}]}));
        results.insert(1, json!({"results": [{"count": 42, "ok": true}], "meta": {"total": 1.5}}));
        results
    }

    #[test]
    fn resolves_bracketed_index_path() {
        let resolver = StepResolver::new();
        let resolution = resolver.resolve(&json!({"column": "step:0.columns[0].name"}), &table());
        assert_eq!(resolution.value, json!({"column": "duration_ms"}));
        assert!(resolution.unresolved.is_empty());
    }

    #[test]
    fn stringifies_scalars_exactly() {
        let resolver = StepResolver::new();
        let results = table();
        assert_eq!(resolver.resolve_str("step:1.results[0].count", &results), "42");
        assert_eq!(resolver.resolve_str("step:1.results.0.ok", &results), "true");
        assert_eq!(resolver.resolve_str("step:1.meta.total", &results), "1.5");
        assert_eq!(resolver.resolve_str("step:1.meta", &results), r#"{"total":1.5}"#);
    }

    #[test]
    fn substitutes_inside_surrounding_text_and_nested_trees() {
        let resolver = StepResolver::new();
        let params = json!({
            "filters": [{"column": "step:0.columns[1].name", "op": "exists"}],
            "note": "p99 of step:0.columns[0].name over step:1.results[0].count rows",
            "limit": 10
        });
        let resolution = resolver.resolve(&params, &table());
        assert_eq!(resolution.value["filters"][0]["column"], "service.name");
        assert_eq!(resolution.value["note"], "p99 of duration_ms over 42 rows");
        assert_eq!(resolution.value["limit"], 10);
    }

    #[test]
    fn missing_step_uses_fallback_literal() {
        let resolver = StepResolver::new();
        let results = table();
        assert_eq!(resolver.resolve_str("step:7.columns[0].name||latency", &results), "latency");
        assert_eq!(resolver.resolve_str("step:7.x||'two words'", &results), "two words");
        assert_eq!(resolver.resolve_str(r#"step:7.x||"quoted""#, &results), "quoted");
    }

    #[test]
    fn missing_step_without_fallback_uses_heuristics() {
        let resolver = StepResolver::new();
        let empty = StepResults::new();
        let resolution = resolver.resolve(&json!("step:3.duration_column"), &empty);
        assert_eq!(resolution.value, json!("duration_ms"));
        assert_eq!(resolution.unresolved.len(), 1);
        assert_eq!(resolution.unresolved[0].reason, UnresolvedReason::MissingStep);

        assert_eq!(resolver.resolve_str("step:3.service", &empty), "*");
    }

    #[test]
    fn missing_path_infers_candidate_from_result() {
        let resolver = StepResolver::new();
        let resolution = resolver.resolve(&json!("step:0.columns[9].name"), &table());
        assert_eq!(resolution.value, json!("duration_ms"));
        assert_eq!(resolution.unresolved[0].reason, UnresolvedReason::MissingPath);

        let mut results = StepResults::new();
        results.insert(0, json!({"datasets": [{"slug": "frontend"}]}));
        assert_eq!(resolver.resolve_str("step:0.datasets[3].slug", &results), "frontend");
    }

    #[test]
    fn null_values_count_as_missing() {
        let mut results = StepResults::new();
        results.insert(0, json!({"name": null}));
        let resolver = StepResolver::new().with_policy(Arc::new(HeuristicDefaults::new().with_generic("none")));
        assert_eq!(resolver.resolve_str("step:0.name", &results), "none");
    }

    #[test]
    fn strict_mode_rejects_defaulted_references() {
        let resolver = StepResolver::new().strict(true);
        let resolution = resolver.resolve(&json!({"a": "step:5.name"}), &StepResults::new());
        assert!(matches!(resolver.check(&resolution), Err(ToolError::UnresolvedReference(_))));

        let with_fallback = resolver.resolve(&json!({"a": "step:5.name||x"}), &StepResults::new());
        assert!(resolver.check(&with_fallback).is_ok());

        assert!(StepResolver::new().check(&resolution).is_ok());
    }

    #[test]
    fn custom_policy_is_consulted() {
        struct Loud;
        impl DefaultPolicy for Loud {
            fn default_for(&self, reference: &StepReference<'_>) -> String {
                format!("UNRESOLVED({}:{})", reference.step, reference.path)
            }
        }
        let resolver = StepResolver::new().with_policy(Arc::new(Loud));
        assert_eq!(
            resolver.resolve_str("step:2.rows[1].id", &StepResults::new()),
            "UNRESOLVED(2:rows.1.id)"
        );
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("columns[0].name"), "columns.0.name");
        assert_eq!(normalize_path("a[1][2]"), "a.1.2");
    }

    #[test]
    fn leaves_plain_strings_and_keys_untouched() {
        let resolver = StepResolver::new();
        let params = json!({"step:0.columns": "no reference here"});
        assert_eq!(resolver.resolve(&params, &table()).value, params);
    }
}
