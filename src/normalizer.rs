//! Capability-specific repair of resolved parameters before invocation.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{error::EvalError, tools::Capability};

/// Rules applied to every capability.
pub const WILDCARD: &str = "*";

const TYPO_SIMILARITY: f64 = 0.85;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRules {
    /// Wrong key → canonical key.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Keys whose singular value is wrapped into an array.
    #[serde(default)]
    pub arrays: Vec<String>,
    /// Values inserted when the key is missing or null.
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizationRules {
    pub capabilities: BTreeMap<String, CapabilityRules>,
}

impl NormalizationRules {
    pub fn with_capability(mut self, name: impl Into<String>, rules: CapabilityRules) -> Self {
        self.capabilities.insert(name.into(), rules);
        self
    }

    /// Rules for the analytics query capability shipped with the harness.
    pub fn analytics() -> Self {
        let query = CapabilityRules {
            aliases: BTreeMap::from([
                ("filter".to_string(), "filters".to_string()),
                ("calculation".to_string(), "calculations".to_string()),
                ("breakdown".to_string(), "breakdowns".to_string()),
                ("group_by".to_string(), "breakdowns".to_string()),
                ("timeRange".to_string(), "time_range".to_string()),
            ]),
            arrays: vec![
                "filters".to_string(),
                "calculations".to_string(),
                "breakdowns".to_string(),
            ],
            defaults: BTreeMap::from([
                ("calculations".to_string(), json!([{"op": "COUNT"}])),
                ("time_range".to_string(), json!(7200)),
            ]),
        };
        let wildcard = CapabilityRules {
            aliases: BTreeMap::from([("dataset_slug".to_string(), "dataset".to_string())]),
            ..CapabilityRules::default()
        };
        Self::default()
            .with_capability("run_query", query)
            .with_capability(WILDCARD, wildcard)
    }
}

/// Side-effect-free parameter repair, driven by [`NormalizationRules`] and
/// the capability's parameter schema.
#[derive(Debug, Clone, Default)]
pub struct ParameterNormalizer {
    rules: NormalizationRules,
}

impl ParameterNormalizer {
    pub fn new(rules: NormalizationRules) -> Self {
        Self { rules }
    }

    pub fn analytics() -> Self {
        Self::new(NormalizationRules::analytics())
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let rules: NormalizationRules = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_slice(&bytes)?,
            _ => serde_yaml::from_slice(&bytes)?,
        };
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &NormalizationRules {
        &self.rules
    }

    pub fn normalize(&self, capability: &Capability, parameters: &Value) -> Value {
        let Value::Object(original) = parameters else {
            return parameters.clone();
        };
        let mut params = original.clone();

        let layers = [
            self.rules.capabilities.get(WILDCARD),
            self.rules.capabilities.get(&capability.name),
        ];

        for rules in layers.iter().flatten() {
            apply_aliases(&mut params, &rules.aliases);
        }
        repair_typos(&mut params, &capability.property_names());
        for rules in layers.iter().flatten() {
            apply_arrays(&mut params, &rules.arrays);
            apply_defaults(&mut params, &rules.defaults);
        }

        Value::Object(params)
    }
}

fn apply_aliases(params: &mut Map<String, Value>, aliases: &BTreeMap<String, String>) {
    for (alias, canonical) in aliases {
        if params.contains_key(canonical) {
            continue;
        }
        if let Some(value) = params.remove(alias) {
            params.insert(canonical.clone(), value);
        }
    }
}

fn apply_arrays(params: &mut Map<String, Value>, arrays: &[String]) {
    for key in arrays {
        if let Some(value) = params.get_mut(key) {
            match value {
                Value::Array(_) | Value::Null => {}
                _ => {
                    let single = value.take();
                    *value = Value::Array(vec![single]);
                }
            }
        }
    }
}

fn apply_defaults(params: &mut Map<String, Value>, defaults: &BTreeMap<String, Value>) {
    for (key, default) in defaults {
        let missing = params.get(key).map_or(true, Value::is_null);
        if missing {
            params.insert(key.clone(), default.clone());
        }
    }
}

/// Rename unknown keys that are near-misses of exactly one absent schema
/// property.
fn repair_typos(params: &mut Map<String, Value>, properties: &[&str]) {
    if properties.is_empty() {
        return;
    }
    let unknown: Vec<String> = params
        .keys()
        .filter(|key| !properties.contains(&key.as_str()))
        .cloned()
        .collect();

    for key in unknown {
        let lowered = key.to_lowercase();
        let candidates: Vec<&str> = properties
            .iter()
            .copied()
            .filter(|prop| !params.contains_key(*prop))
            .filter(|prop| {
                strsim::normalized_damerau_levenshtein(&lowered, &prop.to_lowercase()) >= TYPO_SIMILARITY
            })
            .collect();
        if let [target] = candidates.as_slice() {
            if let Some(value) = params.remove(&key) {
                params.insert((*target).to_string(), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_capability() -> Capability {
        Capability::new("run_query").with_parameter_schema(json!({
            "type": "object",
            "properties": {
                "dataset": {"type": "string"},
                "calculations": {"type": "array"},
                "filters": {"type": "array"},
                "breakdowns": {"type": "array"},
                "time_range": {"type": "integer"}
            }
        }))
    }

    #[test]
    fn supplies_defaults_and_coerces_arrays() {
        let normalizer = ParameterNormalizer::analytics();
        let out = normalizer.normalize(
            &query_capability(),
            &json!({"dataset": "frontend", "filter": {"column": "status", "op": "=", "value": 500}}),
        );
        assert_eq!(out["filters"], json!([{"column": "status", "op": "=", "value": 500}]));
        assert_eq!(out["calculations"], json!([{"op": "COUNT"}]));
        assert_eq!(out["time_range"], json!(7200));
        assert!(out.get("filter").is_none());
    }

    #[test]
    fn keeps_explicit_values() {
        let normalizer = ParameterNormalizer::analytics();
        let params = json!({
            "dataset": "frontend",
            "calculations": [{"op": "P99", "column": "duration_ms"}],
            "time_range": 600,
            "breakdowns": ["service.name"]
        });
        assert_eq!(normalizer.normalize(&query_capability(), &params), params);
    }

    #[test]
    fn alias_never_overwrites_canonical_key() {
        let normalizer = ParameterNormalizer::analytics();
        let out = normalizer.normalize(
            &query_capability(),
            &json!({"dataset": "a", "breakdowns": ["x"], "breakdown": "y"}),
        );
        assert_eq!(out["breakdowns"], json!(["x"]));
        assert_eq!(out["breakdown"], json!("y"));
    }

    #[test]
    fn wildcard_rules_apply_to_every_capability() {
        let normalizer = ParameterNormalizer::analytics();
        let out = normalizer.normalize(&Capability::new("list_columns"), &json!({"dataset_slug": "api"}));
        assert_eq!(out, json!({"dataset": "api"}));
    }

    #[test]
    fn repairs_near_miss_keys_from_schema() {
        let normalizer = ParameterNormalizer::default();
        let out = normalizer.normalize(
            &query_capability(),
            &json!({"datset": "frontend", "calcluations": [{"op": "COUNT"}], "unrelated": 1}),
        );
        assert_eq!(out["dataset"], "frontend");
        assert_eq!(out["calculations"], json!([{"op": "COUNT"}]));
        assert_eq!(out["unrelated"], 1);
    }

    #[test]
    fn non_object_parameters_pass_through() {
        let normalizer = ParameterNormalizer::analytics();
        assert_eq!(normalizer.normalize(&query_capability(), &json!("raw")), json!("raw"));
    }

    #[test]
    fn rules_load_from_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rules.yaml");
        std::fs::write(
            &path,
            "get_trace:\n  aliases: { id: trace_id }\n  defaults: { limit: 50 }\n",
        )
        .expect("write");
        let normalizer = ParameterNormalizer::from_path(&path).expect("rules");
        let out = normalizer.normalize(&Capability::new("get_trace"), &json!({"id": "abc"}));
        assert_eq!(out, json!({"trace_id": "abc", "limit": 50}));
    }
}
