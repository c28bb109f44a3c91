// Pipeline parameter schemas and logical-key derivation
//
// Pipelines accept a heterogeneous JSON map at the boundary. The dispatcher
// validates that map against the pipeline's ParamDef list, normalizes aliases
// (tier names, date formats), and derives a stable logical key from the
// canonicalized result. The same params must always hash to the same key,
// so canonicalization sorts keys and normalization runs before hashing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, SpineError};

/// Declared type of a pipeline parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
    /// ISO-8601 date (YYYY-MM-DD after normalization)
    Date,
}

impl ParamType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Int => value.is_i64() || value.is_u64(),
            ParamType::Float => value.is_number(),
            ParamType::Bool => value.is_boolean(),
            ParamType::Date => value
                .as_str()
                .map(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok())
                .unwrap_or(false),
        }
    }
}

/// Declaration of one pipeline parameter
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ParamDef {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    /// Closed set of accepted string values, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    /// Applied when the caller omits an optional parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
}

impl ParamDef {
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            choices: None,
            default: None,
            description: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            choices: None,
            default: None,
            description: String::new(),
        }
    }

    pub fn with_choices(mut self, choices: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Normalizes raw caller-supplied parameter values before validation.
///
/// The dispatcher runs the configured normalizer on every submission so that
/// aliases ("t1", "2025-12-19" vs "20251219") collapse to one canonical form
/// and equal work derives equal logical keys.
pub trait ParamNormalizer: Send + Sync {
    fn normalize(&self, name: &str, value: Value) -> Value;
}

/// Identity normalizer
pub struct NoopNormalizer;

impl ParamNormalizer for NoopNormalizer {
    fn normalize(&self, _name: &str, value: Value) -> Value {
        value
    }
}

/// Default normalizer: folds tier aliases and compact dates.
///
/// Tier values accepted for `tier`-named parameters:
/// `t1`/`tier1`/`nms_tier_1` → `NMS_TIER_1`, `t2`/`tier2` → `NMS_TIER_2`,
/// `otc`/`otce` → `OTC_TIER`. Dates in `YYYYMMDD` are rewritten to
/// `YYYY-MM-DD` for parameters named `*_date`, `*_ending` or `week_ending`.
pub struct TierDateNormalizer;

impl TierDateNormalizer {
    fn normalize_tier(raw: &str) -> Option<&'static str> {
        match raw.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "t1" | "tier1" | "tier_1" | "nms_t1" | "nms_tier_1" => Some("NMS_TIER_1"),
            "t2" | "tier2" | "tier_2" | "nms_t2" | "nms_tier_2" => Some("NMS_TIER_2"),
            "otc" | "otce" | "otc_tier" => Some("OTC_TIER"),
            _ => None,
        }
    }

    fn normalize_date(raw: &str) -> Option<String> {
        if raw.len() == 8 && raw.chars().all(|c| c.is_ascii_digit()) {
            let d = chrono::NaiveDate::parse_from_str(raw, "%Y%m%d").ok()?;
            return Some(d.format("%Y-%m-%d").to_string());
        }
        None
    }
}

impl ParamNormalizer for TierDateNormalizer {
    fn normalize(&self, name: &str, value: Value) -> Value {
        let Value::String(raw) = &value else {
            return value;
        };

        if name == "tier" {
            if let Some(tier) = Self::normalize_tier(raw) {
                return Value::String(tier.to_string());
            }
        }

        if name.ends_with("_date") || name.ends_with("_ending") {
            if let Some(date) = Self::normalize_date(raw) {
                return Value::String(date);
            }
        }

        value
    }
}

/// Validate a raw parameter map against a pipeline's declared schema.
///
/// Applies defaults for omitted optional parameters, rejects unknown keys,
/// missing required keys, type mismatches and out-of-choice values. Returns
/// the validated map with deterministic (sorted) key order.
pub fn validate_params(
    defs: &[ParamDef],
    supplied: &serde_json::Map<String, Value>,
    normalizer: &dyn ParamNormalizer,
) -> Result<BTreeMap<String, Value>> {
    for key in supplied.keys() {
        if !defs.iter().any(|d| d.name == *key) {
            return Err(SpineError::InvalidParams(format!("unknown parameter '{key}'")));
        }
    }

    let mut validated = BTreeMap::new();
    for def in defs {
        let value = match supplied.get(&def.name) {
            Some(v) => normalizer.normalize(&def.name, v.clone()),
            None if def.required => {
                return Err(SpineError::InvalidParams(format!(
                    "missing required parameter '{}'",
                    def.name
                )))
            }
            None => match &def.default {
                Some(d) => d.clone(),
                None => continue,
            },
        };

        if !def.param_type.accepts(&value) {
            return Err(SpineError::InvalidParams(format!(
                "parameter '{}' is not a valid {:?}",
                def.name, def.param_type
            )));
        }

        if let (Some(choices), Some(s)) = (&def.choices, value.as_str()) {
            if !choices.iter().any(|c| c == s) {
                return Err(SpineError::InvalidParams(format!(
                    "parameter '{}' must be one of {:?}, got '{}'",
                    def.name, choices, s
                )));
            }
        }

        validated.insert(def.name.clone(), value);
    }

    Ok(validated)
}

/// Canonical serialization of a validated parameter map.
///
/// BTreeMap iteration order makes this stable; serde_json preserves it.
pub fn canonical_params(params: &BTreeMap<String, Value>) -> String {
    serde_json::to_string(params).unwrap_or_default()
}

/// Default logical key: `{pipeline}:{16-hex sha256 prefix of canonical params}`.
///
/// Two submissions of the same pipeline with equal canonicalized params always
/// derive the same key, which the ledger's partial unique index uses to
/// enforce at-most-one live execution per logical unit of work.
pub fn logical_key(pipeline: &str, params: &BTreeMap<String, Value>) -> String {
    let digest = Sha256::digest(canonical_params(params).as_bytes());
    format!("{}:{}", pipeline, hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defs() -> Vec<ParamDef> {
        vec![
            ParamDef::required("week_ending", ParamType::Date),
            ParamDef::required("tier", ParamType::String)
                .with_choices(["NMS_TIER_1", "NMS_TIER_2", "OTC_TIER"]),
            ParamDef::optional("limit", ParamType::Int).with_default(json!(100)),
        ]
    }

    fn map(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_validate_applies_defaults() {
        let supplied = map(&[
            ("week_ending", json!("2025-12-19")),
            ("tier", json!("NMS_TIER_1")),
        ]);
        let out = validate_params(&defs(), &supplied, &NoopNormalizer).unwrap();
        assert_eq!(out.get("limit"), Some(&json!(100)));
    }

    #[test]
    fn test_validate_rejects_unknown_key() {
        let supplied = map(&[("bogus", json!(1))]);
        let err = validate_params(&defs(), &supplied, &NoopNormalizer).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
    }

    #[test]
    fn test_validate_rejects_missing_required() {
        let supplied = map(&[("tier", json!("NMS_TIER_1"))]);
        assert!(validate_params(&defs(), &supplied, &NoopNormalizer).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_choice() {
        let supplied = map(&[
            ("week_ending", json!("2025-12-19")),
            ("tier", json!("TIER_9")),
        ]);
        assert!(validate_params(&defs(), &supplied, &NoopNormalizer).is_err());
    }

    #[test]
    fn test_tier_alias_normalization() {
        let supplied = map(&[
            ("week_ending", json!("20251219")),
            ("tier", json!("t1")),
        ]);
        let out = validate_params(&defs(), &supplied, &TierDateNormalizer).unwrap();
        assert_eq!(out.get("tier"), Some(&json!("NMS_TIER_1")));
        assert_eq!(out.get("week_ending"), Some(&json!("2025-12-19")));
    }

    #[test]
    fn test_logical_key_is_stable_across_key_order() {
        let a = validate_params(
            &defs(),
            &map(&[
                ("week_ending", json!("2025-12-19")),
                ("tier", json!("NMS_TIER_1")),
            ]),
            &NoopNormalizer,
        )
        .unwrap();
        let b = validate_params(
            &defs(),
            &map(&[
                ("tier", json!("NMS_TIER_1")),
                ("week_ending", json!("2025-12-19")),
            ]),
            &NoopNormalizer,
        )
        .unwrap();
        assert_eq!(logical_key("finra.ingest", &a), logical_key("finra.ingest", &b));
    }

    #[test]
    fn test_logical_key_differs_on_params() {
        let mut a = BTreeMap::new();
        a.insert("week_ending".to_string(), json!("2025-12-19"));
        let mut b = a.clone();
        b.insert("week_ending".to_string(), json!("2025-12-26"));
        assert_ne!(logical_key("p", &a), logical_key("p", &b));
    }

    #[test]
    fn test_logical_key_shape() {
        let key = logical_key("finra.ingest", &BTreeMap::new());
        let (prefix, hash) = key.split_once(':').unwrap();
        assert_eq!(prefix, "finra.ingest");
        assert_eq!(hash.len(), 16);
    }
}
