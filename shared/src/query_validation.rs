//! Security and resource gate for AI-generated aggregation pipelines
//!
//! Every pipeline produced from a natural-language prompt passes through
//! [`QueryValidator::validate`] before it reaches the store. Validation is a
//! pure function of the collection name, the stages, and the caller's role.
//! The only correction it ever makes is appending a `$limit` stage when the
//! pipeline has none.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::QueryValidationError;
use crate::types::UserRole;

/// Operators that allow arbitrary code execution inside the store
pub const FORBIDDEN_OPERATORS: [&str; 4] = ["$where", "$function", "$accumulator", "$expr"];

/// Stages that write to the store
pub const WRITE_STAGES: [&str; 2] = ["$out", "$merge"];

/// Resource caps applied to generated pipelines
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryLimits {
    pub max_stages: usize,
    pub max_lookups: usize,
    pub max_groups: usize,
    pub max_limit: u64,
    /// Collections only admins may query
    pub restricted_collections: Vec<String>,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_stages: 20,
            max_lookups: 3,
            max_groups: 5,
            max_limit: 1000,
            restricted_collections: vec![
                "users".to_string(),
                "user_sessions".to_string(),
                "api_keys".to_string(),
            ],
        }
    }
}

/// A pipeline that passed validation, ready to execute
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatedQuery {
    pub collection: String,
    pub pipeline: Vec<Value>,
    /// True when the validator appended the `$limit` stage
    pub limit_injected: bool,
}

/// Running totals of capped stages across a pipeline and its sub-pipelines
#[derive(Debug, Default)]
struct StageCounts {
    lookups: usize,
    groups: usize,
}

/// Validates generated pipelines against the set of known collections
#[derive(Debug, Clone)]
pub struct QueryValidator {
    known_collections: BTreeSet<String>,
    limits: QueryLimits,
}

impl QueryValidator {
    pub fn new<I, S>(known_collections: I, limits: QueryLimits) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_collections: known_collections.into_iter().map(Into::into).collect(),
            limits,
        }
    }

    pub fn limits(&self) -> &QueryLimits {
        &self.limits
    }

    /// Check `pipeline` against `collection` and `role`.
    ///
    /// Returns the pipeline to execute, which always contains a `$limit`.
    pub fn validate(
        &self,
        collection: &str,
        pipeline: &[Value],
        role: UserRole,
    ) -> Result<ValidatedQuery, QueryValidationError> {
        self.check_collection(collection, role)?;

        if pipeline.len() > self.limits.max_stages {
            return Err(QueryValidationError::new(format!(
                "Pipeline has {} stages; at most {} are allowed",
                pipeline.len(),
                self.limits.max_stages
            )));
        }

        let mut counts = StageCounts::default();
        let mut has_limit = false;

        for (index, stage) in pipeline.iter().enumerate() {
            if self.check_stage(stage, index, role, &mut counts)? == "$limit" {
                has_limit = true;
            }
        }

        let mut validated = pipeline.to_vec();
        if !has_limit {
            validated.push(json!({ "$limit": self.limits.max_limit }));
        }

        Ok(ValidatedQuery {
            collection: collection.to_string(),
            pipeline: validated,
            limit_injected: !has_limit,
        })
    }

    /// Check one stage and any sub-pipelines it carries. Nested stages are
    /// reported under the index of the top-level stage that contains them and
    /// count toward the same `$lookup` and `$group` caps.
    fn check_stage<'a>(
        &self,
        stage: &'a Value,
        index: usize,
        role: UserRole,
        counts: &mut StageCounts,
    ) -> Result<&'a str, QueryValidationError> {
        let (operator, body) = single_operator(stage, index)?;

        scan_forbidden(stage, index)?;
        scan_strings(stage, index)?;

        if WRITE_STAGES.contains(&operator) {
            return Err(QueryValidationError::new(format!(
                "Write stage '{}' in stage {} is not allowed",
                operator, index
            ))
            .at_stage(index)
            .with_operator(operator));
        }

        match operator {
            "$lookup" | "$graphLookup" => {
                counts.lookups += 1;
                if counts.lookups > self.limits.max_lookups {
                    return Err(QueryValidationError::new(format!(
                        "Pipeline has more than {} $lookup stages",
                        self.limits.max_lookups
                    ))
                    .at_stage(index)
                    .with_operator(operator));
                }
                self.check_joined_collection(body.get("from"), operator, index, role)?;
                if let Some(sub) = body.get("pipeline") {
                    self.check_sub_pipeline(sub, operator, index, role, counts)?;
                }
            }
            "$unionWith" => {
                let target = match body {
                    Value::String(_) => Some(body),
                    other => other.get("coll"),
                };
                self.check_joined_collection(target, operator, index, role)?;
                if let Some(sub) = body.get("pipeline") {
                    self.check_sub_pipeline(sub, operator, index, role, counts)?;
                }
            }
            "$facet" => {
                let facets = body.as_object().ok_or_else(|| {
                    QueryValidationError::new(format!("$facet in stage {} must be an object", index))
                        .at_stage(index)
                        .with_operator(operator)
                })?;
                for sub in facets.values() {
                    self.check_sub_pipeline(sub, operator, index, role, counts)?;
                }
            }
            "$group" => {
                counts.groups += 1;
                if counts.groups > self.limits.max_groups {
                    return Err(QueryValidationError::new(format!(
                        "Pipeline has more than {} $group stages",
                        self.limits.max_groups
                    ))
                    .at_stage(index)
                    .with_operator(operator));
                }
            }
            "$limit" => {
                let limit = as_integer(body).filter(|n| *n > 0).ok_or_else(|| {
                    QueryValidationError::new(format!(
                        "$limit in stage {} must be a positive integer",
                        index
                    ))
                    .at_stage(index)
                    .with_operator(operator)
                })?;
                if limit as u64 > self.limits.max_limit {
                    return Err(QueryValidationError::new(format!(
                        "$limit in stage {} exceeds the maximum of {}",
                        index, self.limits.max_limit
                    ))
                    .at_stage(index)
                    .with_operator(operator));
                }
            }
            "$skip" => {
                if as_integer(body).filter(|n| *n >= 0).is_none() {
                    return Err(QueryValidationError::new(format!(
                        "$skip in stage {} must be a non-negative integer",
                        index
                    ))
                    .at_stage(index)
                    .with_operator(operator));
                }
            }
            _ => {}
        }

        Ok(operator)
    }

    fn check_sub_pipeline(
        &self,
        sub: &Value,
        operator: &str,
        index: usize,
        role: UserRole,
        counts: &mut StageCounts,
    ) -> Result<(), QueryValidationError> {
        let stages = sub.as_array().ok_or_else(|| {
            QueryValidationError::new(format!(
                "{} in stage {} must carry its pipeline as an array",
                operator, index
            ))
            .at_stage(index)
            .with_operator(operator)
        })?;
        for stage in stages {
            self.check_stage(stage, index, role, counts)?;
        }
        Ok(())
    }

    fn check_collection(&self, collection: &str, role: UserRole) -> Result<(), QueryValidationError> {
        if !is_valid_collection_name(collection) {
            return Err(QueryValidationError::new(
                "Collection name may only contain letters, digits and underscores",
            ));
        }
        if !self.known_collections.contains(collection) {
            return Err(QueryValidationError::new(format!(
                "Unknown collection '{}'",
                collection
            )));
        }
        if !role.is_admin()
            && self
                .limits
                .restricted_collections
                .iter()
                .any(|restricted| restricted == collection)
        {
            return Err(QueryValidationError::new(format!(
                "Collection '{}' requires an admin role",
                collection
            )));
        }
        Ok(())
    }

    fn check_joined_collection(
        &self,
        target: Option<&Value>,
        operator: &str,
        index: usize,
        role: UserRole,
    ) -> Result<(), QueryValidationError> {
        let name = target.and_then(Value::as_str).ok_or_else(|| {
            QueryValidationError::new(format!(
                "{} in stage {} must name a collection",
                operator, index
            ))
            .at_stage(index)
            .with_operator(operator)
        })?;
        self.check_collection(name, role)
            .map_err(|e| e.at_stage(index).with_operator(operator))
    }
}

/// `[A-Za-z0-9_]+`
pub fn is_valid_collection_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn single_operator(stage: &Value, index: usize) -> Result<(&str, &Value), QueryValidationError> {
    let object: &Map<String, Value> = stage.as_object().ok_or_else(|| {
        QueryValidationError::new(format!("Stage {} must be an object", index)).at_stage(index)
    })?;
    if object.len() != 1 {
        return Err(QueryValidationError::new(format!(
            "Stage {} must contain exactly one operator, found {}",
            index,
            object.len()
        ))
        .at_stage(index));
    }
    let (operator, body) = object
        .iter()
        .next()
        .ok_or_else(|| QueryValidationError::new(format!("Stage {} is empty", index)).at_stage(index))?;
    if !operator.starts_with('$') {
        return Err(QueryValidationError::new(format!(
            "Stage {} must be a pipeline operator",
            index
        ))
        .at_stage(index));
    }
    Ok((operator.as_str(), body))
}

fn scan_forbidden(value: &Value, index: usize) -> Result<(), QueryValidationError> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if let Some(operator) = FORBIDDEN_OPERATORS.iter().find(|op| **op == key.as_str()) {
                    return Err(QueryValidationError::new(format!(
                        "Forbidden operator '{}' in stage {}",
                        operator, index
                    ))
                    .at_stage(index)
                    .with_operator(*operator));
                }
                scan_forbidden(nested, index)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(|item| scan_forbidden(item, index)),
        _ => Ok(()),
    }
}

fn javascript_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\bfunction\s*\(|\beval\s*\(|=>|\bthis\.|\bnew\s+function\b|\bconstructor\s*\(|\brequire\s*\(|\bprocess\.|\bset(timeout|interval)\s*\(",
        )
        .expect("javascript pattern is valid")
    })
}

fn scan_strings(value: &Value, index: usize) -> Result<(), QueryValidationError> {
    match value {
        Value::String(text) if javascript_pattern().is_match(text) => Err(QueryValidationError::new(
            format!("Stage {} contains a JavaScript-like expression", index),
        )
        .at_stage(index)),
        Value::Object(map) => map.values().try_for_each(|nested| scan_strings(nested, index)),
        Value::Array(items) => items.iter().try_for_each(|item| scan_strings(item, index)),
        _ => Ok(()),
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.is_finite())
            .map(|f| f as i64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> QueryValidator {
        QueryValidator::new(
            ["blocks", "block_harvests", "farms", "users"],
            QueryLimits::default(),
        )
    }

    fn stages(value: Value) -> Vec<Value> {
        value.as_array().cloned().unwrap()
    }

    #[test]
    fn test_where_rejected_with_stage_index() {
        let pipeline = stages(json!([{"$match": {"a": 1}}, {"$where": "this.a==1"}]));
        let err = validator().validate("blocks", &pipeline, UserRole::User).unwrap_err();
        assert_eq!(err.operator.as_deref(), Some("$where"));
        assert_eq!(err.stage, Some(1));
        assert!(err.reason.contains("$where"));
        assert!(err.reason.contains('1'));
        assert!(!err.reason.contains("this.a"));
    }

    #[test]
    fn test_nested_forbidden_operators_rejected() {
        for operator in FORBIDDEN_OPERATORS {
            let pipeline = stages(json!([
                {"$match": {"$and": [{"status": "growing"}, {operator: {"x": 1}}]}}
            ]));
            let err = validator().validate("blocks", &pipeline, UserRole::Admin).unwrap_err();
            assert_eq!(err.operator.as_deref(), Some(operator));
            assert_eq!(err.stage, Some(0));
        }
    }

    #[test]
    fn test_limit_appended_when_missing() {
        let pipeline = stages(json!([{"$match": {}}]));
        let validated = validator().validate("blocks", &pipeline, UserRole::User).unwrap();
        assert_eq!(validated.pipeline, stages(json!([{"$match": {}}, {"$limit": 1000}])));
        assert!(validated.limit_injected);
    }

    #[test]
    fn test_existing_limit_kept() {
        let pipeline = stages(json!([{"$match": {}}, {"$limit": 25}]));
        let validated = validator().validate("blocks", &pipeline, UserRole::User).unwrap();
        assert_eq!(validated.pipeline, pipeline);
        assert!(!validated.limit_injected);
    }

    #[test]
    fn test_limit_bounds() {
        let v = validator();
        assert!(v.validate("blocks", &stages(json!([{"$limit": 1001}])), UserRole::User).is_err());
        assert!(v.validate("blocks", &stages(json!([{"$limit": 0}])), UserRole::User).is_err());
        assert!(v.validate("blocks", &stages(json!([{"$limit": "10"}])), UserRole::User).is_err());
        assert!(v.validate("blocks", &stages(json!([{"$limit": 1000}])), UserRole::User).is_ok());
    }

    #[test]
    fn test_skip_must_be_non_negative_integer() {
        let v = validator();
        assert!(v.validate("blocks", &stages(json!([{"$skip": -1}])), UserRole::User).is_err());
        assert!(v.validate("blocks", &stages(json!([{"$skip": 1.5}])), UserRole::User).is_err());
        assert!(v.validate("blocks", &stages(json!([{"$skip": 0}])), UserRole::User).is_ok());
    }

    #[test]
    fn test_unknown_and_malformed_collections_rejected() {
        let v = validator();
        let pipeline = stages(json!([{"$match": {}}]));
        assert!(v.validate("orders", &pipeline, UserRole::Admin).is_err());
        assert!(v.validate("blocks; drop", &pipeline, UserRole::Admin).is_err());
        assert!(v.validate("", &pipeline, UserRole::Admin).is_err());
    }

    #[test]
    fn test_lookup_target_must_be_known() {
        let v = validator();
        let pipeline = stages(json!([
            {"$lookup": {"from": "secrets", "localField": "a", "foreignField": "b", "as": "c"}}
        ]));
        let err = v.validate("blocks", &pipeline, UserRole::Admin).unwrap_err();
        assert_eq!(err.operator.as_deref(), Some("$lookup"));

        let pipeline = stages(json!([
            {"$lookup": {"from": "farms", "localField": "farm_id", "foreignField": "farm_id", "as": "farm"}}
        ]));
        assert!(v.validate("blocks", &pipeline, UserRole::User).is_ok());
    }

    #[test]
    fn test_structural_caps() {
        let v = validator();
        let lookup = json!({"$lookup": {"from": "farms", "localField": "a", "foreignField": "b", "as": "c"}});
        let pipeline = vec![lookup.clone(), lookup.clone(), lookup.clone(), lookup];
        assert!(v.validate("blocks", &pipeline, UserRole::User).is_err());

        let group = json!({"$group": {"_id": "$status"}});
        let pipeline = vec![group; 6];
        assert!(v.validate("blocks", &pipeline, UserRole::User).is_err());

        let pipeline = vec![json!({"$match": {}}); 21];
        assert!(v.validate("blocks", &pipeline, UserRole::User).is_err());
        let pipeline = vec![json!({"$match": {}}); 20];
        assert!(v.validate("blocks", &pipeline, UserRole::User).is_ok());
    }

    #[test]
    fn test_stage_shape() {
        let v = validator();
        let two_keys = stages(json!([{"$match": {}, "$limit": 5}]));
        assert!(v.validate("blocks", &two_keys, UserRole::User).is_err());
        let not_operator = stages(json!([{"match": {}}]));
        assert!(v.validate("blocks", &not_operator, UserRole::User).is_err());
        let not_object = stages(json!(["$match"]));
        assert!(v.validate("blocks", &not_object, UserRole::User).is_err());
    }

    #[test]
    fn test_javascript_strings_rejected() {
        let v = validator();
        for text in ["function() { return 1 }", "eval(x)", "x => x", "this.status", "require('fs')"] {
            let pipeline = stages(json!([{"$match": {"name": text}}]));
            assert!(v.validate("blocks", &pipeline, UserRole::User).is_err(), "{}", text);
        }
        let pipeline = stages(json!([{"$match": {"name": "Functional greenhouse"}}]));
        assert!(v.validate("blocks", &pipeline, UserRole::User).is_ok());
    }

    #[test]
    fn test_write_stages_rejected() {
        let v = validator();
        let pipeline = stages(json!([{"$match": {}}, {"$out": "farms"}]));
        let err = v.validate("blocks", &pipeline, UserRole::SuperAdmin).unwrap_err();
        assert_eq!(err.operator.as_deref(), Some("$out"));
    }

    #[test]
    fn test_restricted_collection_requires_admin() {
        let v = validator();
        let pipeline = stages(json!([{"$match": {}}]));
        assert!(v.validate("users", &pipeline, UserRole::Manager).is_err());
        assert!(v.validate("users", &pipeline, UserRole::Admin).is_ok());
    }

    #[test]
    fn test_nested_lookup_into_restricted_collection_rejected() {
        let v = validator();
        let pipeline = stages(json!([
            {"$lookup": {"from": "farms", "as": "farm", "pipeline": [
                {"$lookup": {"from": "users", "localField": "owner_id", "foreignField": "user_id", "as": "owner"}}
            ]}}
        ]));
        let err = v.validate("blocks", &pipeline, UserRole::User).unwrap_err();
        assert_eq!(err.operator.as_deref(), Some("$lookup"));
        assert_eq!(err.stage, Some(0));
        assert!(err.reason.contains("admin"));

        assert!(v.validate("blocks", &pipeline, UserRole::Admin).is_ok());
    }

    #[test]
    fn test_nested_lookup_into_unknown_collection_rejected() {
        let pipeline = stages(json!([
            {"$match": {}},
            {"$lookup": {"from": "farms", "as": "farm", "pipeline": [
                {"$lookup": {"from": "nonexistent_coll", "as": "x", "pipeline": []}}
            ]}}
        ]));
        let err = validator().validate("blocks", &pipeline, UserRole::Admin).unwrap_err();
        assert_eq!(err.stage, Some(1));
        assert!(err.reason.contains("nonexistent_coll"));
    }

    #[test]
    fn test_nested_lookups_count_toward_cap() {
        let inner = json!({"$lookup": {"from": "farms", "localField": "a", "foreignField": "b", "as": "c"}});
        let pipeline = vec![json!({"$lookup": {
            "from": "farms",
            "as": "farm",
            "pipeline": [inner.clone(), inner.clone(), inner.clone(), inner.clone(), inner.clone()]
        }})];
        let err = validator().validate("blocks", &pipeline, UserRole::User).unwrap_err();
        assert!(err.reason.contains("$lookup"));

        let pipeline = vec![json!({"$lookup": {"from": "farms", "as": "farm", "pipeline": [inner.clone(), inner]}})];
        assert!(validator().validate("blocks", &pipeline, UserRole::User).is_ok());
    }

    #[test]
    fn test_sub_pipelines_in_union_and_facet_checked() {
        let v = validator();
        let union = stages(json!([
            {"$unionWith": {"coll": "farms", "pipeline": [{"$out": "farms"}]}}
        ]));
        let err = v.validate("blocks", &union, UserRole::Admin).unwrap_err();
        assert_eq!(err.operator.as_deref(), Some("$out"));

        let facet = stages(json!([
            {"$facet": {"by_status": [{"$group": {"_id": "$status"}}], "owners": [
                {"$lookup": {"from": "users", "localField": "a", "foreignField": "b", "as": "c"}}
            ]}}
        ]));
        assert!(v.validate("blocks", &facet, UserRole::User).is_err());

        let bad_shape = stages(json!([{"$lookup": {"from": "farms", "as": "f", "pipeline": {"$match": {}}}}]));
        assert!(v.validate("blocks", &bad_shape, UserRole::Admin).is_err());
    }
}
