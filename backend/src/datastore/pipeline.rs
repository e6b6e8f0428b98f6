//! In-process evaluator for validated aggregation pipelines
//!
//! PostgreSQL rows are exposed to the AI engine as JSON documents. This module
//! runs the aggregation stages the query generator emits over those documents.
//! Unsupported stages and operators are errors, never silently skipped.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use regex::RegexBuilder;
use serde_json::{json, Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("{0}")]
pub struct PipelineError(pub String);

type Result<T> = std::result::Result<T, PipelineError>;

static NULL: Value = Value::Null;

fn unsupported(kind: &str, name: &str) -> PipelineError {
    PipelineError(format!("Unsupported {} '{}'", kind, name))
}

/// Run `pipeline` over `documents`.
///
/// `foreign` holds the documents of every collection named by a `$lookup`.
pub fn execute(
    documents: Vec<Value>,
    pipeline: &[Value],
    foreign: &HashMap<String, Vec<Value>>,
) -> Result<Vec<Value>> {
    pipeline
        .iter()
        .cloned()
        .map(normalize_extended_json)
        .try_fold(documents, |docs, stage| apply_stage(docs, &stage, foreign))
}

/// Collections a pipeline joins against
pub fn lookup_targets(pipeline: &[Value]) -> Vec<String> {
    let mut targets: Vec<String> = pipeline
        .iter()
        .filter_map(|stage| stage.get("$lookup"))
        .filter_map(|lookup| lookup.get("from"))
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    targets.sort();
    targets.dedup();
    targets
}

/// Replace extended-JSON wrappers (`$oid`, `$date`, `$numberLong`,
/// `$numberDecimal` and friends) with plain strings and numbers
pub fn normalize_extended_json(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(plain) = map.iter().next().and_then(|(k, v)| unwrap_extended(k, v)) {
                    return plain;
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, normalize_extended_json(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_extended_json).collect()),
        other => other,
    }
}

fn unwrap_extended(key: &str, inner: &Value) -> Option<Value> {
    match (key, inner) {
        ("$oid", Value::String(s)) => Some(Value::String(s.clone())),
        ("$date", Value::String(s)) => Some(Value::String(s.clone())),
        ("$date", Value::Number(n)) => n.as_i64().and_then(millis_to_string),
        ("$date", Value::Object(o)) => o
            .get("$numberLong")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(millis_to_string),
        ("$numberLong" | "$numberInt", Value::String(s)) => {
            Some(s.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::String(s.clone())))
        }
        ("$numberDecimal" | "$numberDouble", Value::String(s)) => Some(
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(s.clone())),
        ),
        _ => None,
    }
}

fn millis_to_string(millis: i64) -> Option<Value> {
    DateTime::<Utc>::from_timestamp_millis(millis).map(|d| Value::String(d.to_rfc3339()))
}

fn apply_stage(docs: Vec<Value>, stage: &Value, foreign: &HashMap<String, Vec<Value>>) -> Result<Vec<Value>> {
    let (name, spec) = stage
        .as_object()
        .filter(|m| m.len() == 1)
        .and_then(|m| m.iter().next())
        .ok_or_else(|| PipelineError("Stage must be a single-key object".into()))?;

    match name.as_str() {
        "$match" => {
            let mut kept = Vec::with_capacity(docs.len());
            for doc in docs {
                if matches(&doc, spec)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        "$project" => docs.iter().map(|doc| project(doc, spec)).collect(),
        "$addFields" | "$set" => docs.into_iter().map(|doc| add_fields(doc, spec)).collect(),
        "$unset" => {
            let fields = field_list(spec, "$unset")?;
            Ok(docs
                .into_iter()
                .map(|mut doc| {
                    for field in &fields {
                        remove_path(&mut doc, field);
                    }
                    doc
                })
                .collect())
        }
        "$group" => group(&docs, spec),
        "$sort" => sort(docs, spec),
        "$limit" => Ok(docs.into_iter().take(as_count(spec, "$limit")?).collect()),
        "$skip" => Ok(docs.into_iter().skip(as_count(spec, "$skip")?).collect()),
        "$count" => {
            let field = spec
                .as_str()
                .filter(|f| !f.is_empty() && !f.starts_with('$'))
                .ok_or_else(|| PipelineError("$count requires a field name".into()))?;
            if docs.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![json!({ field: docs.len() })])
            }
        }
        "$unwind" => unwind(docs, spec),
        "$lookup" => lookup(docs, spec, foreign),
        other => Err(unsupported("stage", other)),
    }
}

// ============================================================================
// $match
// ============================================================================

fn matches(doc: &Value, query: &Value) -> Result<bool> {
    let query = query
        .as_object()
        .ok_or_else(|| PipelineError("$match requires an object".into()))?;

    for (key, condition) in query {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(condition, "$and")? {
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(condition, "$or")? {
                    if matches(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in clauses(condition, "$nor")? {
                    if matches(doc, clause)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => return Err(unsupported("query operator", op)),
            field => field_matches(get_path(doc, field), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(condition: &'a Value, operator: &str) -> Result<&'a Vec<Value>> {
    condition
        .as_array()
        .ok_or_else(|| PipelineError(format!("{} requires an array", operator)))
}

fn is_operator_object(value: &Value) -> bool {
    value
        .as_object()
        .map(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
        .unwrap_or(false)
}

fn field_matches(value: Option<&Value>, condition: &Value) -> Result<bool> {
    let Some(operators) = condition.as_object().filter(|_| is_operator_object(condition)) else {
        return Ok(equals(value, condition));
    };

    for (op, arg) in operators {
        let ok = match op.as_str() {
            "$options" => continue,
            "$eq" => equals(value, arg),
            "$ne" => !equals(value, arg),
            "$gt" => compare_with(value, arg, |o| o == Ordering::Greater),
            "$gte" => compare_with(value, arg, |o| o != Ordering::Less),
            "$lt" => compare_with(value, arg, |o| o == Ordering::Less),
            "$lte" => compare_with(value, arg, |o| o != Ordering::Greater),
            "$in" => clauses(arg, "$in")?.iter().any(|t| equals(value, t)),
            "$nin" => !clauses(arg, "$nin")?.iter().any(|t| equals(value, t)),
            "$exists" => value.is_some() == truthy(arg),
            "$regex" => regex_matches(value, arg, operators.get("$options"))?,
            "$not" => !field_matches(value, arg)?,
            "$size" => value
                .and_then(Value::as_array)
                .map(|items| Some(items.len() as f64) == arg.as_f64())
                .unwrap_or(false),
            other => return Err(unsupported("query operator", other)),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality with array-contains semantics; `null` matches a missing field
fn equals(value: Option<&Value>, target: &Value) -> bool {
    match value {
        None => target.is_null(),
        Some(Value::Array(items)) if !target.is_array() => items.iter().any(|item| values_equal(item, target)),
        Some(v) => values_equal(v, target),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(x), Value::String(y)) => match (parse_datetime(x), parse_datetime(y)) {
            (Some(dx), Some(dy)) => dx == dy,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn compare_with(value: Option<&Value>, arg: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        None => false,
        Some(Value::Array(items)) => items.iter().any(|item| same_type_cmp(item, arg).map_or(false, &accept)),
        Some(v) => same_type_cmp(v, arg).map_or(false, accept),
    }
}

fn same_type_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(compare_strings(x, y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn regex_matches(value: Option<&Value>, pattern: &Value, options: Option<&Value>) -> Result<bool> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| PipelineError("$regex requires a string pattern".into()))?;
    let flags = options.and_then(Value::as_str).unwrap_or("");
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .ignore_whitespace(flags.contains('x'))
        .build()
        .map_err(|e| PipelineError(format!("Invalid $regex: {}", e)))?;

    Ok(match value {
        Some(Value::String(s)) => regex.is_match(s),
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).any(|s| regex.is_match(s)),
        _ => false,
    })
}

// ============================================================================
// Expressions
// ============================================================================

fn eval(doc: &Value, expr: &Value) -> Result<Value> {
    match expr {
        Value::String(s) if s == "$$ROOT" => Ok(doc.clone()),
        Value::String(s) if s.starts_with('$') => Ok(get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null)),
        Value::Array(items) => items
            .iter()
            .map(|item| eval(doc, item))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => match single_operator(map) {
            Some((op, arg)) => eval_operator(doc, op, arg),
            None => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), eval(doc, v)?)))
                .collect::<Result<Map<String, Value>>>()
                .map(Value::Object),
        },
        other => Ok(other.clone()),
    }
}

fn single_operator(map: &Map<String, Value>) -> Option<(&str, &Value)> {
    if map.len() != 1 {
        return None;
    }
    map.iter()
        .next()
        .filter(|(k, _)| k.starts_with('$'))
        .map(|(k, v)| (k.as_str(), v))
}

fn eval_args(doc: &Value, arg: &Value) -> Result<Vec<Value>> {
    match arg {
        Value::Array(items) => items.iter().map(|item| eval(doc, item)).collect(),
        other => Ok(vec![eval(doc, other)?]),
    }
}

/// Arguments of `$sum`-style expressions: a single array argument is spread
fn spread_args(doc: &Value, arg: &Value) -> Result<Vec<Value>> {
    let args = eval_args(doc, arg)?;
    match args.as_slice() {
        [Value::Array(items)] => Ok(items.clone()),
        _ => Ok(args),
    }
}

fn two_args(doc: &Value, op: &str, arg: &Value) -> Result<(Value, Value)> {
    let mut args = eval_args(doc, arg)?.into_iter();
    match (args.next(), args.next(), args.next()) {
        (Some(a), Some(b), None) => Ok((a, b)),
        _ => Err(PipelineError(format!("{} requires exactly two arguments", op))),
    }
}

fn eval_operator(doc: &Value, op: &str, arg: &Value) -> Result<Value> {
    match op {
        "$literal" => Ok(arg.clone()),
        "$add" => {
            let args = eval_args(doc, arg)?;
            if args.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            let mut total = 0.0;
            for value in &args {
                total += expect_number(value, op)?;
            }
            Ok(number(total))
        }
        "$subtract" => {
            let (a, b) = two_args(doc, op, arg)?;
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            if let (Some(x), Some(y)) = (a.as_str().and_then(parse_datetime), b.as_str().and_then(parse_datetime)) {
                return Ok(Value::from((x - y).num_milliseconds()));
            }
            Ok(number(expect_number(&a, op)? - expect_number(&b, op)?))
        }
        "$multiply" => {
            let args = eval_args(doc, arg)?;
            if args.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            let mut product = 1.0;
            for value in &args {
                product *= expect_number(value, op)?;
            }
            Ok(number(product))
        }
        "$divide" => {
            let (a, b) = two_args(doc, op, arg)?;
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let divisor = expect_number(&b, op)?;
            if divisor == 0.0 {
                return Err(PipelineError("$divide by zero".into()));
            }
            Ok(number(expect_number(&a, op)? / divisor))
        }
        "$round" => {
            let args = eval_args(doc, arg)?;
            let value = match args.first() {
                Some(Value::Null) | None => return Ok(Value::Null),
                Some(v) => expect_number(v, op)?,
            };
            let places = args.get(1).and_then(Value::as_i64).unwrap_or(0).clamp(0, 10) as i32;
            let factor = 10f64.powi(places);
            Ok(number((value * factor).round() / factor))
        }
        "$sum" => Ok(number(spread_args(doc, arg)?.iter().filter_map(as_number).sum())),
        "$avg" => {
            let values: Vec<f64> = spread_args(doc, arg)?.iter().filter_map(as_number).collect();
            if values.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(number(values.iter().sum::<f64>() / values.len() as f64))
            }
        }
        "$min" | "$max" => {
            let values = spread_args(doc, arg)?.into_iter().filter(|v| !v.is_null());
            let picked = if op == "$min" {
                values.min_by(compare_values)
            } else {
                values.max_by(compare_values)
            };
            Ok(picked.unwrap_or(Value::Null))
        }
        "$concat" => {
            let args = eval_args(doc, arg)?;
            let mut out = String::new();
            for value in &args {
                match value {
                    Value::Null => return Ok(Value::Null),
                    Value::String(s) => out.push_str(s),
                    _ => return Err(PipelineError("$concat only supports strings".into())),
                }
            }
            Ok(Value::String(out))
        }
        "$toLower" | "$toUpper" => {
            let value = eval_args(doc, arg)?.into_iter().next().unwrap_or(Value::Null);
            let text = display_string(&value);
            Ok(Value::String(if op == "$toLower" { text.to_lowercase() } else { text.to_uppercase() }))
        }
        "$toString" => {
            let value = eval_args(doc, arg)?.into_iter().next().unwrap_or(Value::Null);
            Ok(if value.is_null() { Value::Null } else { Value::String(display_string(&value)) })
        }
        "$ifNull" => {
            let args = eval_args(doc, arg)?;
            Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null))
        }
        "$size" => {
            let value = eval_args(doc, arg)?.into_iter().next().unwrap_or(Value::Null);
            value
                .as_array()
                .map(|items| Value::from(items.len()))
                .ok_or_else(|| PipelineError("$size requires an array".into()))
        }
        "$cond" => {
            let (condition, then, otherwise) = match arg {
                Value::Array(parts) if parts.len() == 3 => (&parts[0], &parts[1], &parts[2]),
                Value::Object(parts) => match (parts.get("if"), parts.get("then"), parts.get("else")) {
                    (Some(c), Some(t), Some(e)) => (c, t, e),
                    _ => return Err(PipelineError("$cond requires if, then and else".into())),
                },
                _ => return Err(PipelineError("$cond requires if, then and else".into())),
            };
            if truthy(&eval(doc, condition)?) {
                eval(doc, then)
            } else {
                eval(doc, otherwise)
            }
        }
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            let (a, b) = two_args(doc, op, arg)?;
            let ordering = compare_values(&a, &b);
            Ok(Value::Bool(match op {
                "$eq" => values_equal(&a, &b),
                "$ne" => !values_equal(&a, &b),
                "$gt" => ordering == Ordering::Greater,
                "$gte" => ordering != Ordering::Less,
                "$lt" => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            }))
        }
        "$and" => Ok(Value::Bool(eval_args(doc, arg)?.iter().all(truthy))),
        "$or" => Ok(Value::Bool(eval_args(doc, arg)?.iter().any(truthy))),
        "$not" => Ok(Value::Bool(!eval_args(doc, arg)?.first().map(truthy).unwrap_or(false))),
        "$year" | "$month" | "$dayOfMonth" | "$hour" => {
            let value = eval_args(doc, arg)?.into_iter().next().unwrap_or(Value::Null);
            let Some(date) = value.as_str().and_then(parse_datetime) else {
                return Ok(Value::Null);
            };
            Ok(Value::from(match op {
                "$year" => date.year() as i64,
                "$month" => date.month() as i64,
                "$dayOfMonth" => date.day() as i64,
                _ => date.hour() as i64,
            }))
        }
        "$dateToString" => {
            let format = arg.get("format").and_then(Value::as_str).unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");
            let date = arg
                .get("date")
                .map(|d| eval(doc, d))
                .transpose()?
                .unwrap_or(Value::Null);
            let Some(date) = date.as_str().and_then(parse_datetime) else {
                return Ok(Value::Null);
            };
            let mut out = String::new();
            write!(out, "{}", date.format(format))
                .map_err(|_| PipelineError(format!("Invalid $dateToString format '{}'", format)))?;
            Ok(Value::String(out))
        }
        other => Err(unsupported("expression operator", other)),
    }
}

fn expect_number(value: &Value, op: &str) -> Result<f64> {
    as_number(value).ok_or_else(|| PipelineError(format!("{} only supports numbers", op)))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Integral results stay integers so counts and sums serialize cleanly
fn number(value: f64) -> Value {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        _ => true,
    }
}

fn display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// $project, $addFields, $unwind, $lookup
// ============================================================================

fn project(doc: &Value, spec: &Value) -> Result<Value> {
    let spec = spec
        .as_object()
        .ok_or_else(|| PipelineError("$project requires an object".into()))?;

    let mut include_id = true;
    let mut inclusions = Vec::new();
    let mut exclusions = Vec::new();
    let mut computed = Vec::new();

    for (field, rule) in spec {
        let flag = match rule {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(n.as_f64() != Some(0.0)),
            _ => None,
        };
        match flag {
            Some(false) if field == "_id" => include_id = false,
            Some(true) => inclusions.push(field.as_str()),
            Some(false) => exclusions.push(field.as_str()),
            None => computed.push((field.as_str(), rule)),
        }
    }

    if !exclusions.is_empty() && (!inclusions.is_empty() || !computed.is_empty()) {
        return Err(PipelineError("$project cannot mix inclusion and exclusion".into()));
    }

    if inclusions.is_empty() && computed.is_empty() {
        let mut out = doc.clone();
        for field in exclusions {
            remove_path(&mut out, field);
        }
        if !include_id {
            remove_path(&mut out, "_id");
        }
        return Ok(out);
    }

    let mut out = Value::Object(Map::new());
    if include_id {
        if let Some(id) = get_path(doc, "_id") {
            set_path(&mut out, "_id", id.clone());
        }
    }
    for field in inclusions {
        if let Some(value) = get_path(doc, field) {
            set_path(&mut out, field, value.clone());
        }
    }
    for (field, rule) in computed {
        set_path(&mut out, field, eval(doc, rule)?);
    }
    Ok(out)
}

fn add_fields(mut doc: Value, spec: &Value) -> Result<Value> {
    let spec = spec
        .as_object()
        .ok_or_else(|| PipelineError("$addFields requires an object".into()))?;
    let values = spec
        .iter()
        .map(|(field, expr)| Ok((field.as_str(), eval(&doc, expr)?)))
        .collect::<Result<Vec<_>>>()?;
    for (field, value) in values {
        set_path(&mut doc, field, value);
    }
    Ok(doc)
}

fn field_list(spec: &Value, stage: &str) -> Result<Vec<String>> {
    match spec {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| PipelineError(format!("{} requires field names", stage)))
            })
            .collect(),
        _ => Err(PipelineError(format!("{} requires field names", stage))),
    }
}

fn unwind(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let (path, preserve) = match spec {
        Value::String(path) => (path.as_str(), false),
        Value::Object(options) => (
            options.get("path").and_then(Value::as_str).unwrap_or(""),
            options
                .get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        _ => ("", false),
    };
    let field = path
        .strip_prefix('$')
        .filter(|f| !f.is_empty())
        .ok_or_else(|| PipelineError("$unwind requires a '$field' path".into()))?;

    let mut out = Vec::new();
    for doc in docs {
        match get_path(&doc, field).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, field, item);
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

fn lookup(docs: Vec<Value>, spec: &Value, foreign: &HashMap<String, Vec<Value>>) -> Result<Vec<Value>> {
    let field = |name: &str| {
        spec.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError(format!("$lookup requires '{}'", name)))
    };
    let from = field("from")?;
    let local_field = field("localField")?;
    let foreign_field = field("foreignField")?;
    let target = field("as")?;

    let candidates = foreign.get(from).map(Vec::as_slice).unwrap_or(&[]);

    Ok(docs
        .into_iter()
        .map(|mut doc| {
            let local = get_path(&doc, local_field).cloned().unwrap_or(Value::Null);
            let joined: Vec<Value> = candidates
                .iter()
                .filter(|candidate| {
                    let value = get_path(candidate, foreign_field);
                    match &local {
                        Value::Array(keys) => keys.iter().any(|key| equals(value, key)),
                        key => equals(value, key),
                    }
                })
                .cloned()
                .collect();
            set_path(&mut doc, target, Value::Array(joined));
            doc
        })
        .collect())
}

// ============================================================================
// $group, $sort
// ============================================================================

enum Accumulator {
    Sum(f64),
    Avg { total: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Value),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
    Count(u64),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self> {
        Ok(match op {
            "$sum" => Accumulator::Sum(0.0),
            "$avg" => Accumulator::Avg { total: 0.0, count: 0 },
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(Value::Null),
            "$push" => Accumulator::Push(Vec::new()),
            "$addToSet" => Accumulator::AddToSet(Vec::new()),
            "$count" => Accumulator::Count(0),
            other => return Err(unsupported("accumulator", other)),
        })
    }

    fn add(&mut self, value: Value) {
        match self {
            Accumulator::Sum(total) => *total += as_number(&value).unwrap_or(0.0),
            Accumulator::Avg { total, count } => {
                if let Some(n) = as_number(&value) {
                    *total += n;
                    *count += 1;
                }
            }
            Accumulator::Min(current) => {
                if !value.is_null()
                    && current.as_ref().map_or(true, |c| compare_values(&value, c) == Ordering::Less)
                {
                    *current = Some(value);
                }
            }
            Accumulator::Max(current) => {
                if !value.is_null()
                    && current.as_ref().map_or(true, |c| compare_values(&value, c) == Ordering::Greater)
                {
                    *current = Some(value);
                }
            }
            Accumulator::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
            Accumulator::Last(current) => *current = value,
            Accumulator::Push(items) => items.push(value),
            Accumulator::AddToSet(items) => {
                if !items.iter().any(|item| values_equal(item, &value)) {
                    items.push(value);
                }
            }
            Accumulator::Count(count) => *count += 1,
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Sum(total) => number(total),
            Accumulator::Avg { total, count } if count > 0 => number(total / count as f64),
            Accumulator::Avg { .. } => Value::Null,
            Accumulator::Min(v) | Accumulator::Max(v) | Accumulator::First(v) => v.unwrap_or(Value::Null),
            Accumulator::Last(v) => v,
            Accumulator::Push(items) | Accumulator::AddToSet(items) => Value::Array(items),
            Accumulator::Count(count) => Value::from(count),
        }
    }
}

fn group(docs: &[Value], spec: &Value) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| PipelineError("$group requires an object".into()))?;
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| PipelineError("$group requires an _id".into()))?;

    let fields = spec
        .iter()
        .filter(|(field, _)| field.as_str() != "_id")
        .map(|(field, accumulator)| {
            accumulator
                .as_object()
                .and_then(single_operator)
                .map(|(op, arg)| (field.as_str(), op, arg))
                .ok_or_else(|| PipelineError(format!("$group field '{}' needs one accumulator", field)))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut keys: Vec<Value> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut states: Vec<Vec<Accumulator>> = Vec::new();

    for doc in docs {
        let key = eval(doc, id_expr)?;
        let slot = match slots.get(&key.to_string()) {
            Some(slot) => *slot,
            None => {
                let fresh = fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<Result<Vec<_>>>()?;
                slots.insert(key.to_string(), keys.len());
                keys.push(key);
                states.push(fresh);
                keys.len() - 1
            }
        };
        for ((_, op, arg), state) in fields.iter().zip(states[slot].iter_mut()) {
            let value = if *op == "$count" { Value::Null } else { eval(doc, arg)? };
            state.add(value);
        }
    }

    Ok(keys
        .into_iter()
        .zip(states)
        .map(|(key, accumulators)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), key);
            for ((field, _, _), state) in fields.iter().zip(accumulators) {
                out.insert(field.to_string(), state.finish());
            }
            Value::Object(out)
        })
        .collect())
}

fn sort(mut docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let keys = spec
        .as_object()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| PipelineError("$sort requires at least one field".into()))?
        .iter()
        .map(|(field, direction)| match direction.as_i64() {
            Some(1) => Ok((field.as_str(), false)),
            Some(-1) => Ok((field.as_str(), true)),
            _ => Err(PipelineError(format!("$sort direction for '{}' must be 1 or -1", field))),
        })
        .collect::<Result<Vec<_>>>()?;

    docs.sort_by(|a, b| {
        for (field, descending) in &keys {
            let ordering = compare_values(
                get_path(a, field).unwrap_or(&NULL),
                get_path(b, field).unwrap_or(&NULL),
            );
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(docs)
}

fn as_count(spec: &Value, stage: &str) -> Result<usize> {
    spec.as_u64()
        .or_else(|| spec.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
        .map(|n| n as usize)
        .ok_or_else(|| PipelineError(format!("{} requires a non-negative integer", stage)))
}

// ============================================================================
// Values
// ============================================================================

/// Total order over JSON values: null < numbers < strings < objects < arrays < booleans.
/// Among strings, timestamps come first.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Object(_) => 3,
            Value::Array(_) => 4,
            Value::Bool(_) => 5,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => compare_strings(x, y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(p, q)| compare_values(p, q))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => a.to_string().cmp(&b.to_string()).then(x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Timestamps sort before other strings and compare as instants among
/// themselves; everything else compares lexically.
fn compare_strings(a: &str, b: &str) -> Ordering {
    match (parse_datetime(a), parse_datetime(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// RFC 3339 timestamps, naive timestamps and plain dates, all read as UTC
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if s.len() < 10 || !s.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    if let Value::Object(map) = doc {
        match path.split_once('.') {
            None => {
                map.insert(path.to_string(), value);
            }
            Some((head, rest)) => {
                let child = map.entry(head.to_string()).or_insert(Value::Null);
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(doc: &mut Value, path: &str) {
    if let Value::Object(map) = doc {
        match path.split_once('.') {
            None => {
                map.remove(path);
            }
            Some((head, rest)) => {
                if let Some(child) = map.get_mut(head) {
                    remove_path(child, rest);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks() -> Vec<Value> {
        vec![
            json!({"block_id": "b1", "block_code": "F001-001", "farm_id": "f1", "status": "harvesting",
                   "kpi": {"actual_yield_kg": 120.5, "predicted_yield_kg": 100}, "tags": ["north", "tomato"],
                   "planted_date": "2026-03-01T08:00:00+00:00"}),
            json!({"block_id": "b2", "block_code": "F001-002", "farm_id": "f1", "status": "growing",
                   "kpi": {"actual_yield_kg": 0, "predicted_yield_kg": 80}, "tags": ["south"],
                   "planted_date": "2026-04-15T08:00:00+00:00"}),
            json!({"block_id": "b3", "block_code": "F002-001", "farm_id": "f2", "status": "harvesting",
                   "kpi": {"actual_yield_kg": 40, "predicted_yield_kg": 50}, "tags": [],
                   "planted_date": null}),
        ]
    }

    fn run(pipeline: Value) -> Vec<Value> {
        execute(blocks(), pipeline.as_array().unwrap(), &HashMap::new()).unwrap()
    }

    fn codes(docs: &[Value]) -> Vec<&str> {
        docs.iter().map(|d| d["block_code"].as_str().unwrap()).collect()
    }

    #[test]
    fn test_match_equality_and_comparison() {
        let out = run(json!([{"$match": {"status": "harvesting", "kpi.actual_yield_kg": {"$gt": 50}}}]));
        assert_eq!(codes(&out), vec!["F001-001"]);
    }

    #[test]
    fn test_match_logical_and_set_operators() {
        let out = run(json!([{"$match": {"$or": [{"farm_id": "f2"}, {"status": {"$in": ["growing"]}}]}}]));
        assert_eq!(codes(&out), vec!["F001-002", "F002-001"]);

        let out = run(json!([{"$match": {"status": {"$nin": ["growing", "empty"]}, "farm_id": {"$ne": "f2"}}}]));
        assert_eq!(codes(&out), vec!["F001-001"]);
    }

    #[test]
    fn test_match_array_contains_and_regex() {
        let out = run(json!([{"$match": {"tags": "tomato"}}]));
        assert_eq!(codes(&out), vec!["F001-001"]);

        let out = run(json!([{"$match": {"block_code": {"$regex": "^f001", "$options": "i"}}}]));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_match_dates_across_formats() {
        let out = run(json!([{"$match": {"planted_date": {"$gte": {"$date": "2026-04-01T00:00:00Z"}}}}]));
        assert_eq!(codes(&out), vec!["F001-002"]);

        let out = run(json!([{"$match": {"planted_date": null}}]));
        assert_eq!(codes(&out), vec!["F002-001"]);
    }

    #[test]
    fn test_group_accumulators() {
        let out = run(json!([
            {"$group": {
                "_id": "$farm_id",
                "total": {"$sum": "$kpi.actual_yield_kg"},
                "blocks": {"$sum": 1},
                "average": {"$avg": "$kpi.predicted_yield_kg"},
                "codes": {"$push": "$block_code"},
                "statuses": {"$addToSet": "$status"}
            }},
            {"$sort": {"_id": 1}}
        ]));

        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["_id"], json!("f1"));
        assert_eq!(out[0]["total"], json!(120.5));
        assert_eq!(out[0]["blocks"], json!(2));
        assert_eq!(out[0]["average"], json!(90));
        assert_eq!(out[0]["codes"], json!(["F001-001", "F001-002"]));
        assert_eq!(out[1]["statuses"], json!(["harvesting"]));
    }

    #[test]
    fn test_group_null_id_aggregates_everything() {
        let out = run(json!([{"$group": {"_id": null, "max": {"$max": "$kpi.actual_yield_kg"}, "n": {"$count": {}}}}]));
        assert_eq!(out, vec![json!({"_id": null, "max": 120.5, "n": 3})]);
    }

    #[test]
    fn test_sort_skip_limit_count() {
        let out = run(json!([{"$sort": {"kpi.predicted_yield_kg": -1}}, {"$skip": 1}, {"$limit": 1}]));
        assert_eq!(codes(&out), vec!["F001-002"]);

        let out = run(json!([{"$match": {"status": "harvesting"}}, {"$count": "harvesting_blocks"}]));
        assert_eq!(out, vec![json!({"harvesting_blocks": 2})]);

        let out = run(json!([{"$match": {"status": "cleaning"}}, {"$count": "n"}]));
        assert!(out.is_empty());
    }

    #[test]
    fn test_project_and_computed_fields() {
        let out = run(json!([
            {"$match": {"block_id": "b1"}},
            {"$project": {"block_code": 1, "efficiency": {"$round": [{"$multiply": [{"$divide": ["$kpi.actual_yield_kg", "$kpi.predicted_yield_kg"]}, 100]}, 1]}}}
        ]));
        assert_eq!(out, vec![json!({"block_code": "F001-001", "efficiency": 120.5})]);

        let out = run(json!([{"$match": {"block_id": "b2"}}, {"$project": {"kpi": 0, "tags": 0, "planted_date": 0}}]));
        assert_eq!(out, vec![json!({"block_id": "b2", "block_code": "F001-002", "farm_id": "f1", "status": "growing"})]);

        let err = execute(blocks(), &[json!({"$project": {"a": 1, "b": 0}})], &HashMap::new()).unwrap_err();
        assert!(err.0.contains("mix"));
    }

    #[test]
    fn test_add_fields_and_conditionals() {
        let out = run(json!([
            {"$addFields": {"label": {"$concat": ["$block_code", " (", {"$toUpper": "$status"}, ")"]},
                            "behind": {"$cond": [{"$lt": ["$kpi.actual_yield_kg", "$kpi.predicted_yield_kg"]}, true, false]}}},
            {"$match": {"behind": true}}
        ]));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["label"], json!("F001-002 (GROWING)"));
    }

    #[test]
    fn test_unwind() {
        let out = run(json!([{"$unwind": "$tags"}]));
        assert_eq!(out.len(), 3);
        assert_eq!(out[1]["tags"], json!("tomato"));

        let out = run(json!([{"$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true}}]));
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_lookup_joins_foreign_documents() {
        let mut foreign = HashMap::new();
        foreign.insert(
            "farms".to_string(),
            vec![json!({"farm_id": "f1", "name": "North Farm"}), json!({"farm_id": "f2", "name": "South Farm"})],
        );
        let pipeline = vec![
            json!({"$lookup": {"from": "farms", "localField": "farm_id", "foreignField": "farm_id", "as": "farm"}}),
            json!({"$unwind": "$farm"}),
            json!({"$project": {"block_code": 1, "farm_name": "$farm.name"}}),
        ];
        assert_eq!(lookup_targets(&pipeline), vec!["farms".to_string()]);

        let out = execute(blocks(), &pipeline, &foreign).unwrap();
        assert_eq!(out[2], json!({"block_code": "F002-001", "farm_name": "South Farm"}));
    }

    #[test]
    fn test_date_parts_in_group_key() {
        let out = run(json!([
            {"$match": {"planted_date": {"$ne": null}}},
            {"$group": {"_id": {"month": {"$month": "$planted_date"}}, "n": {"$sum": 1}}},
            {"$sort": {"_id.month": 1}}
        ]));
        assert_eq!(out[0]["_id"], json!({"month": 3}));
        assert_eq!(out[1]["_id"], json!({"month": 4}));
    }

    #[test]
    fn test_unsupported_operations_are_errors() {
        let err = execute(blocks(), &[json!({"$facet": {}})], &HashMap::new()).unwrap_err();
        assert_eq!(err, PipelineError("Unsupported stage '$facet'".into()));

        let err = execute(blocks(), &[json!({"$match": {"a": {"$elemMatch": {}}}})], &HashMap::new()).unwrap_err();
        assert!(err.0.contains("$elemMatch"));

        let err = execute(blocks(), &[json!({"$group": {"_id": null, "x": {"$median": "$a"}}})], &HashMap::new()).unwrap_err();
        assert!(err.0.contains("$median"));
    }

    #[test]
    fn test_normalize_extended_json() {
        let raw = json!({
            "_id": {"$oid": "65a1b2c3d4e5f6a7b8c9d0e1"},
            "created": {"$date": {"$numberLong": "0"}},
            "count": {"$numberLong": "42"},
            "yield": {"$numberDecimal": "12.5"},
            "nested": [{"at": {"$date": "2026-01-01T00:00:00Z"}}]
        });
        assert_eq!(
            normalize_extended_json(raw),
            json!({
                "_id": "65a1b2c3d4e5f6a7b8c9d0e1",
                "created": "1970-01-01T00:00:00+00:00",
                "count": 42,
                "yield": 12.5,
                "nested": [{"at": "2026-01-01T00:00:00Z"}]
            })
        );
    }

    #[test]
    fn test_string_order_is_transitive_across_dates_and_text() {
        let a = json!("2026-03-01T00:00:00+05:00");
        let b = json!("2026-02-28T20:00:00Z");
        let c = json!("2026-02-28T20:00:00Zx");

        assert_eq!(compare_values(&a, &b), Ordering::Less);
        assert_eq!(compare_values(&b, &c), Ordering::Less);
        assert_eq!(compare_values(&a, &c), Ordering::Less);
        assert_eq!(compare_values(&json!("2026-03-01"), &json!("2026-03-01T00:00:00Z")), Ordering::Equal);
    }

    #[test]
    fn test_sort_mixed_dates_and_text() {
        let docs = vec![
            json!({"k": "pending"}),
            json!({"k": "2026-02-28T20:00:00Zx"}),
            json!({"k": "2026-03-01T00:00:00+05:00"}),
            json!({"k": "2026-02-28T20:00:00Z"}),
            json!({"k": "2026-01-15"}),
        ];
        let keys = |docs: Vec<Value>| -> Vec<String> {
            docs.iter().map(|d| d["k"].as_str().unwrap().to_string()).collect()
        };

        let ascending = execute(docs.clone(), &[json!({"$sort": {"k": 1}})], &HashMap::new()).unwrap();
        assert_eq!(
            keys(ascending),
            [
                "2026-01-15",
                "2026-03-01T00:00:00+05:00",
                "2026-02-28T20:00:00Z",
                "2026-02-28T20:00:00Zx",
                "pending",
            ]
        );

        let mut reversed = docs;
        reversed.reverse();
        let again = execute(reversed, &[json!({"$sort": {"k": 1}})], &HashMap::new()).unwrap();
        let again = keys(again);
        assert_eq!(again[0], "2026-01-15");
        assert_eq!(again[4], "pending");
    }
}
