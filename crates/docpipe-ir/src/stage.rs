//! Stage parsing and canonical serialization

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::*;

#[derive(Debug, Error, PartialEq)]
pub enum StageError {
    #[error("Pipeline must be a JSON array of stages")]
    NotAnArray,

    #[error("Stage {index} is invalid: {reason}")]
    InvalidStage { index: usize, reason: String },

    #[error("Malformed {stage} stage: {reason}")]
    Malformed { stage: StageKind, reason: String },
}

fn malformed(stage: StageKind, reason: impl Into<String>) -> StageError {
    StageError::Malformed {
        stage,
        reason: reason.into(),
    }
}

/// One pipeline step.
///
/// Closed over the kinds the SQL tiers know how to compile. Anything else
/// parses into `Unsupported` so callers can route it to another evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(MatchSpec),
    Unwind(FieldPath),
    Lookup(LookupSpec),
    Sort(Vec<SortKey>),
    Skip(u64),
    Limit(u64),
    AddFields(Vec<FieldAssignment>),
    Unsupported { name: String, body: Value },
}

impl Stage {
    /// Parse a single-key stage object such as `{"$match": {...}}`.
    pub fn parse(spec: &Value) -> Result<Stage, StageError> {
        let object = spec.as_object().ok_or_else(|| StageError::InvalidStage {
            index: 0,
            reason: "stage must be an object".to_string(),
        })?;
        if object.len() != 1 {
            return Err(StageError::InvalidStage {
                index: 0,
                reason: format!("stage must have exactly one key, found {}", object.len()),
            });
        }
        let Some((name, body)) = object.iter().next() else {
            return Err(StageError::InvalidStage {
                index: 0,
                reason: "empty stage".to_string(),
            });
        };

        match name.as_str() {
            "$match" => parse_match(body).map(Stage::Match),
            "$unwind" => parse_unwind(body).map(Stage::Unwind),
            "$lookup" => parse_lookup(body).map(Stage::Lookup),
            "$sort" => parse_sort(body).map(Stage::Sort),
            "$skip" => parse_count(StageKind::Skip, body, 0).map(Stage::Skip),
            "$limit" => parse_count(StageKind::Limit, body, 1).map(Stage::Limit),
            "$addFields" => parse_add_fields(body).map(Stage::AddFields),
            other => Ok(Stage::Unsupported {
                name: other.to_string(),
                body: body.clone(),
            }),
        }
    }

    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Match(_) => StageKind::Match,
            Stage::Unwind(_) => StageKind::Unwind,
            Stage::Lookup(_) => StageKind::Lookup,
            Stage::Sort(_) => StageKind::Sort,
            Stage::Skip(_) => StageKind::Skip,
            Stage::Limit(_) => StageKind::Limit,
            Stage::AddFields(_) => StageKind::AddFields,
            Stage::Unsupported { .. } => StageKind::Unsupported,
        }
    }

    /// Stable JSON form of this stage.
    ///
    /// Object keys are sorted at every level. Sort keys are the exception:
    /// their order is meaningful, so they are written as `[field, direction]`
    /// pairs.
    pub fn canonical(&self) -> Value {
        let body = match self {
            Stage::Match(spec) => {
                let mut fields = Map::new();
                for (field, condition) in &spec.conditions {
                    let value = match condition {
                        Condition::Equals(value) => value.clone(),
                        Condition::Operators(ops) => Value::Object(
                            ops.iter()
                                .map(|(op, value)| (op.as_str().to_string(), value.clone()))
                                .collect(),
                        ),
                    };
                    fields.insert(field.to_string(), value);
                }
                Value::Object(fields)
            }
            Stage::Unwind(path) => json!(format!("${path}")),
            Stage::Lookup(spec) => json!({
                "from": spec.from,
                "localField": spec.local_field.as_str(),
                "foreignField": spec.foreign_field.as_str(),
                "as": spec.as_field.as_str(),
            }),
            Stage::Sort(keys) => {
                let pairs: Vec<Value> = keys
                    .iter()
                    .map(|key| json!([key.field.as_str(), key.direction.as_i64()]))
                    .collect();
                return json!({ "$sort": pairs });
            }
            Stage::Skip(n) | Stage::Limit(n) => json!(n),
            Stage::AddFields(assignments) => Value::Object(
                assignments
                    .iter()
                    .map(|a| {
                        let value = match &a.value {
                            AssignedValue::Field(path) => json!(format!("${path}")),
                            AssignedValue::Expression(expr) => expr.clone(),
                        };
                        (a.target.to_string(), value)
                    })
                    .collect(),
            ),
            Stage::Unsupported { body, .. } => body.clone(),
        };

        let name = match self {
            Stage::Unsupported { name, .. } => name.clone(),
            other => format!("${}", other.kind()),
        };
        let mut stage = Map::new();
        stage.insert(name, sort_keys(&body));
        Value::Object(stage)
    }
}

/// Rebuild `value` with every object's keys in lexicographic order.
pub fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, sort_keys(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

impl MatchSpec {
    /// Parse a predicate object as found in the body of `$match`.
    pub fn parse(body: &Value) -> Result<Self, StageError> {
        parse_match(body)
    }
}

fn parse_match(body: &Value) -> Result<MatchSpec, StageError> {
    let object = body
        .as_object()
        .ok_or_else(|| malformed(StageKind::Match, "predicate must be an object"))?;

    let mut conditions = Vec::with_capacity(object.len());
    for (field, value) in object {
        let condition = match value {
            Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
                let mut parsed = Vec::with_capacity(ops.len());
                for (op, operand) in ops {
                    let op = MatchOperator::parse(op);
                    if matches!(op, MatchOperator::In | MatchOperator::Nin) && !operand.is_array() {
                        return Err(malformed(
                            StageKind::Match,
                            format!("{} on '{}' requires an array", op.as_str(), field),
                        ));
                    }
                    parsed.push((op, operand.clone()));
                }
                Condition::Operators(parsed)
            }
            other => Condition::Equals(other.clone()),
        };
        conditions.push((FieldPath::new(field.clone()), condition));
    }
    Ok(MatchSpec { conditions })
}

fn parse_unwind(body: &Value) -> Result<FieldPath, StageError> {
    let reference = match body {
        Value::String(s) => s.as_str(),
        Value::Object(options) => {
            for key in options.keys() {
                if key != "path" {
                    return Err(malformed(
                        StageKind::Unwind,
                        format!("option '{}' is not supported", key),
                    ));
                }
            }
            options
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(StageKind::Unwind, "missing 'path'"))?
        }
        _ => return Err(malformed(StageKind::Unwind, "expected a field reference")),
    };
    FieldPath::from_reference(reference).ok_or_else(|| {
        malformed(
            StageKind::Unwind,
            format!("'{}' is not a $-prefixed field reference", reference),
        )
    })
}

fn parse_lookup(body: &Value) -> Result<LookupSpec, StageError> {
    let object = body
        .as_object()
        .ok_or_else(|| malformed(StageKind::Lookup, "body must be an object"))?;
    let required = |key: &str| -> Result<String, StageError> {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| malformed(StageKind::Lookup, format!("missing string '{}'", key)))
    };

    Ok(LookupSpec {
        from: required("from")?,
        local_field: FieldPath::new(required("localField")?),
        foreign_field: FieldPath::new(required("foreignField")?),
        as_field: FieldPath::new(required("as")?),
    })
}

fn parse_sort(body: &Value) -> Result<Vec<SortKey>, StageError> {
    let object = body
        .as_object()
        .ok_or_else(|| malformed(StageKind::Sort, "body must be an object"))?;
    if object.is_empty() {
        return Err(malformed(StageKind::Sort, "at least one sort key is required"));
    }

    object
        .iter()
        .map(|(field, direction)| {
            let direction = match direction.as_i64() {
                Some(1) => SortDirection::Ascending,
                Some(-1) => SortDirection::Descending,
                _ => {
                    return Err(malformed(
                        StageKind::Sort,
                        format!("direction for '{}' must be 1 or -1", field),
                    ))
                }
            };
            Ok(SortKey {
                field: FieldPath::new(field.clone()),
                direction,
            })
        })
        .collect()
}

fn parse_count(kind: StageKind, body: &Value, min: u64) -> Result<u64, StageError> {
    match body.as_u64() {
        Some(n) if n >= min => Ok(n),
        _ => Err(malformed(
            kind,
            format!("expected an integer >= {}, got {}", min, body),
        )),
    }
}

fn parse_add_fields(body: &Value) -> Result<Vec<FieldAssignment>, StageError> {
    let object = body
        .as_object()
        .ok_or_else(|| malformed(StageKind::AddFields, "body must be an object"))?;
    if object.is_empty() {
        return Err(malformed(StageKind::AddFields, "at least one field is required"));
    }

    Ok(object
        .iter()
        .map(|(target, value)| {
            let value = match value.as_str().and_then(FieldPath::from_reference) {
                Some(path) => AssignedValue::Field(path),
                None => AssignedValue::Expression(value.clone()),
            };
            FieldAssignment {
                target: FieldPath::new(target.clone()),
                value,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_match_operators() {
        let stage = Stage::parse(&json!({"$match": {"a": {"$gte": 2, "$lt": 9}, "b": "x"}})).unwrap();
        let Stage::Match(spec) = stage else { panic!("expected match") };
        assert_eq!(spec.conditions.len(), 2);
        assert_eq!(
            spec.conditions[0].1,
            Condition::Operators(vec![
                (MatchOperator::Gte, json!(2)),
                (MatchOperator::Lt, json!(9)),
            ])
        );
        assert_eq!(spec.conditions[1].1, Condition::Equals(json!("x")));
    }

    #[test]
    fn test_match_embedded_document_is_equality() {
        let stage = Stage::parse(&json!({"$match": {"a": {"x": 1}}})).unwrap();
        let Stage::Match(spec) = stage else { panic!("expected match") };
        assert_eq!(spec.conditions[0].1, Condition::Equals(json!({"x": 1})));
    }

    #[test]
    fn test_in_requires_array() {
        let err = Stage::parse(&json!({"$match": {"a": {"$in": 3}}})).unwrap_err();
        assert!(matches!(err, StageError::Malformed { stage: StageKind::Match, .. }));
    }

    #[test]
    fn test_parse_unwind_forms() {
        assert_eq!(
            Stage::parse(&json!({"$unwind": "$tags"})).unwrap(),
            Stage::Unwind(FieldPath::new("tags"))
        );
        assert_eq!(
            Stage::parse(&json!({"$unwind": {"path": "$a.b"}})).unwrap(),
            Stage::Unwind(FieldPath::new("a.b"))
        );
        assert!(Stage::parse(&json!({"$unwind": "tags"})).is_err());
        assert!(Stage::parse(&json!({"$unwind": {"path": "$t", "preserveNullAndEmptyArrays": true}})).is_err());
    }

    #[test]
    fn test_lookup_missing_key_is_malformed() {
        let err = Stage::parse(&json!({"$lookup": {"from": "b", "localField": "x", "as": "y"}})).unwrap_err();
        assert_eq!(
            err,
            StageError::Malformed {
                stage: StageKind::Lookup,
                reason: "missing string 'foreignField'".to_string(),
            }
        );
    }

    #[test]
    fn test_sort_preserves_key_order() {
        let stage = Stage::parse(&json!({"$sort": {"b": -1, "a": 1}})).unwrap();
        let Stage::Sort(keys) = &stage else { panic!("expected sort") };
        assert_eq!(keys[0].field.as_str(), "b");
        assert_eq!(keys[0].direction, SortDirection::Descending);
        assert_eq!(stage.canonical(), json!({"$sort": [["b", -1], ["a", 1]]}));
    }

    #[test]
    fn test_limit_and_skip_bounds() {
        assert_eq!(Stage::parse(&json!({"$skip": 0})).unwrap(), Stage::Skip(0));
        assert!(Stage::parse(&json!({"$limit": 0})).is_err());
        assert!(Stage::parse(&json!({"$skip": -1})).is_err());
        assert!(Stage::parse(&json!({"$limit": "5"})).is_err());
    }

    #[test]
    fn test_unknown_stage_is_unsupported() {
        let stage = Stage::parse(&json!({"$group": {"_id": "$a"}})).unwrap();
        assert_eq!(stage.kind(), StageKind::Unsupported);
    }

    #[test]
    fn test_multi_key_stage_rejected() {
        assert!(matches!(
            Stage::parse(&json!({"$skip": 1, "$limit": 2})),
            Err(StageError::InvalidStage { .. })
        ));
    }

    #[test]
    fn test_canonical_sorts_object_keys() {
        let a = Stage::parse(&json!({"$match": {"b": 1, "a": {"$lt": 3, "$gt": 1}}})).unwrap();
        let b = Stage::parse(&json!({"$match": {"a": {"$gt": 1, "$lt": 3}, "b": 1}})).unwrap();
        assert_eq!(
            serde_json::to_string(&a.canonical()).unwrap(),
            serde_json::to_string(&b.canonical()).unwrap()
        );
    }

    #[test]
    fn test_add_fields_classifies_values() {
        let stage = Stage::parse(&json!({"$addFields": {"copy": "$a.b", "lit": 5}})).unwrap();
        let Stage::AddFields(assignments) = stage else { panic!("expected addFields") };
        assert_eq!(assignments[0].value, AssignedValue::Field(FieldPath::new("a.b")));
        assert_eq!(assignments[1].value, AssignedValue::Expression(json!(5)));
    }
}
