//! In-memory pipeline evaluation
//!
//! Last tier: loads the source documents through the ordinary row decoder and
//! applies each stage in Rust. Understands a few things the SQL tiers reject
//! (`$exists`, `$and`/`$or`/`$nor`, literal `$addFields` values).

use docpipe_ir::{
    AssignedValue, Condition, FieldAssignment, FieldPath, LookupSpec, MatchOperator, MatchSpec, Pipeline,
    SortDirection, SortKey, Stage,
};
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::debug;

use crate::dispatch::FallbackEvaluator;
use crate::store::read_relation;
use crate::{PipelineError, Result};

static NULL: Value = Value::Null;

#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryEvaluator;

impl FallbackEvaluator for InMemoryEvaluator {
    fn evaluate(&self, conn: &Connection, source: &str, pipeline: &Pipeline) -> Result<Vec<Value>> {
        let mut documents = read_relation(conn, source)?;
        debug!(rows = documents.len(), stages = pipeline.len(), "evaluating pipeline in memory");

        for stage in pipeline.stages() {
            documents = apply(conn, stage, documents)?;
        }
        Ok(documents)
    }
}

fn apply(conn: &Connection, stage: &Stage, documents: Vec<Value>) -> Result<Vec<Value>> {
    match stage {
        Stage::Match(spec) => {
            let mut kept = Vec::with_capacity(documents.len());
            for doc in documents {
                if matches(&doc, spec)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        Stage::Unwind(path) => Ok(unwind(documents, path)),
        Stage::Lookup(spec) => lookup(conn, documents, spec),
        Stage::Sort(keys) => Ok(sort(documents, keys)),
        Stage::Skip(n) => Ok(documents.into_iter().skip(to_usize(*n)).collect()),
        Stage::Limit(n) => Ok(documents.into_iter().take(to_usize(*n)).collect()),
        Stage::AddFields(assignments) => add_fields(documents, assignments),
        Stage::Unsupported { name, .. } => Err(PipelineError::Unsupported(format!("stage '{}'", name))),
    }
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

fn resolve<'v>(doc: &'v Value, path: &FieldPath) -> Option<&'v Value> {
    let mut current = doc;
    for segment in path.segments() {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set `path`, creating (or replacing non-object) parents on the way.
fn set_field(doc: &mut Value, path: &FieldPath, value: Value) {
    let segments: Vec<&str> = path.segments().collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = doc;
    for segment in parents {
        let Value::Object(map) = current else {
            return;
        };
        let child = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        current = child;
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

fn matches(doc: &Value, spec: &MatchSpec) -> Result<bool> {
    for (field, condition) in &spec.conditions {
        let holds = if field.is_operator() {
            logical(doc, field.as_str(), condition)?
        } else {
            let actual = resolve(doc, field);
            match condition {
                Condition::Equals(expected) => equals(actual, expected),
                Condition::Operators(ops) => {
                    let mut all = true;
                    for (op, operand) in ops {
                        if !operator_holds(actual, op, operand)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
            }
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical(doc: &Value, op: &str, condition: &Condition) -> Result<bool> {
    let Condition::Equals(Value::Array(clauses)) = condition else {
        return Err(PipelineError::Unsupported(format!("top-level match operator '{}'", op)));
    };
    let mut results = Vec::with_capacity(clauses.len());
    for clause in clauses {
        results.push(matches(doc, &MatchSpec::parse(clause)?)?);
    }
    match op {
        "$and" => Ok(results.iter().all(|r| *r)),
        "$or" => Ok(results.iter().any(|r| *r)),
        "$nor" => Ok(!results.iter().any(|r| *r)),
        other => Err(PipelineError::Unsupported(format!("top-level match operator '{}'", other))),
    }
}

fn operator_holds(actual: Option<&Value>, op: &MatchOperator, operand: &Value) -> Result<bool> {
    let ordered = |accept: fn(Ordering) -> bool| match actual {
        Some(value) if !value.is_null() && type_rank(value) == type_rank(operand) => {
            accept(compare_values(value, operand))
        }
        _ => false,
    };

    Ok(match op {
        MatchOperator::Eq => equals(actual, operand),
        MatchOperator::Ne => !equals(actual, operand),
        MatchOperator::Gt => ordered(|o| o == Ordering::Greater),
        MatchOperator::Gte => ordered(|o| o != Ordering::Less),
        MatchOperator::Lt => ordered(|o| o == Ordering::Less),
        MatchOperator::Lte => ordered(|o| o != Ordering::Greater),
        MatchOperator::In => members(operand).iter().any(|v| equals(actual, v)),
        MatchOperator::Nin => !members(operand).iter().any(|v| equals(actual, v)),
        MatchOperator::Other(name) if name == "$exists" => {
            actual.is_some() == operand.as_bool().unwrap_or(true)
        }
        MatchOperator::Other(name) => {
            return Err(PipelineError::Unsupported(format!("match operator '{}'", name)))
        }
    })
}

fn members(operand: &Value) -> &[Value] {
    operand.as_array().map(Vec::as_slice).unwrap_or_default()
}

/// Missing fields equal `null`; numbers compare by value.
fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(value) => values_equal(value, expected),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order: null < numbers < strings < objects < arrays < booleans.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Object(_), Value::Object(_)) | (Value::Array(_), Value::Array(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn sort(mut documents: Vec<Value>, keys: &[SortKey]) -> Vec<Value> {
    documents.sort_by(|a, b| {
        for key in keys {
            let left = resolve(a, &key.field).unwrap_or(&NULL);
            let right = resolve(b, &key.field).unwrap_or(&NULL);
            let ordering = match key.direction {
                SortDirection::Ascending => compare_values(left, right),
                SortDirection::Descending => compare_values(left, right).reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    documents
}

fn unwind(documents: Vec<Value>, path: &FieldPath) -> Vec<Value> {
    let mut out = Vec::with_capacity(documents.len());
    for doc in documents {
        let items = match resolve(&doc, path) {
            Some(Value::Array(items)) => items.clone(),
            _ => continue,
        };
        for item in items {
            let mut copy = doc.clone();
            set_field(&mut copy, path, item);
            out.push(copy);
        }
    }
    out
}

fn lookup(conn: &Connection, documents: Vec<Value>, spec: &LookupSpec) -> Result<Vec<Value>> {
    let foreign = read_relation(conn, &spec.from)?;

    let mut out = Vec::with_capacity(documents.len());
    for mut doc in documents {
        let joined: Vec<Value> = match resolve(&doc, &spec.local_field) {
            Some(local) if !local.is_null() => foreign
                .iter()
                .filter(|f| resolve(f, &spec.foreign_field).is_some_and(|v| values_equal(v, local)))
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        set_field(&mut doc, &spec.as_field, Value::Array(joined));
        out.push(doc);
    }
    Ok(out)
}

fn add_fields(documents: Vec<Value>, assignments: &[FieldAssignment]) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(documents.len());
    for mut doc in documents {
        let input = doc.clone();
        for assignment in assignments {
            let value = match &assignment.value {
                AssignedValue::Field(path) => match resolve(&input, path) {
                    Some(value) => value.clone(),
                    None => continue,
                },
                AssignedValue::Expression(expr) => literal(expr)?,
            };
            set_field(&mut doc, &assignment.target, value);
        }
        out.push(doc);
    }
    Ok(out)
}

/// Constant value of an `$addFields` expression; operator expressions are rejected.
fn literal(expr: &Value) -> Result<Value> {
    match expr {
        Value::Object(map) if map.len() == 1 && map.contains_key("$literal") => {
            Ok(map["$literal"].clone())
        }
        Value::Object(map) => {
            if let Some(op) = map.keys().find(|k| k.starts_with('$')) {
                return Err(PipelineError::Unsupported(format!("expression operator '{}'", op)));
            }
            let mut fields = Map::with_capacity(map.len());
            for (key, value) in map {
                fields.insert(key.clone(), literal(value)?);
            }
            Ok(Value::Object(fields))
        }
        Value::Array(items) => items.iter().map(literal).collect::<Result<Vec<_>>>().map(Value::Array),
        Value::String(s) if s.starts_with('$') => {
            Err(PipelineError::Unsupported(format!("expression '{}'", s)))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(documents: Vec<Value>, spec: Value) -> Result<Vec<Value>> {
        let conn = Connection::open_in_memory()?;
        let pipeline = Pipeline::parse(&spec)?;
        let mut documents = documents;
        for stage in pipeline.stages() {
            documents = apply(&conn, stage, documents)?;
        }
        Ok(documents)
    }

    #[test]
    fn test_sort_orders_by_type_then_value() {
        let docs = vec![json!({"v": "b"}), json!({"v": 2}), json!({}), json!({"v": true}), json!({"v": 1.5})];
        let sorted = run(docs, json!([{"$sort": {"v": 1}}])).unwrap();
        let values: Vec<Value> = sorted.iter().map(|d| d.get("v").cloned().unwrap_or(Value::Null)).collect();
        assert_eq!(values, vec![json!(null), json!(1.5), json!(2), json!("b"), json!(true)]);
    }

    #[test]
    fn test_logical_operators_and_exists() {
        let docs = vec![json!({"a": 1}), json!({"a": 2, "b": 0}), json!({"a": 3})];
        let out = run(
            docs,
            json!([{"$match": {"$or": [{"a": 1}, {"b": {"$exists": true}}]}}]),
        )
        .unwrap();
        assert_eq!(out, vec![json!({"a": 1}), json!({"a": 2, "b": 0})]);
    }

    #[test]
    fn test_range_respects_type_family() {
        let docs = vec![json!({"a": "zzz"}), json!({"a": 5})];
        let out = run(docs, json!([{"$match": {"a": {"$gt": 1}}}])).unwrap();
        assert_eq!(out, vec![json!({"a": 5})]);
    }

    #[test]
    fn test_add_fields_literals_and_copies() {
        let docs = vec![json!({"a": {"b": 7}})];
        let out = run(
            docs,
            json!([{"$addFields": {"copy": "$a.b", "n": 1, "raw": {"$literal": "$x"}, "ghost": "$missing"}}]),
        )
        .unwrap();
        assert_eq!(out, vec![json!({"a": {"b": 7}, "copy": 7, "n": 1, "raw": "$x"})]);

        let err = run(vec![json!({})], json!([{"$addFields": {"t": {"$add": [1, 2]}}}])).unwrap_err();
        assert!(matches!(err, PipelineError::Unsupported(_)));
    }

    #[test]
    fn test_unwind_nested_path() {
        let docs = vec![json!({"a": {"t": [1, 2]}}), json!({"a": {"t": 3}})];
        let out = run(docs, json!([{"$unwind": "$a.t"}])).unwrap();
        assert_eq!(out, vec![json!({"a": {"t": 1}}), json!({"a": {"t": 2}})]);
    }

    #[test]
    fn test_unsupported_stage() {
        let err = run(vec![], json!([{"$group": {"_id": null}}])).unwrap_err();
        assert!(matches!(err, PipelineError::Unsupported(_)));
    }
}
