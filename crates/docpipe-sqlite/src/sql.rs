//! SQL fragments shared by the compiled tiers
//!
//! Documents live in a `data` TEXT column and are addressed with SQLite's
//! JSON1 functions. The identity field `_id` is never read from the document;
//! it maps to the `id` column.

use docpipe_ir::{Condition, FieldPath, MatchOperator, MatchSpec, SortDirection, SortKey, Stage};
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use serde_json::Value;

use crate::{PipelineError, Result};

/// A statement plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl CompiledQuery {
    pub fn new(sql: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Int(i64),
    Float(f64),
    String(String),
    Null,
}

impl QueryParam {
    /// Bind a JSON value the way `json_extract` would return it: booleans
    /// become 0/1, arrays and objects become their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => QueryParam::Null,
            Value::Bool(b) => QueryParam::Int(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => QueryParam::Int(i),
                None => QueryParam::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => QueryParam::String(s.clone()),
            other => QueryParam::String(other.to_string()),
        }
    }

    pub fn count(n: u64) -> Self {
        QueryParam::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl ToSql for QueryParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            QueryParam::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            QueryParam::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            QueryParam::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            QueryParam::Null => ToSqlOutput::Owned(SqlValue::Null),
        })
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// SQL string literal holding the JSON path for `path`, e.g. `'$.a.b'`.
pub(crate) fn json_path(path: &FieldPath) -> String {
    let mut out = String::from("$");
    for segment in path.segments() {
        out.push('.');
        if !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            out.push_str(segment);
        } else {
            out.push('"');
            out.push_str(&segment.replace('"', "\\\""));
            out.push('"');
        }
    }
    quote_literal(&out)
}

/// Scalar value of `path` in the row aliased `alias`.
pub(crate) fn extract(alias: &str, path: &FieldPath) -> String {
    if path.is_identity() {
        format!("{alias}.id")
    } else {
        format!("json_extract({alias}.data, {})", json_path(path))
    }
}

/// Value of `path` as JSON, suitable as a `json_set` value. Wrapped in
/// `json()` so strings are not re-quoted on insertion.
pub(crate) fn extract_json(alias: &str, path: &FieldPath) -> String {
    if path.is_identity() {
        format!("{alias}.id")
    } else {
        format!("json({alias}.data -> {})", json_path(path))
    }
}

pub(crate) fn json_type(alias: &str, path: &FieldPath) -> String {
    format!("json_type({alias}.data, {})", json_path(path))
}

/// Conjunction of match conditions with their bound parameters.
#[derive(Debug, Default)]
pub(crate) struct Predicate {
    clauses: Vec<String>,
    params: Vec<QueryParam>,
}

impl Predicate {
    pub fn from_match(spec: &MatchSpec, alias: &str) -> Result<Self> {
        let mut predicate = Self::default();
        predicate.and(spec, alias)?;
        Ok(predicate)
    }

    pub fn and(&mut self, spec: &MatchSpec, alias: &str) -> Result<()> {
        for (field, condition) in &spec.conditions {
            if field.is_operator() {
                return Err(PipelineError::Unsupported(format!(
                    "top-level match operator '{}'",
                    field
                )));
            }
            match condition {
                Condition::Equals(value) => self.push_eq(alias, field, value),
                Condition::Operators(ops) => {
                    for (op, value) in ops {
                        match op {
                            MatchOperator::Eq => self.push_eq(alias, field, value),
                            MatchOperator::Ne => self.push_ne(alias, field, value),
                            MatchOperator::Gt => self.push_range(alias, field, ">", value),
                            MatchOperator::Gte => self.push_range(alias, field, ">=", value),
                            MatchOperator::Lt => self.push_range(alias, field, "<", value),
                            MatchOperator::Lte => self.push_range(alias, field, "<=", value),
                            MatchOperator::In => self.push_membership(alias, field, value, false)?,
                            MatchOperator::Nin => self.push_membership(alias, field, value, true)?,
                            MatchOperator::Other(name) => {
                                return Err(PipelineError::Unsupported(format!(
                                    "match operator '{}' on '{}'",
                                    name, field
                                )))
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn push_eq(&mut self, alias: &str, field: &FieldPath, value: &Value) {
        let clause = self.equality(alias, field, value);
        self.clauses.push(clause);
    }

    // Missing fields satisfy $ne.
    fn push_ne(&mut self, alias: &str, field: &FieldPath, value: &Value) {
        let clause = match value {
            Value::Null => format!("{} IS NOT NULL", extract(alias, field)),
            _ => format!("COALESCE({}, 0) = 0", self.equality(alias, field, value)),
        };
        self.clauses.push(clause);
    }

    /// Typed equality: a value only equals values of its own type family, so
    /// `true` never equals `1` and `"[1]"` never equals `[1]`.
    fn equality(&mut self, alias: &str, field: &FieldPath, value: &Value) -> String {
        let expr = extract(alias, field);
        if value.is_null() {
            return format!("{expr} IS NULL");
        }
        if field.is_identity() {
            if !value.is_number() {
                return "0".to_string();
            }
            self.params.push(QueryParam::from_json(value));
            return format!("{expr} = ?");
        }
        if let Value::Bool(b) = value {
            return format!("{} = '{}'", json_type(alias, field), b);
        }
        self.params.push(QueryParam::from_json(value));
        format!("({} IN ({}) AND {expr} = ?)", json_type(alias, field), type_family(value))
    }

    // Range comparisons only hold between values of the same type family;
    // nothing is ordered against null.
    fn push_range(&mut self, alias: &str, field: &FieldPath, op: &str, value: &Value) {
        let expr = extract(alias, field);
        let clause = if value.is_null() || (field.is_identity() && !value.is_number()) {
            "0".to_string()
        } else if field.is_identity() {
            self.params.push(QueryParam::from_json(value));
            format!("{expr} {op} ?")
        } else {
            self.params.push(QueryParam::from_json(value));
            format!("({} IN ({}) AND {expr} {op} ?)", json_type(alias, field), type_family(value))
        };
        self.clauses.push(clause);
    }

    /// Members are grouped by type family, each group guarded by `json_type`
    /// and tested with one placeholder per member. A null member matches
    /// missing fields.
    fn push_membership(&mut self, alias: &str, field: &FieldPath, values: &Value, negate: bool) -> Result<()> {
        let items = values.as_array().ok_or_else(|| {
            PipelineError::Unsupported(format!("non-array membership operand on '{}'", field))
        })?;
        let expr = extract(alias, field);

        let mut has_null = false;
        let mut groups: Vec<(&'static str, Vec<&Value>)> = Vec::new();
        for item in items {
            if item.is_null() {
                has_null = true;
                continue;
            }
            if field.is_identity() && !item.is_number() {
                continue;
            }
            let family = type_family(item);
            match groups.iter_mut().find(|(f, _)| *f == family) {
                Some((_, members)) => members.push(item),
                None => groups.push((family, vec![item])),
            }
        }

        let mut alternatives = Vec::new();
        if has_null {
            alternatives.push(format!("{expr} IS NULL"));
        }
        for (family, members) in groups {
            let placeholders = vec!["?"; members.len()].join(", ");
            self.params.extend(members.into_iter().map(QueryParam::from_json));
            alternatives.push(if field.is_identity() {
                format!("{expr} IN ({placeholders})")
            } else {
                format!("({} IN ({family}) AND {expr} IN ({placeholders}))", json_type(alias, field))
            });
        }

        let any = if alternatives.is_empty() {
            "0".to_string()
        } else {
            format!("({})", alternatives.join(" OR "))
        };
        self.clauses.push(if negate { format!("COALESCE({any}, 0) = 0") } else { any });
        Ok(())
    }

    /// ` WHERE ...`, or nothing for an empty conjunction.
    pub fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn into_params(self) -> Vec<QueryParam> {
        self.params
    }
}

/// `json_type` names a value of this type can have inside a document.
fn type_family(value: &Value) -> &'static str {
    match value {
        Value::Null => "'null'",
        Value::Bool(_) => "'true', 'false'",
        Value::Number(_) => "'integer', 'real'",
        Value::String(_) => "'text'",
        Value::Array(_) => "'array'",
        Value::Object(_) => "'object'",
    }
}

/// Sort rank of a field's type: null or missing < numbers < strings <
/// objects < arrays < booleans.
fn type_rank(alias: &str, path: &FieldPath) -> String {
    format!(
        "CASE {} WHEN 'integer' THEN 1 WHEN 'real' THEN 1 WHEN 'text' THEN 2 WHEN 'object' THEN 3 \
         WHEN 'array' THEN 4 WHEN 'true' THEN 5 WHEN 'false' THEN 5 ELSE 0 END",
        json_type(alias, path)
    )
}

/// ` ORDER BY ...` over `keys`, ending with the input order as tie-breaker.
/// Document fields sort by type rank first, then by value within the type.
pub(crate) fn order_by(keys: &[SortKey], alias: &str) -> String {
    let mut terms = Vec::with_capacity(keys.len() * 2 + 1);
    for key in keys {
        let direction = match key.direction {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        };
        if !key.field.is_identity() {
            terms.push(format!("{} {direction}", type_rank(alias, &key.field)));
        }
        terms.push(format!("{} {direction}", extract(alias, &key.field)));
    }
    terms.push(format!("{alias}.rowid"));
    format!(" ORDER BY {}", terms.join(", "))
}

/// A run of `$sort`, `$skip` and `$limit` folded into one ordered window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortWindow {
    pub keys: Vec<SortKey>,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl SortWindow {
    /// Fold the leading window stages of `stages`. Returns the window and the
    /// number of stages it absorbed.
    pub fn fold(stages: &[Stage]) -> (Self, usize) {
        let mut window = Self::default();
        let mut consumed = 0;
        for stage in stages {
            if !window.absorb(stage) {
                break;
            }
            consumed += 1;
        }
        (window, consumed)
    }

    /// Absorb one stage. A sort after a skip or limit cannot share the window.
    pub fn absorb(&mut self, stage: &Stage) -> bool {
        match stage {
            Stage::Sort(keys) => {
                if self.offset > 0 || self.limit.is_some() {
                    return false;
                }
                let mut merged = keys.clone();
                merged.extend(
                    self.keys
                        .iter()
                        .filter(|old| !keys.iter().any(|k| k.field == old.field))
                        .cloned(),
                );
                self.keys = merged;
                true
            }
            Stage::Skip(n) => {
                self.offset = self.offset.saturating_add(*n);
                self.limit = self.limit.map(|limit| limit.saturating_sub(*n));
                true
            }
            Stage::Limit(n) => {
                self.limit = Some(self.limit.map_or(*n, |limit| limit.min(*n)));
                true
            }
            _ => false,
        }
    }

    /// ` LIMIT ? OFFSET ?` with its parameters. SQLite needs a LIMIT before
    /// OFFSET, so an offset alone uses `LIMIT -1`.
    pub(crate) fn limit_clause(&self, params: &mut Vec<QueryParam>) -> String {
        match (self.limit, self.offset) {
            (None, 0) => String::new(),
            (Some(limit), 0) => {
                params.push(QueryParam::count(limit));
                " LIMIT ?".to_string()
            }
            (Some(limit), offset) => {
                params.push(QueryParam::count(limit));
                params.push(QueryParam::count(offset));
                " LIMIT ? OFFSET ?".to_string()
            }
            (None, offset) => {
                params.push(QueryParam::count(offset));
                " LIMIT -1 OFFSET ?".to_string()
            }
        }
    }
}
