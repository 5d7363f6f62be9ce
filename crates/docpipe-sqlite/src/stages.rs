//! Stage compilers
//!
//! Each compiler reads the current relation and materializes the next one
//! through the scope. The `*_query` builders produce the `SELECT` alone so the
//! generated SQL can be inspected without a database.

use docpipe_ir::{AssignedValue, FieldAssignment, FieldPath, LookupSpec, MatchSpec, Stage};
use serde_json::{Map, Value};
use tracing::debug;

use crate::namer::NameSource;
use crate::scope::PipelineScope;
use crate::sql::{
    extract, extract_json, json_path, json_type, order_by, quote_ident, quote_literal, CompiledQuery, Predicate,
    SortWindow,
};
use crate::{PipelineError, Result};

/// Reject stage bodies the SQL tiers cannot express, before touching the database.
pub(crate) fn preflight(stage: &Stage) -> Result<()> {
    match stage {
        Stage::Match(spec) => Predicate::from_match(spec, "src").map(|_| ()),
        Stage::AddFields(assignments) => add_fields_query("src", assignments).map(|_| ()),
        Stage::Lookup(spec) if spec.as_field.is_identity() => {
            Err(PipelineError::Unsupported("$lookup into '_id'".to_string()))
        }
        Stage::Unsupported { name, .. } => Err(PipelineError::Unsupported(format!("stage '{}'", name))),
        Stage::Unwind(_) | Stage::Lookup(_) | Stage::Sort(_) | Stage::Skip(_) | Stage::Limit(_) => Ok(()),
    }
}

pub(crate) fn seed_query(source: &str) -> CompiledQuery {
    CompiledQuery::new(
        format!("SELECT src.id AS id, src.data AS data FROM {} AS src ORDER BY src.rowid", quote_ident(source)),
        vec![],
    )
}

pub(crate) fn match_query(current: &str, spec: &MatchSpec) -> Result<CompiledQuery> {
    let predicate = Predicate::from_match(spec, "src")?;
    let sql = format!(
        "SELECT src.id AS id, src.data AS data FROM {} AS src{} ORDER BY src.rowid",
        quote_ident(current),
        predicate.where_clause()
    );
    Ok(CompiledQuery::new(sql, predicate.into_params()))
}

/// One output row per combination of array elements at `paths`, all read
/// from the same input document. Rows whose target is not an array vanish.
pub(crate) fn unwind_query(current: &str, paths: &[&FieldPath]) -> CompiledQuery {
    let mut assignments = Vec::with_capacity(paths.len());
    let mut sources = vec![format!("{} AS src", quote_ident(current))];
    let mut guards = Vec::with_capacity(paths.len());
    let mut order = vec!["src.rowid".to_string()];

    for (i, path) in paths.iter().enumerate() {
        let alias = format!("u{i}");
        let literal = json_path(path);
        assignments.push(format!("{literal}, json(src.data -> {alias}.fullkey)"));
        sources.push(format!("json_each(src.data, {literal}) AS {alias}"));
        guards.push(format!("{} = 'array'", json_type("src", path)));
        order.push(format!("{alias}.key"));
    }

    let sql = format!(
        "SELECT src.id AS id, json_set(src.data, {}) AS data FROM {} WHERE {} ORDER BY {}",
        assignments.join(", "),
        sources.join(", "),
        guards.join(" AND "),
        order.join(", ")
    );
    CompiledQuery::new(sql, vec![])
}

/// Merge patch turning every missing or non-object ancestor of `path` into an
/// object, so a following `json_set` on `path` always lands.
fn ancestor_patch(path: &FieldPath) -> Option<String> {
    let segments: Vec<&str> = path.segments().collect();
    let (_, parents) = segments.split_last()?;
    if parents.is_empty() {
        return None;
    }
    let patch = parents.iter().rev().fold(Value::Object(Map::new()), |inner, segment| {
        let mut outer = Map::new();
        outer.insert((*segment).to_string(), inner);
        Value::Object(outer)
    });
    Some(quote_literal(&patch.to_string()))
}

/// `json_set(doc, path, value)` that replaces scalar ancestors of `path`.
fn set_path(doc: &str, path: &FieldPath, value: &str) -> String {
    let doc = match ancestor_patch(path) {
        Some(patch) => format!("json_patch({doc}, {patch})"),
        None => doc.to_string(),
    };
    format!("json_set({doc}, {}, {value})", json_path(path))
}

/// JSON type name of `path`; row ids are integers.
fn value_type(alias: &str, path: &FieldPath) -> String {
    if path.is_identity() {
        "'integer'".to_string()
    } else {
        json_type(alias, path)
    }
}

/// Foreign row as a document with `_id` first.
fn foreign_document(alias: &str) -> String {
    let fields = format!("json_remove({alias}.data, '$._id')");
    format!(
        "json('{{\"_id\":' || {alias}.id || CASE {fields} WHEN '{{}}' THEN '}}' ELSE ',' || substr({fields}, 2) END)"
    )
}

/// Attach every foreign document whose `foreign_field` equals the row's
/// `local_field` as an array under `as_field`; `[]` when nothing matches.
/// Values only join within the same type family.
pub(crate) fn lookup_query(current: &str, spec: &LookupSpec) -> CompiledQuery {
    let (foreign_type, local_type) = (value_type("f", &spec.foreign_field), value_type("src", &spec.local_field));
    let matches = format!(
        "SELECT json_group_array({} ORDER BY f.rowid) FROM {} AS f WHERE {} = {} \
         AND ({foreign_type} = {local_type} OR ({foreign_type} IN ('integer', 'real') AND {local_type} IN ('integer', 'real')))",
        foreign_document("f"),
        quote_ident(&spec.from),
        extract("f", &spec.foreign_field),
        extract("src", &spec.local_field),
    );
    let sql = format!(
        "SELECT src.id AS id, {} AS data FROM {} AS src ORDER BY src.rowid",
        set_path("src.data", &spec.as_field, &format!("json(COALESCE(({matches}), '[]'))")),
        quote_ident(current)
    );
    CompiledQuery::new(sql, vec![])
}

pub(crate) fn window_query(current: &str, window: &SortWindow) -> CompiledQuery {
    let mut params = Vec::new();
    let limit = window.limit_clause(&mut params);
    let sql = format!(
        "SELECT src.id AS id, src.data AS data FROM {} AS src{}{}",
        quote_ident(current),
        order_by(&window.keys, "src"),
        limit
    );
    CompiledQuery::new(sql, params)
}

/// Field copies only. Each assignment wraps the previous expression; values
/// are read from the input document, and a missing source leaves the target
/// untouched.
pub(crate) fn add_fields_query(current: &str, assignments: &[FieldAssignment]) -> Result<CompiledQuery> {
    let mut expr = "src.data".to_string();
    for assignment in assignments {
        if assignment.target.is_identity() || assignment.target.is_operator() {
            return Err(PipelineError::Unsupported(format!(
                "$addFields cannot assign '{}'",
                assignment.target
            )));
        }
        let source = match &assignment.value {
            AssignedValue::Field(path) => path,
            AssignedValue::Expression(value) => {
                return Err(PipelineError::Unsupported(format!(
                    "$addFields expression for '{}': {}",
                    assignment.target, value
                )))
            }
        };

        let set = set_path(&expr, &assignment.target, &extract_json("src", source));
        expr = if source.is_identity() {
            set
        } else {
            format!("CASE WHEN {} IS NULL THEN {expr} ELSE {set} END", json_type("src", source))
        };
    }

    let sql = format!(
        "SELECT src.id AS id, {expr} AS data FROM {} AS src ORDER BY src.rowid",
        quote_ident(current)
    );
    Ok(CompiledQuery::new(sql, vec![]))
}

pub(crate) fn compile_match(scope: &mut PipelineScope<'_>, current: &str, stage: &Stage, spec: &MatchSpec) -> Result<String> {
    let query = match_query(current, spec)?;
    scope.create_temp_table(NameSource::Stages(std::slice::from_ref(stage)), &query)
}

/// `group` must be a non-empty run of `$unwind` stages.
pub(crate) fn compile_unwind(scope: &mut PipelineScope<'_>, current: &str, group: &[Stage]) -> Result<String> {
    let paths: Vec<&FieldPath> = group
        .iter()
        .filter_map(|stage| match stage {
            Stage::Unwind(path) => Some(path),
            _ => None,
        })
        .collect();
    if paths.len() > 1 {
        debug!(fused = paths.len(), "fusing consecutive $unwind stages");
    }
    scope.create_temp_table(NameSource::Stages(group), &unwind_query(current, &paths))
}

pub(crate) fn compile_lookup(scope: &mut PipelineScope<'_>, current: &str, stage: &Stage, spec: &LookupSpec) -> Result<String> {
    scope.create_temp_table(NameSource::Stages(std::slice::from_ref(stage)), &lookup_query(current, spec))
}

pub(crate) fn compile_window(scope: &mut PipelineScope<'_>, current: &str, group: &[Stage], window: &SortWindow) -> Result<String> {
    if group.len() > 1 {
        debug!(fused = group.len(), offset = window.offset, limit = ?window.limit, "fusing sort/skip/limit run");
    }
    scope.create_temp_table(NameSource::Stages(group), &window_query(current, window))
}

pub(crate) fn compile_add_fields(
    scope: &mut PipelineScope<'_>,
    current: &str,
    stage: &Stage,
    assignments: &[FieldAssignment],
) -> Result<String> {
    let query = add_fields_query(current, assignments)?;
    scope.create_temp_table(NameSource::Stages(std::slice::from_ref(stage)), &query)
}
