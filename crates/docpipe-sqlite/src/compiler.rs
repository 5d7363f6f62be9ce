//! Temp table pipeline compiler
//!
//! Reduces a pipeline to one relation by materializing each stage, or each
//! fused run of `$unwind` / `$sort`+`$skip`+`$limit` stages, into a temp
//! table. The whole run happens inside one [`PipelineScope`].

use docpipe_ir::{Pipeline, PipelineId, Stage};
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::namer::NameSource;
use crate::scope::PipelineScope;
use crate::sql::SortWindow;
use crate::stages::{self, preflight};
use crate::store::read_relation;
use crate::{PipelineError, Result};

/// True when every stage has a kind this compiler handles. Looks at stage
/// tags only; no database access.
pub fn can_compile(pipeline: &Pipeline) -> bool {
    pipeline
        .stages()
        .iter()
        .all(|stage| !matches!(stage, Stage::Unsupported { .. }))
}

/// Result of one compiled run.
#[derive(Debug, Clone)]
pub struct CompiledRun {
    pub pipeline_id: PipelineId,
    pub documents: Vec<Value>,
    /// Temp tables created by the run, in order; all dropped by the time this is returned.
    pub temp_tables: Vec<String>,
}

pub struct TempTableCompiler<'c> {
    conn: &'c Connection,
}

impl<'c> TempTableCompiler<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    #[instrument(name = "compiler::run", level = "debug", skip(self, pipeline), fields(stages = pipeline.len()))]
    pub fn run(&self, source: &str, pipeline: &Pipeline) -> Result<CompiledRun> {
        for stage in pipeline.stages() {
            preflight(stage)?;
        }

        let pipeline_id = pipeline.id();
        debug!(pipeline_id = %pipeline_id, "compiling pipeline into temp tables");

        let (documents, temp_tables) = PipelineScope::run(self.conn, &pipeline_id, |scope| {
            let current = reduce(scope, source, pipeline.stages())?;
            let documents = read_relation(scope.connection(), &current)?;
            Ok((documents, scope.tables().to_vec()))
        })?;

        Ok(CompiledRun {
            pipeline_id,
            documents,
            temp_tables,
        })
    }
}

/// Seed a copy of `source`, then fold the stages into it. Returns the name of
/// the final relation.
fn reduce(scope: &mut PipelineScope<'_>, source: &str, steps: &[Stage]) -> Result<String> {
    let mut current = scope.create_temp_table(NameSource::Source(source), &stages::seed_query(source))?;

    let mut i = 0;
    while i < steps.len() {
        let stage = &steps[i];
        let consumed = match stage {
            Stage::Match(spec) => {
                current = stages::compile_match(scope, &current, stage, spec)?;
                1
            }
            Stage::Lookup(spec) => {
                current = stages::compile_lookup(scope, &current, stage, spec)?;
                1
            }
            Stage::AddFields(assignments) => {
                current = stages::compile_add_fields(scope, &current, stage, assignments)?;
                1
            }
            Stage::Unwind(_) => {
                let run = steps[i..]
                    .iter()
                    .take_while(|s| matches!(s, Stage::Unwind(_)))
                    .count();
                current = stages::compile_unwind(scope, &current, &steps[i..i + run])?;
                run
            }
            Stage::Sort(_) | Stage::Skip(_) | Stage::Limit(_) => {
                let (window, run) = SortWindow::fold(&steps[i..]);
                current = stages::compile_window(scope, &current, &steps[i..i + run], &window)?;
                run
            }
            Stage::Unsupported { name, .. } => {
                return Err(PipelineError::Unsupported(format!("stage '{}'", name)));
            }
        };
        i += consumed;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_can_compile() {
        assert!(can_compile(&Pipeline::default()));
        assert!(can_compile(
            &Pipeline::parse(&json!([
                {"$match": {"a": 1}},
                {"$unwind": "$t"},
                {"$lookup": {"from": "b", "localField": "a", "foreignField": "a", "as": "bs"}},
                {"$sort": {"a": 1}},
                {"$skip": 1},
                {"$limit": 1},
                {"$addFields": {"c": "$a"}},
            ]))
            .unwrap()
        ));
        assert!(!can_compile(&Pipeline::parse(&json!([{"$unsupported": {}}])).unwrap()));
    }
}
