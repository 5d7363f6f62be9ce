//! Single-statement tier for simple pipelines

use docpipe_ir::{Pipeline, Stage};
use rusqlite::Connection;
use serde_json::Value;
use tracing::debug;

use crate::dispatch::DirectSqlTier;
use crate::sql::{order_by, quote_ident, CompiledQuery, Predicate, SortWindow};
use crate::store::query_documents;
use crate::{PipelineError, Result};

/// Runs `$match* ($sort|$skip|$limit)*` pipelines as one `SELECT`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleStatementTier;

impl SingleStatementTier {
    /// Build the statement, or `None` when the pipeline has another shape.
    pub fn plan(&self, source: &str, pipeline: &Pipeline) -> Result<Option<CompiledQuery>> {
        let stages = pipeline.stages();
        let leading = stages.iter().take_while(|s| matches!(s, Stage::Match(_))).count();
        let (window, consumed) = SortWindow::fold(&stages[leading..]);
        if leading + consumed != stages.len() {
            return Ok(None);
        }

        let mut predicate = Predicate::default();
        for stage in &stages[..leading] {
            if let Stage::Match(spec) = stage {
                match predicate.and(spec, "src") {
                    Ok(()) => {}
                    Err(PipelineError::Unsupported(reason)) => {
                        debug!(%reason, "direct SQL declined");
                        return Ok(None);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let mut sql = format!(
            "SELECT src.id AS id, src.data AS data FROM {} AS src{}{}",
            quote_ident(source),
            predicate.where_clause(),
            order_by(&window.keys, "src")
        );
        let mut params = predicate.into_params();
        sql.push_str(&window.limit_clause(&mut params));
        Ok(Some(CompiledQuery::new(sql, params)))
    }
}

impl DirectSqlTier for SingleStatementTier {
    fn try_execute(&self, conn: &Connection, source: &str, pipeline: &Pipeline) -> Result<Option<Vec<Value>>> {
        match self.plan(source, pipeline)? {
            Some(query) => {
                debug!(sql = %query.sql, "direct SQL");
                query_documents(conn, &query).map(Some)
            }
            None => Ok(None),
        }
    }
}
