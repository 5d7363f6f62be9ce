//! Three-tier pipeline dispatch
//!
//! Tier 1 tries one SQL statement, tier 2 compiles into temp tables, tier 3
//! evaluates in memory. Any failure in tier 1 or 2 moves on to the next tier;
//! only the last tier's failure reaches the caller.

use docpipe_ir::Pipeline;
use rusqlite::Connection;
use serde_json::Value;
use std::fmt;
use tracing::{info, instrument, warn};

use crate::compiler::{can_compile, TempTableCompiler};
use crate::direct::SingleStatementTier;
use crate::fallback::InMemoryEvaluator;
use crate::Result;

/// Tier 1: answer the whole pipeline with a single statement, or decline.
pub trait DirectSqlTier {
    fn try_execute(&self, conn: &Connection, source: &str, pipeline: &Pipeline) -> Result<Option<Vec<Value>>>;
}

/// Tier 3: evaluate any pipeline outside the SQL engine.
pub trait FallbackEvaluator {
    fn evaluate(&self, conn: &Connection, source: &str, pipeline: &Pipeline) -> Result<Vec<Value>>;
}

/// Per-call dispatch switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Skip tiers 1 and 2 unconditionally.
    pub force_fallback: bool,
    /// Try tier 1 before compiling.
    pub direct_sql: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            force_fallback: false,
            direct_sql: true,
        }
    }
}

impl DispatchOptions {
    pub fn forced_fallback() -> Self {
        Self {
            force_fallback: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    DirectSql,
    TempTable,
    Fallback,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::DirectSql => "direct_sql",
            Tier::TempTable => "temp_table",
            Tier::Fallback => "fallback",
        })
    }
}

/// Documents produced by a pipeline and the tier that produced them.
#[derive(Debug, Clone)]
pub struct Execution {
    pub tier: Tier,
    pub documents: Vec<Value>,
}

pub struct Dispatcher<'c> {
    conn: &'c Connection,
    direct: Box<dyn DirectSqlTier + 'c>,
    fallback: Box<dyn FallbackEvaluator + 'c>,
}

impl<'c> Dispatcher<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            direct: Box::new(SingleStatementTier),
            fallback: Box::new(InMemoryEvaluator),
        }
    }

    pub fn with_direct(mut self, direct: impl DirectSqlTier + 'c) -> Self {
        self.direct = Box::new(direct);
        self
    }

    pub fn with_fallback(mut self, fallback: impl FallbackEvaluator + 'c) -> Self {
        self.fallback = Box::new(fallback);
        self
    }

    #[instrument(name = "dispatch::execute", level = "debug", skip(self, pipeline), fields(pipeline_id = %pipeline.id()))]
    pub fn execute(&self, source: &str, pipeline: &Pipeline, options: DispatchOptions) -> Result<Execution> {
        if !options.force_fallback {
            if options.direct_sql {
                match self.direct.try_execute(self.conn, source, pipeline) {
                    Ok(Some(documents)) => return Ok(finish(Tier::DirectSql, documents)),
                    Ok(None) => {}
                    Err(err) => warn!(tier = %Tier::DirectSql, error = %err, "tier failed, trying next"),
                }
            }

            if can_compile(pipeline) {
                match TempTableCompiler::new(self.conn).run(source, pipeline) {
                    Ok(run) => return Ok(finish(Tier::TempTable, run.documents)),
                    Err(err) => warn!(tier = %Tier::TempTable, error = %err, "tier failed, trying next"),
                }
            }
        }

        let documents = self.fallback.evaluate(self.conn, source, pipeline)?;
        Ok(finish(Tier::Fallback, documents))
    }
}

fn finish(tier: Tier, documents: Vec<Value>) -> Execution {
    info!(tier = %tier, rows = documents.len(), "pipeline executed");
    Execution { tier, documents }
}
