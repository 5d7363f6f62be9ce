//! SQLite execution of document pipelines
//!
//! Pipelines run inside the embedded engine against `(id, data)` tables where
//! `data` is a JSON document. Three tiers are tried in order:
//!
//! 1. [`SingleStatementTier`]: one `SELECT` for match + sort/skip/limit shapes
//! 2. [`TempTableCompiler`]: one temp table per (fused) stage, scoped by a savepoint
//! 3. [`InMemoryEvaluator`]: loads the documents and evaluates in Rust

use thiserror::Error;

pub mod config;
pub mod logging;

mod compiler;
mod direct;
mod dispatch;
mod fallback;
mod namer;
mod scope;
mod sql;
mod stages;
mod store;

pub use compiler::{can_compile, CompiledRun, TempTableCompiler};
pub use direct::SingleStatementTier;
pub use dispatch::{DirectSqlTier, DispatchOptions, Dispatcher, Execution, FallbackEvaluator, Tier};
pub use fallback::InMemoryEvaluator;
pub use namer::{NameSource, TempTableNamer};
pub use scope::PipelineScope;
pub use sql::{CompiledQuery, QueryParam, SortWindow};
pub use store::{decode_row, Collection, Database};

pub use docpipe_ir::{Pipeline, PipelineId, Stage, StageError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Malformed(#[from] StageError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Cannot decode document {id}: {source}")]
    Decode {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
