//! Transactional scope of one compiled pipeline run
//!
//! A scope opens a savepoint named after the pipeline, creates temp tables
//! through its [`TempTableNamer`], and on exit releases or rolls back the
//! savepoint and drops every table it created. Drops are attempted one by one
//! so a failed drop never leaves the others behind.

use docpipe_ir::PipelineId;
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, warn};

use crate::namer::{NameSource, TempTableNamer};
use crate::sql::{quote_ident, CompiledQuery};
use crate::Result;

pub struct PipelineScope<'c> {
    conn: &'c Connection,
    savepoint: String,
    namer: TempTableNamer,
    tables: Vec<String>,
    open: bool,
}

impl<'c> PipelineScope<'c> {
    pub fn open(conn: &'c Connection, pipeline_id: &PipelineId) -> Result<Self> {
        let savepoint = quote_ident(&format!("docpipe_{}", pipeline_id));
        conn.execute_batch(&format!("SAVEPOINT {savepoint}"))?;
        debug!(pipeline_id = %pipeline_id, "opened pipeline scope");

        Ok(Self {
            conn,
            savepoint,
            namer: TempTableNamer::new(pipeline_id.clone()),
            tables: Vec::new(),
            open: true,
        })
    }

    /// Open a scope, run `body` in it and close it according to the outcome.
    /// A failure in `body` is returned as-is after rollback and cleanup.
    pub fn run<T, F>(conn: &'c Connection, pipeline_id: &PipelineId, body: F) -> Result<T>
    where
        F: FnOnce(&mut PipelineScope<'c>) -> Result<T>,
    {
        let mut scope = Self::open(conn, pipeline_id)?;
        match body(&mut scope) {
            Ok(value) => {
                scope.close(true)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(close_err) = scope.close(false) {
                    warn!(error = %close_err, "pipeline scope did not close cleanly");
                }
                Err(err)
            }
        }
    }

    pub fn connection(&self) -> &'c Connection {
        self.conn
    }

    /// Materialize `query` as a new temp table and register it for cleanup.
    pub fn create_temp_table(&mut self, source: NameSource<'_>, query: &CompiledQuery) -> Result<String> {
        let name = self.namer.name_for(source, "");
        let sql = format!("CREATE TEMP TABLE {} AS {}", quote_ident(&name), query.sql);
        debug!(table = %name, sql = %sql, params = query.params.len(), "materializing stage");

        self.conn.execute(&sql, params_from_iter(query.params.iter()))?;
        self.tables.push(name.clone());
        Ok(name)
    }

    /// Tables created so far, in creation order.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Release (on success) or roll back to the savepoint, then drop every
    /// registered table.
    pub fn close(mut self, succeeded: bool) -> Result<()> {
        self.finish(succeeded)
    }

    fn finish(&mut self, succeeded: bool) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        let mut outcome = Ok(());
        if succeeded {
            if let Err(err) = self.conn.execute_batch(&format!("RELEASE SAVEPOINT {}", self.savepoint)) {
                warn!(savepoint = %self.savepoint, error = %err, "release failed, rolling back");
                self.rollback();
                outcome = Err(err.into());
            }
        } else {
            self.rollback();
        }
        self.drop_tables();
        outcome
    }

    fn rollback(&self) {
        let sql = format!(
            "ROLLBACK TO SAVEPOINT {sp}; RELEASE SAVEPOINT {sp}",
            sp = self.savepoint
        );
        if let Err(err) = self.conn.execute_batch(&sql) {
            warn!(savepoint = %self.savepoint, error = %err, "rollback to savepoint failed");
        }
    }

    fn drop_tables(&mut self) {
        for name in self.tables.drain(..) {
            let sql = format!("DROP TABLE IF EXISTS temp.{}", quote_ident(&name));
            match self.conn.execute_batch(&sql) {
                Ok(()) => debug!(table = %name, "dropped temp table"),
                Err(err) => warn!(table = %name, error = %err, "failed to drop temp table"),
            }
        }
    }
}

impl Drop for PipelineScope<'_> {
    fn drop(&mut self) {
        if self.open {
            let _ = self.finish(false);
        }
    }
}
