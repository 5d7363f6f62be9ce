//! Document tables and the row decoder
//!
//! Each collection is a table of `(id INTEGER PRIMARY KEY, data TEXT)` rows.
//! The document's `_id` is the row id and is never stored inside `data`.

use docpipe_ir::{Pipeline, ID_FIELD};
use rusqlite::{params, params_from_iter, Connection};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::info;

use crate::config::Config;
use crate::dispatch::{DispatchOptions, Dispatcher, Execution};
use crate::sql::{quote_ident, CompiledQuery};
use crate::{PipelineError, Result};

/// Turn a stored row into a document with `_id` as its first field.
pub fn decode_row(id: i64, text: &str) -> Result<Value> {
    let parsed: Value = serde_json::from_str(text).map_err(|source| PipelineError::Decode { id, source })?;
    let Value::Object(fields) = parsed else {
        return Err(PipelineError::InvalidDocument(format!("row {id} does not hold a JSON object")));
    };

    let mut document = Map::with_capacity(fields.len() + 1);
    document.insert(ID_FIELD.to_string(), Value::from(id));
    for (key, value) in fields {
        if key != ID_FIELD {
            document.insert(key, value);
        }
    }
    Ok(Value::Object(document))
}

/// Run a query returning `(id, data)` rows and decode each one.
pub(crate) fn query_documents(conn: &Connection, query: &CompiledQuery) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(&query.sql)?;
    let mut rows = stmt.query(params_from_iter(query.params.iter()))?;

    let mut documents = Vec::new();
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let data: String = row.get(1)?;
        documents.push(decode_row(id, &data)?);
    }
    Ok(documents)
}

/// Every document of `table` in row order.
pub(crate) fn read_relation(conn: &Connection, table: &str) -> Result<Vec<Value>> {
    let sql = format!("SELECT id, data FROM {} ORDER BY rowid", quote_ident(table));
    query_documents(conn, &CompiledQuery::new(sql, vec![]))
}

/// One SQLite session holding document collections.
pub struct Database {
    conn: Connection,
    options: DispatchOptions,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            options: DispatchOptions::default(),
        }
    }

    /// Open the configured database with the configured dispatch options.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut database = match &config.database.path {
            Some(path) => Self::open(path)?,
            None => Self::open_in_memory()?,
        };
        database.options = config.dispatch_options();
        info!(path = ?config.database.path, options = ?database.options, "database opened");
        Ok(database)
    }

    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> DispatchOptions {
        self.options
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Handle to a collection, creating its table if needed.
    pub fn collection(&self, name: &str) -> Result<Collection<'_>> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY AUTOINCREMENT, data TEXT NOT NULL)",
            quote_ident(name)
        ))?;
        Ok(Collection {
            conn: &self.conn,
            name: name.to_string(),
            options: self.options,
        })
    }
}

pub struct Collection<'d> {
    conn: &'d Connection,
    name: String,
    options: DispatchOptions,
}

impl<'d> Collection<'d> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `document` and return its new `_id`. A caller-supplied `_id` is
    /// ignored; ids are issued by the table.
    pub fn insert_one(&self, document: &Value) -> Result<i64> {
        let Value::Object(fields) = document else {
            return Err(PipelineError::InvalidDocument("documents must be JSON objects".to_string()));
        };
        let mut stored = fields.clone();
        stored.remove(ID_FIELD);

        let data = Value::Object(stored).to_string();
        self.conn.execute(
            &format!("INSERT INTO {} (data) VALUES (?1)", quote_ident(&self.name)),
            params![data],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_many(&self, documents: &[Value]) -> Result<Vec<i64>> {
        documents.iter().map(|doc| self.insert_one(doc)).collect()
    }

    pub fn find_all(&self) -> Result<Vec<Value>> {
        read_relation(self.conn, &self.name)
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&self.name)),
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Run a pipeline given as a JSON array of stages.
    pub fn aggregate(&self, pipeline: &Value) -> Result<Vec<Value>> {
        Ok(self.aggregate_with(pipeline, self.options)?.documents)
    }

    /// Like [`Collection::aggregate`] with explicit options, reporting the tier used.
    pub fn aggregate_with(&self, pipeline: &Value, options: DispatchOptions) -> Result<Execution> {
        let pipeline = Pipeline::parse(pipeline)?;
        Dispatcher::new(self.conn).execute(&self.name, &pipeline, options)
    }
}
