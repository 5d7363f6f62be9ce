//! docpipe Intermediate Representation (IR)
//!
//! Canonical form of a document aggregation pipeline. Stages are parsed from
//! MongoDB-style JSON specifications into a closed enum, and every stage has a
//! deterministic JSON serialization used for hashing and naming.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

mod stage;
mod types;

pub use stage::{sort_keys, Stage, StageError};
pub use types::*;

/// Stable identifier of a pipeline's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId(String);

impl PipelineId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex SHA-256 of `data`, truncated to `width` characters.
pub fn short_digest(data: &[u8], width: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let hex = format!("{:x}", hasher.finalize());
    hex[..width.min(hex.len())].to_string()
}

/// Ordered, immutable list of stages
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Parse a JSON array of single-key stage objects.
    pub fn parse(spec: &Value) -> Result<Self, StageError> {
        let items = spec.as_array().ok_or(StageError::NotAnArray)?;
        let stages = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                Stage::parse(item).map_err(|err| match err {
                    StageError::InvalidStage { reason, .. } => StageError::InvalidStage { index, reason },
                    other => other,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Canonical JSON text of the whole pipeline.
    pub fn canonical_json(&self) -> String {
        let stages: Vec<Value> = self.stages.iter().map(Stage::canonical).collect();
        Value::Array(stages).to_string()
    }

    /// Content hash (first 16 hex chars of SHA-256 over the canonical JSON).
    pub fn id(&self) -> PipelineId {
        PipelineId(short_digest(self.canonical_json().as_bytes(), 16))
    }
}
