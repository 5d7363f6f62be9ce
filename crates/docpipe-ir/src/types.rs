//! Leaf types shared by the stage variants

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Name of the identity field; maps to the row id column rather than the document.
pub const ID_FIELD: &str = "_id";

/// Dotted path into a document, stored without the leading `$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Parse a `"$a.b"` field reference. Returns `None` when the `$` is missing
    /// or nothing follows it.
    pub fn from_reference(reference: &str) -> Option<Self> {
        let path = reference.strip_prefix('$')?;
        if path.is_empty() || path.starts_with('$') {
            return None;
        }
        Some(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_identity(&self) -> bool {
        self.0 == ID_FIELD
    }

    /// `$`-prefixed top-level keys such as `$or` are operators, not fields.
    pub fn is_operator(&self) -> bool {
        self.0.starts_with('$')
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tag of a stage, used for dispatch and for temp table names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Match,
    Unwind,
    Lookup,
    Sort,
    Skip,
    Limit,
    AddFields,
    Unsupported,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Match => "match",
            StageKind::Unwind => "unwind",
            StageKind::Lookup => "lookup",
            StageKind::Sort => "sort",
            StageKind::Skip => "skip",
            StageKind::Limit => "limit",
            StageKind::AddFields => "addFields",
            StageKind::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison operators accepted inside a `$match` operator object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    /// Kept verbatim so that a more general evaluator can still handle it.
    Other(String),
}

impl MatchOperator {
    pub fn parse(name: &str) -> Self {
        match name {
            "$eq" => MatchOperator::Eq,
            "$ne" => MatchOperator::Ne,
            "$gt" => MatchOperator::Gt,
            "$gte" => MatchOperator::Gte,
            "$lt" => MatchOperator::Lt,
            "$lte" => MatchOperator::Lte,
            "$in" => MatchOperator::In,
            "$nin" => MatchOperator::Nin,
            other => MatchOperator::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MatchOperator::Eq => "$eq",
            MatchOperator::Ne => "$ne",
            MatchOperator::Gt => "$gt",
            MatchOperator::Gte => "$gte",
            MatchOperator::Lt => "$lt",
            MatchOperator::Lte => "$lte",
            MatchOperator::In => "$in",
            MatchOperator::Nin => "$nin",
            MatchOperator::Other(name) => name,
        }
    }
}

/// Condition on one field of a `$match`.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Bare value: `{"a": 1}`
    Equals(Value),
    /// Operator object: `{"a": {"$gte": 1, "$lt": 5}}`, ANDed in order
    Operators(Vec<(MatchOperator, Value)>),
}

/// Conjunction of field conditions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchSpec {
    pub conditions: Vec<(FieldPath, Condition)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupSpec {
    pub from: String,
    pub local_field: FieldPath,
    pub foreign_field: FieldPath,
    pub as_field: FieldPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn as_i64(&self) -> i64 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: FieldPath,
    pub direction: SortDirection,
}

/// Right-hand side of an `$addFields` assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignedValue {
    /// `"$path"`: copy an existing field
    Field(FieldPath),
    /// Literal or computed expression
    Expression(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldAssignment {
    pub target: FieldPath,
    pub value: AssignedValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_reference() {
        assert_eq!(FieldPath::from_reference("$a.b"), Some(FieldPath::new("a.b")));
        assert_eq!(FieldPath::from_reference("a.b"), None);
        assert_eq!(FieldPath::from_reference("$"), None);
        assert_eq!(FieldPath::from_reference("$$ROOT"), None);
        assert!(FieldPath::new("_id").is_identity());
        assert!(!FieldPath::new("_id.x").is_identity());
    }

    #[test]
    fn test_match_operator_round_trip() {
        for name in ["$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$regex"] {
            assert_eq!(MatchOperator::parse(name).as_str(), name);
        }
        assert_eq!(MatchOperator::parse("$regex"), MatchOperator::Other("$regex".into()));
    }
}
