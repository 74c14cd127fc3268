//! Query plans.
//!
//! A plan is the immutable, registration-time product of either the
//! method-name derivator ([`DerivedPlan`]) or an explicit query declaration
//! ([`ExplicitPlan`]). Plans hold no values; parameters are bound at call
//! time and always travel as placeholders.

use std::sync::Arc;

use sea_query::Value;

use crate::descriptor::{FieldType, ResolvedPath};

/// Comparison operator a predicate keyword maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    In,
    NotIn,
    Like,
    NotLike,
    StartingWith,
    EndingWith,
    Containing,
    IsNull,
    IsNotNull,
    IsTrue,
    IsFalse,
}

impl CompareOp {
    /// Number of caller-supplied parameters the operator consumes.
    /// `In`/`NotIn` consume one parameter that must be a sequence.
    pub fn arity(self) -> usize {
        match self {
            Self::IsNull | Self::IsNotNull | Self::IsTrue | Self::IsFalse => 0,
            Self::Between => 2,
            _ => 1,
        }
    }

    /// Whether the single consumed parameter is a sequence.
    pub fn takes_sequence(self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }

    /// Operators that only make sense against text fields.
    pub fn requires_text(self) -> bool {
        matches!(
            self,
            Self::Like | Self::NotLike | Self::StartingWith | Self::EndingWith | Self::Containing
        )
    }

    /// Operators that only make sense against boolean fields.
    pub fn requires_bool(self) -> bool {
        matches!(self, Self::IsTrue | Self::IsFalse)
    }
}

/// Logical combinator linking a predicate node to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    And,
    Or,
}

/// One node of the predicate tree: a resolved field path, an operator and
/// the combinator to its left sibling (ignored on the first node).
#[derive(Debug, Clone)]
pub struct PredicateNode {
    pub path: ResolvedPath,
    pub op: CompareOp,
    pub link: Combinator,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// A sort key; the path is validated against the descriptor before use.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub path: String,
    pub direction: Direction,
}

impl SortKey {
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: Direction::Desc,
        }
    }
}

/// Pessimistic lock request, forwarded to the store verbatim. The engine
/// implements no lock management; acquisition order, deadlock detection and
/// release are the store's responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    /// Shared lock (`FOR SHARE`).
    Share,
    /// Exclusive lock (`FOR UPDATE`).
    Update,
}

/// Per-statement hints passed through to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryHints {
    /// The statement will not be used to feed a write; the store may skip
    /// snapshot bookkeeping.
    pub read_only: bool,
}

/// What a derived method returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Find,
    Count,
    Exists,
    Delete,
}

/// Declared shape of one method parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSpec {
    Scalar(FieldType),
    /// A homogeneous sequence, consumed by `In`/`NotIn`.
    List(FieldType),
}

impl ParamSpec {
    pub fn element_type(self) -> FieldType {
        match self {
            Self::Scalar(t) | Self::List(t) => t,
        }
    }
}

/// A parameter value supplied at call time.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Scalar(Value),
    List(Vec<Value>),
}

impl ParamValue {
    pub fn scalar(value: impl Into<Value>) -> Self {
        Self::Scalar(value.into())
    }

    pub fn list<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Scalar(v.into())
    }
}

/// Plan derived from a method name at registration time.
///
/// Immutable once built; deriving the same name twice yields a plan that
/// renders to the same statement, which is what makes the derivation cache
/// safe to populate lazily.
#[derive(Debug, Clone)]
pub struct DerivedPlan {
    pub method: String,
    pub subject: Subject,
    pub predicates: Vec<PredicateNode>,
    /// Method-declared order, always applied before any request-supplied sort.
    pub order_by: Vec<SortKey>,
    pub param_specs: Vec<ParamSpec>,
    /// Field paths to select instead of full entity rows, if any.
    pub projection: Option<Vec<String>>,
    pub lock: LockMode,
    pub hints: QueryHints,
}

/// A hand-written query template with named parameters.
#[derive(Debug, Clone)]
pub struct ExplicitPlan {
    pub method: String,
    pub template: String,
    /// Optional cheaper count query for paging over a complex base query.
    pub count_template: Option<String>,
    pub lock: LockMode,
    pub hints: QueryHints,
}

/// Either kind of executable plan.
#[derive(Debug, Clone)]
pub enum QueryPlan {
    Derived(Arc<DerivedPlan>),
    Explicit(Arc<ExplicitPlan>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_table() {
        assert_eq!(CompareOp::Eq.arity(), 1);
        assert_eq!(CompareOp::Between.arity(), 2);
        assert_eq!(CompareOp::IsNull.arity(), 0);
        assert_eq!(CompareOp::In.arity(), 1);
        assert!(CompareOp::In.takes_sequence());
        assert!(!CompareOp::Eq.takes_sequence());
    }

    #[test]
    fn param_value_conversions() {
        assert!(matches!(ParamValue::from(10i32), ParamValue::Scalar(_)));
        assert!(matches!(ParamValue::from("AAA"), ParamValue::Scalar(_)));
        match ParamValue::list(["a", "b"]) {
            ParamValue::List(vs) => assert_eq!(vs.len(), 2),
            ParamValue::Scalar(_) => panic!("expected list"),
        }
    }
}
