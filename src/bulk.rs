//! Bulk update statements.
//!
//! A bulk update modifies matching rows in a single statement, bypassing
//! per-entity materialization entirely. Because it writes behind the back
//! of any cached entities, a registration can declare that first-level
//! cached state must be discarded after execution; the outcome carries that
//! flag to the caller, who owns the cache.

use sea_query::{Alias, Expr, ExprTrait, PostgresQueryBuilder, Query, Value};

use crate::descriptor::EntityDescriptor;
use crate::error::{QuarryError, QuarryResult};
use crate::executor::{render_condition, Statement};
use crate::plan::{DerivedPlan, LockMode, ParamValue, QueryHints};

/// How an assignment computes the new column value.
#[derive(Debug, Clone)]
pub enum AssignmentValue {
    /// Overwrite with a bound value.
    Set(Value),
    /// Increment by a bound value (`col = col + v`).
    Add(Value),
}

/// One SET clause of a bulk update.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub field: String,
    pub value: AssignmentValue,
}

impl Assignment {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: AssignmentValue::Set(value.into()),
        }
    }

    pub fn add(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: AssignmentValue::Add(value.into()),
        }
    }
}

/// Result of a bulk execution.
#[derive(Debug, Clone, Copy)]
pub struct BulkOutcome {
    /// Rows the store reports as modified.
    pub affected: u64,
    /// The registration asked for cached entity state to be discarded;
    /// in-memory copies of the touched rows are now stale.
    pub clears_cache: bool,
}

/// Render a bulk update from a derived predicate plus assignments.
///
/// Assignment fields must be direct columns of the entity; the predicate
/// was already checked for association traversal at registration.
pub(crate) fn render_update(
    desc: &EntityDescriptor,
    plan: &DerivedPlan,
    assignments: &[Assignment],
    params: &[ParamValue],
) -> QuarryResult<Statement> {
    if assignments.is_empty() {
        return Err(QuarryError::MalformedQueryName {
            method: plan.method.clone(),
            reason: "bulk update declares no assignments".into(),
        });
    }

    let mut update = Query::update();
    update.table(Alias::new(desc.table()));
    for assignment in assignments {
        let field = desc.field(&assignment.field).ok_or_else(|| {
            QuarryError::UnknownField {
                entity: desc.name().to_string(),
                path: assignment.field.clone(),
            }
        })?;
        let column = Alias::new(&field.name);
        match &assignment.value {
            AssignmentValue::Set(value) => {
                update.value(column, value.clone());
            }
            AssignmentValue::Add(value) => {
                update.value(
                    column,
                    Expr::col(Alias::new(&field.name)).add(value.clone()),
                );
            }
        }
    }
    if let Some(condition) = render_condition(desc, plan, params)? {
        update.and_where(condition);
    }

    let (sql, values) = update.build(PostgresQueryBuilder);
    Ok(Statement {
        sql,
        values,
        lock: LockMode::None,
        lock_timeout_ms: None,
        hints: QueryHints::default(),
    })
}
