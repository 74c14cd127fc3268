//! Scripted in-memory store for tests.
//!
//! The mock does not interpret SQL. Tests queue the responses the store
//! should give, in call order, and afterwards inspect the statements the
//! engine actually rendered. That keeps assertions on engine behavior
//! (statement shape, binding, windowing, regrouping) rather than on a
//! re-implementation of the database.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::entity::StoreRow;
use crate::error::StoreFailure;
use crate::executor::{CallContext, Statement, StoreConnection};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Rows(Vec<StoreRow>),
    Affected(u64),
    Failure(StoreFailure),
}

/// A store connection that replays scripted responses.
#[derive(Debug, Default)]
pub struct MockStore {
    responses: Mutex<VecDeque<MockResponse>>,
    log: Mutex<Vec<Statement>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_rows(self, rows: Vec<StoreRow>) -> Self {
        self.push(MockResponse::Rows(rows));
        self
    }

    pub fn append_affected(self, affected: u64) -> Self {
        self.push(MockResponse::Affected(affected));
        self
    }

    pub fn append_failure(self, failure: StoreFailure) -> Self {
        self.push(MockResponse::Failure(failure));
        self
    }

    fn push(&self, response: MockResponse) {
        self.responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(response);
    }

    fn pop(&self) -> Result<MockResponse, StoreFailure> {
        self.responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| StoreFailure::Other("mock response queue exhausted".into()))
    }

    fn record(&self, statement: &Statement) {
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(statement.clone());
    }

    /// Every statement the engine dispatched, in order.
    pub fn statements(&self) -> Vec<Statement> {
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn statement_count(&self) -> usize {
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl StoreConnection for MockStore {
    fn query(
        &self,
        statement: &Statement,
        ctx: &CallContext,
    ) -> Result<Vec<StoreRow>, StoreFailure> {
        ctx.check()?;
        self.record(statement);
        match self.pop()? {
            MockResponse::Rows(rows) => Ok(rows),
            MockResponse::Affected(_) => Err(StoreFailure::Other(
                "mock scripted an affected count for a row query".into(),
            )),
            MockResponse::Failure(failure) => Err(failure),
        }
    }

    fn execute(&self, statement: &Statement, ctx: &CallContext) -> Result<u64, StoreFailure> {
        ctx.check()?;
        self.record(statement);
        match self.pop()? {
            MockResponse::Affected(affected) => Ok(affected),
            MockResponse::Rows(_) => Err(StoreFailure::Other(
                "mock scripted rows for a mutating statement".into(),
            )),
            MockResponse::Failure(failure) => Err(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{LockMode, QueryHints};
    use sea_query::{Value, Values};

    fn statement(sql: &str) -> Statement {
        Statement {
            sql: sql.into(),
            values: Values(vec![Value::from(1i64)]),
            lock: LockMode::None,
            lock_timeout_ms: None,
            hints: QueryHints::default(),
        }
    }

    #[test]
    fn replays_in_order_and_logs() {
        let store = MockStore::new()
            .append_rows(vec![StoreRow::from_pairs([("id", Value::from(1i64))])])
            .append_affected(4);
        let ctx = CallContext::new();

        let rows = store.query(&statement("select"), &ctx).unwrap();
        assert_eq!(rows.len(), 1);
        let affected = store.execute(&statement("update"), &ctx).unwrap();
        assert_eq!(affected, 4);

        let log = store.statements();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].sql, "select");
        assert_eq!(log[1].sql, "update");
    }

    #[test]
    fn exhausted_queue_is_a_store_failure() {
        let store = MockStore::new();
        let err = store
            .query(&statement("select"), &CallContext::new())
            .unwrap_err();
        assert!(matches!(err, StoreFailure::Other(_)));
    }

    #[test]
    fn scripted_failures_surface_unchanged() {
        let store = MockStore::new().append_failure(StoreFailure::Deadlock("tx 9".into()));
        let err = store
            .query(&statement("select"), &CallContext::new())
            .unwrap_err();
        assert_eq!(err, StoreFailure::Deadlock("tx 9".into()));
    }
}
