//! Error types for registration and execution.
//!
//! The taxonomy splits along the two moments a repository can fail:
//! registration (method-name grammar, field resolution) and call time
//! (parameter binding, store failures). Registration errors are fatal to
//! the repository being built; call-time errors go to the immediate caller
//! with no internal recovery.

use thiserror::Error;

/// Failures surfaced by the store connection or the caller's unit-of-work.
///
/// These are never retried internally. Only the caller's unit-of-work knows
/// the correct retry/rollback policy, so the engine propagates them unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreFailure {
    /// The store could not be reached or dropped the connection mid-call.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A constraint (unique, foreign key, check) rejected the statement.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    /// The store detected a deadlock and aborted this statement.
    #[error("deadlock detected: {0}")]
    Deadlock(String),
    /// A pessimistic lock could not be acquired within the store's lock-wait timeout.
    #[error("lock wait timed out: {0}")]
    LockTimeout(String),
    /// The caller cancelled the context before the statement was dispatched.
    #[error("call cancelled")]
    Cancelled,
    /// The caller-supplied deadline elapsed.
    #[error("call deadline exceeded")]
    DeadlineExceeded,
    /// Anything else the driver reports.
    #[error("store error: {0}")]
    Other(String),
}

/// Engine error type.
#[derive(Debug, Error)]
pub enum QuarryError {
    /// Method-name grammar violation or parameter arity/type mismatch.
    /// Raised at registration time; fatal to the repository being built.
    #[error("malformed query name `{method}`: {reason}")]
    MalformedQueryName { method: String, reason: String },

    /// A predicate, sort, projection or fetch path references a field or
    /// association absent from the entity descriptor.
    #[error("unknown field `{path}` on entity `{entity}`")]
    UnknownField { entity: String, path: String },

    /// An explicit query template references a named parameter the caller
    /// did not supply.
    #[error("explicit query references unbound parameter `:{name}`")]
    UnboundParameter { name: String },

    /// Two or more to-many fetch paths were requested in the same plan; a
    /// naive relational join of them produces a combinatorial cross-product.
    #[error("ambiguous fetch combination: to-many paths {paths:?} requested together")]
    AmbiguousFetchCombination { paths: Vec<String> },

    /// A to-many fetch join invalidates row-based paging; the combination
    /// is rejected rather than silently paginated in memory.
    #[error("to-many fetch path `{path}` cannot be combined with row-based paging")]
    FetchJoinWithPaging { path: String },

    /// The page request itself is unusable (zero page size).
    #[error("invalid page request: {reason}")]
    InvalidPageRequest { reason: String },

    /// A single-row query matched more than one row.
    #[error("query `{method}` matched {count} rows where at most one was expected")]
    NonUniqueResult { method: String, count: usize },

    /// The named method was never registered on this repository.
    #[error("no method `{method}` registered on repository `{entity}`")]
    UnknownMethod { entity: String, method: String },

    /// The named method exists but was invoked through the wrong entry
    /// point (e.g. `find` on a bulk-update registration).
    #[error("method `{method}` is registered as {registered_as}, not callable via `{called_via}`")]
    WrongInvocation {
        method: String,
        registered_as: &'static str,
        called_via: &'static str,
    },

    /// Failure surfaced by the store connection; propagated unchanged.
    #[error(transparent)]
    Store(#[from] StoreFailure),

    /// A returned row could not be materialized into the requested type.
    #[error("row decode failed: {0}")]
    Decode(String),
}

pub type QuarryResult<T> = Result<T, QuarryError>;

impl QuarryError {
    /// True for errors that must prevent the application from starting.
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedQueryName { .. } | Self::UnknownField { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_method_and_reason() {
        let err = QuarryError::MalformedQueryName {
            method: "find_by_".into(),
            reason: "empty predicate".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("find_by_"));
        assert!(msg.contains("empty predicate"));
    }

    #[test]
    fn store_failure_is_transparent() {
        let err = QuarryError::from(StoreFailure::Deadlock("tx 42".into()));
        assert_eq!(err.to_string(), "deadlock detected: tx 42");
    }

    #[test]
    fn registration_errors_are_flagged_fatal() {
        assert!(QuarryError::UnknownField {
            entity: "member".into(),
            path: "nope".into()
        }
        .is_registration_error());
        assert!(!QuarryError::UnboundParameter { name: "age".into() }.is_registration_error());
    }
}
