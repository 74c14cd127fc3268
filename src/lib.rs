//! # Quarry
//!
//! Repository-style query engine over a SQL store: derives statements from
//! snake_case method names, pages and slices result sets, runs single-pass
//! bulk updates, and materializes associations eagerly through fetch joins.
//!
//! All method declarations are parsed and resolved when a [`Repository`]
//! is built, so defective names fail at startup, not on the first call.

pub mod bulk;
pub mod config;
pub mod derive;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod mock;
pub mod page;
pub mod plan;
pub mod repository;
pub mod tests_cfg;

pub use config::{AmbiguousFetchPolicy, EngineConfig};
pub use entity::{Assoc, Entity, FromHydratedRow, FromStoreRow, HydratedRow, Rel, StoreRow};
pub use error::{QuarryError, QuarryResult, StoreFailure};
pub use executor::{CallContext, CancelToken, NamedParams, Statement, StoreConnection};
pub use page::{Page, PageRequest, Slice};
pub use plan::{LockMode, ParamSpec, ParamValue, SortKey};
pub use repository::{BulkDecl, ExplicitDecl, MethodDecl, Repository};
