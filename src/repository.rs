//! Repositories: registered query methods over one entity.
//!
//! A repository is built once at startup from a set of method declarations.
//! Every declaration is parsed and resolved at build time, so a typo in a
//! method name or a reference to a missing field fails the application
//! before it serves anything. Calls after that only bind parameters and
//! dispatch; the derivation cache makes repeat lookups a map read.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use sea_query::{Alias, Expr, ExprTrait, PostgresQueryBuilder, Query, Value};

use crate::bulk::{self, Assignment, BulkOutcome};
use crate::config::EngineConfig;
use crate::derive::derive_plan;
use crate::descriptor::EntityDescriptor;
use crate::entity::{Entity, FromHydratedRow, StoreRow};
use crate::error::{QuarryError, QuarryResult};
use crate::executor::{
    self, CallContext, NamedParams, Statement, StoreConnection, WindowSpec,
};
use crate::fetch::FetchSpec;
use crate::page::{Page, PageRequest, Slice};
use crate::plan::{
    DerivedPlan, ExplicitPlan, LockMode, ParamSpec, ParamValue, QueryHints, Subject,
};

/// Declaration of a method whose query derives from its name.
#[derive(Debug, Clone)]
pub struct MethodDecl {
    name: String,
    params: Vec<ParamSpec>,
    lock: LockMode,
    hints: QueryHints,
    fetch: Vec<String>,
    projection: Option<Vec<String>>,
}

impl MethodDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            lock: LockMode::None,
            hints: QueryHints::default(),
            fetch: Vec::new(),
            projection: None,
        }
    }

    pub fn with_params(mut self, params: impl IntoIterator<Item = ParamSpec>) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    pub fn with_lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.hints.read_only = true;
        self
    }

    /// Association paths to materialize eagerly in the same round trip.
    pub fn with_fetch(mut self, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fetch = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Select only the named field paths instead of full entity rows.
    pub fn with_projection(mut self, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.projection = Some(paths.into_iter().map(Into::into).collect());
        self
    }
}

/// Declaration of a method backed by a hand-written query template.
#[derive(Debug, Clone)]
pub struct ExplicitDecl {
    name: String,
    template: String,
    count_template: Option<String>,
    lock: LockMode,
    hints: QueryHints,
}

impl ExplicitDecl {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            count_template: None,
            lock: LockMode::None,
            hints: QueryHints::default(),
        }
    }

    /// Cheaper count query used when paging over a complex base query.
    pub fn with_count(mut self, template: impl Into<String>) -> Self {
        self.count_template = Some(template.into());
        self
    }

    pub fn with_lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.hints.read_only = true;
        self
    }
}

/// Declaration of a bulk update: a predicate in method-name grammar plus
/// SET assignments, executed as one statement.
#[derive(Debug, Clone)]
pub struct BulkDecl {
    name: String,
    /// Predicate segment in derivation grammar, e.g. `age_greater_than_equal`.
    /// Empty means all rows.
    predicate: String,
    params: Vec<ParamSpec>,
    assignments: Vec<Assignment>,
    clears_cache: bool,
}

impl BulkDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicate: String::new(),
            params: Vec::new(),
            assignments: Vec::new(),
            clears_cache: false,
        }
    }

    pub fn matching(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = predicate.into();
        self
    }

    pub fn with_params(mut self, params: impl IntoIterator<Item = ParamSpec>) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    pub fn assign(mut self, assignment: Assignment) -> Self {
        self.assignments.push(assignment);
        self
    }

    /// Mark cached entity state stale after execution; the caller owns the
    /// cache and performs the actual discard.
    pub fn clears_cache(mut self) -> Self {
        self.clears_cache = true;
        self
    }
}

enum RegisteredOp {
    Derived {
        decl: MethodDecl,
        fetch: Option<FetchSpec>,
    },
    Explicit(Arc<ExplicitPlan>),
    Bulk {
        decl: BulkDecl,
        clears_cache: bool,
    },
}

impl RegisteredOp {
    fn kind(&self) -> &'static str {
        match self {
            Self::Derived { .. } => "derived",
            Self::Explicit(_) => "explicit",
            Self::Bulk { .. } => "bulk",
        }
    }
}

fn subject_name(subject: Subject) -> &'static str {
    match subject {
        Subject::Find => "find",
        Subject::Count => "count",
        Subject::Exists => "exists",
        Subject::Delete => "delete",
    }
}

/// Builder for [`Repository`]. Collects declarations; `build` parses and
/// resolves all of them, failing fast on the first defect.
pub struct RepositoryBuilder<E: Entity> {
    config: EngineConfig,
    derived: Vec<MethodDecl>,
    explicit: Vec<ExplicitDecl>,
    bulk: Vec<BulkDecl>,
    _entity: PhantomData<E>,
}

impl<E: Entity> RepositoryBuilder<E> {
    pub fn derived(mut self, decl: MethodDecl) -> Self {
        self.derived.push(decl);
        self
    }

    pub fn explicit(mut self, decl: ExplicitDecl) -> Self {
        self.explicit.push(decl);
        self
    }

    pub fn bulk(mut self, decl: BulkDecl) -> Self {
        self.bulk.push(decl);
        self
    }

    pub fn build(self) -> QuarryResult<Repository<E>> {
        let descriptor = E::descriptor();
        let mut ops: HashMap<String, RegisteredOp> = HashMap::new();
        let mut cache: HashMap<String, Arc<DerivedPlan>> = HashMap::new();

        for decl in self.derived {
            let plan = build_derived(&descriptor, &decl)?;
            let fetch = if decl.fetch.is_empty() {
                None
            } else {
                let paths: Vec<&str> = decl.fetch.iter().map(String::as_str).collect();
                Some(FetchSpec::plan(
                    &descriptor,
                    &paths,
                    self.config.ambiguous_fetch,
                )?)
            };
            if plan.subject == Subject::Delete && plan.predicates.iter().any(|p| p.path.is_nested())
            {
                return Err(QuarryError::MalformedQueryName {
                    method: decl.name.clone(),
                    reason: "delete cannot traverse associations".into(),
                });
            }
            register(&mut ops, decl.name.clone(), RegisteredOp::Derived { decl, fetch })?;
            cache.insert(plan.method.clone(), plan);
        }

        for decl in self.explicit {
            let plan = Arc::new(ExplicitPlan {
                method: decl.name.clone(),
                template: decl.template,
                count_template: decl.count_template,
                lock: decl.lock,
                hints: decl.hints,
            });
            register(&mut ops, decl.name.clone(), RegisteredOp::Explicit(plan))?;
        }

        for decl in self.bulk {
            let plan = build_bulk(&descriptor, &decl)?;
            let clears_cache = decl.clears_cache;
            register(
                &mut ops,
                decl.name.clone(),
                RegisteredOp::Bulk { decl, clears_cache },
            )?;
            cache.insert(plan.method.clone(), plan);
        }

        Ok(Repository {
            descriptor,
            config: self.config,
            ops,
            plan_cache: RwLock::new(cache),
            _entity: PhantomData,
        })
    }
}

fn register(
    ops: &mut HashMap<String, RegisteredOp>,
    name: String,
    op: RegisteredOp,
) -> QuarryResult<()> {
    if let Some(existing) = ops.get(&name) {
        return Err(QuarryError::MalformedQueryName {
            method: name,
            reason: format!("already registered as a {} method", existing.kind()),
        });
    }
    ops.insert(name, op);
    Ok(())
}

/// Derive and adorn a plan for a method declaration. Pure; called at build
/// time and again on a cache miss, yielding an identical plan either way.
fn build_derived(
    descriptor: &EntityDescriptor,
    decl: &MethodDecl,
) -> QuarryResult<Arc<DerivedPlan>> {
    let mut plan = derive_plan(&decl.name, &decl.params, descriptor)?;
    plan.lock = decl.lock;
    plan.hints = decl.hints;
    if let Some(paths) = &decl.projection {
        for path in paths {
            descriptor.resolve_path(path)?;
        }
        plan.projection = Some(paths.clone());
    }
    Ok(Arc::new(plan))
}

fn build_bulk(descriptor: &EntityDescriptor, decl: &BulkDecl) -> QuarryResult<Arc<DerivedPlan>> {
    let synthetic = if decl.predicate.is_empty() {
        "find_all".to_string()
    } else {
        format!("find_by_{}", decl.predicate)
    };
    let mut plan = derive_plan(&synthetic, &decl.params, descriptor).map_err(|err| match err {
        QuarryError::MalformedQueryName { reason, .. } => QuarryError::MalformedQueryName {
            method: decl.name.clone(),
            reason,
        },
        other => other,
    })?;
    plan.method = decl.name.clone();
    if plan.predicates.iter().any(|p| p.path.is_nested()) {
        return Err(QuarryError::MalformedQueryName {
            method: decl.name.clone(),
            reason: "bulk update cannot traverse associations".into(),
        });
    }
    if decl.assignments.is_empty() {
        return Err(QuarryError::MalformedQueryName {
            method: decl.name.clone(),
            reason: "bulk update declares no assignments".into(),
        });
    }
    for assignment in &decl.assignments {
        if descriptor.field(&assignment.field).is_none() {
            return Err(QuarryError::UnknownField {
                entity: descriptor.name().to_string(),
                path: assignment.field.clone(),
            });
        }
    }
    Ok(Arc::new(plan))
}

/// A registered set of query methods over one entity.
pub struct Repository<E: Entity> {
    descriptor: Arc<EntityDescriptor>,
    config: EngineConfig,
    ops: HashMap<String, RegisteredOp>,
    /// Warmed at build time; a miss re-derives and stores. Derivation is
    /// deterministic, so concurrent writers storing the same plan is benign.
    plan_cache: RwLock<HashMap<String, Arc<DerivedPlan>>>,
    _entity: PhantomData<E>,
}

impl<E: Entity> Repository<E> {
    pub fn builder(config: EngineConfig) -> RepositoryBuilder<E> {
        RepositoryBuilder {
            config,
            derived: Vec::new(),
            explicit: Vec::new(),
            bulk: Vec::new(),
            _entity: PhantomData,
        }
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock_timeout(&self) -> Option<u64> {
        self.config.lock_wait_timeout_ms
    }

    fn op(&self, method: &str) -> QuarryResult<&RegisteredOp> {
        self.ops.get(method).ok_or_else(|| QuarryError::UnknownMethod {
            entity: self.descriptor.name().to_string(),
            method: method.to_string(),
        })
    }

    fn derived_op(&self, method: &str) -> QuarryResult<(&MethodDecl, Option<&FetchSpec>)> {
        match self.op(method)? {
            RegisteredOp::Derived { decl, fetch } => Ok((decl, fetch.as_ref())),
            other => Err(QuarryError::WrongInvocation {
                method: method.to_string(),
                registered_as: other.kind(),
                called_via: "derived entry point",
            }),
        }
    }

    fn explicit_op(&self, method: &str) -> QuarryResult<&Arc<ExplicitPlan>> {
        match self.op(method)? {
            RegisteredOp::Explicit(plan) => Ok(plan),
            other => Err(QuarryError::WrongInvocation {
                method: method.to_string(),
                registered_as: other.kind(),
                called_via: "query",
            }),
        }
    }

    fn plan_for(&self, decl: &MethodDecl) -> QuarryResult<Arc<DerivedPlan>> {
        {
            let cache = self
                .plan_cache
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(plan) = cache.get(&decl.name) {
                return Ok(plan.clone());
            }
        }
        let plan = build_derived(&self.descriptor, decl)?;
        let mut cache = self
            .plan_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Last writer wins; both built the same plan.
        cache.insert(decl.name.clone(), plan.clone());
        Ok(plan)
    }

    fn expect_subject(
        &self,
        plan: &DerivedPlan,
        expected: Subject,
        called_via: &'static str,
    ) -> QuarryResult<()> {
        if plan.subject != expected {
            return Err(QuarryError::WrongInvocation {
                method: plan.method.clone(),
                registered_as: subject_name(plan.subject),
                called_via,
            });
        }
        Ok(())
    }

    // -- derived entry points ------------------------------------------------

    /// Run a derived find and materialize full entities.
    pub fn find(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &[ParamValue],
    ) -> QuarryResult<Vec<E>> {
        let (decl, fetch) = self.derived_op(method)?;
        if fetch.is_some() {
            return Err(QuarryError::WrongInvocation {
                method: method.to_string(),
                registered_as: "fetch-join find",
                called_via: "find",
            });
        }
        let plan = self.plan_for(decl)?;
        self.expect_subject(&plan, Subject::Find, "find")?;
        let stmt = executor::render_select(
            &self.descriptor,
            &plan,
            params,
            None,
            &[],
            WindowSpec::default(),
            self.lock_timeout(),
        )?;
        executor::fetch_all(conn, &stmt, ctx)
    }

    /// Run a derived find expected to match at most one row.
    pub fn find_one(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &[ParamValue],
    ) -> QuarryResult<Option<E>> {
        let mut results = self.find(conn, ctx, method, params)?;
        match results.len() {
            0 => Ok(None),
            1 => Ok(results.pop()),
            count => Err(QuarryError::NonUniqueResult {
                method: method.to_string(),
                count,
            }),
        }
    }

    /// Run a fetch-join find: entities come back with their declared
    /// association paths loaded.
    pub fn find_fetched(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &[ParamValue],
    ) -> QuarryResult<Vec<E>>
    where
        E: FromHydratedRow,
    {
        let (decl, fetch) = self.derived_op(method)?;
        let spec = fetch.ok_or_else(|| QuarryError::WrongInvocation {
            method: method.to_string(),
            registered_as: "find",
            called_via: "find_fetched",
        })?;
        let plan = self.plan_for(decl)?;
        self.expect_subject(&plan, Subject::Find, "find_fetched")?;
        let stmt = executor::render_select(
            &self.descriptor,
            &plan,
            params,
            Some(spec),
            &[],
            WindowSpec::default(),
            self.lock_timeout(),
        )?;
        executor::fetch_hydrated(conn, &stmt, ctx, &self.descriptor, spec)
    }

    /// Run a derived find with projection or otherwise raw rows.
    pub fn find_rows(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &[ParamValue],
    ) -> QuarryResult<Vec<StoreRow>> {
        let (decl, fetch) = self.derived_op(method)?;
        if fetch.is_some() {
            return Err(QuarryError::WrongInvocation {
                method: method.to_string(),
                registered_as: "fetch-join find",
                called_via: "find_rows",
            });
        }
        let plan = self.plan_for(decl)?;
        self.expect_subject(&plan, Subject::Find, "find_rows")?;
        let stmt = executor::render_select(
            &self.descriptor,
            &plan,
            params,
            None,
            &[],
            WindowSpec::default(),
            self.lock_timeout(),
        )?;
        executor::run_query(conn, &stmt, ctx)
    }

    /// Run a derived find as a page: one content window plus a companion
    /// count of all matching rows.
    ///
    /// A declared to-many fetch path invalidates row-based windows and is
    /// rejected; to-one paths combine freely with paging.
    pub fn find_page(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &[ParamValue],
        request: &PageRequest,
    ) -> QuarryResult<Page<E>>
    where
        E: FromHydratedRow,
    {
        request.validate()?;
        let (decl, fetch) = self.derived_op(method)?;
        reject_to_many_paging(fetch)?;
        let plan = self.plan_for(decl)?;
        self.expect_subject(&plan, Subject::Find, "find_page")?;

        let window = WindowSpec {
            offset: Some(request.offset()),
            limit: Some(request.size),
        };
        let stmt = executor::render_select(
            &self.descriptor,
            &plan,
            params,
            fetch,
            &request.sort,
            window,
            self.lock_timeout(),
        )?;
        let content: Vec<E> = match fetch {
            Some(spec) => {
                executor::fetch_hydrated(conn, &stmt, ctx, &self.descriptor, spec)?
            }
            None => executor::fetch_all(conn, &stmt, ctx)?,
        };
        let count_stmt = executor::render_count(&self.descriptor, &plan, params)?;
        let total = executor::fetch_count(conn, &count_stmt, ctx)?;
        Ok(Page::new(content, request, total))
    }

    /// Run a derived find as a slice: over-fetches one row past the window
    /// to learn whether a next window exists, never counting the full set.
    pub fn find_slice(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &[ParamValue],
        request: &PageRequest,
    ) -> QuarryResult<Slice<E>>
    where
        E: FromHydratedRow,
    {
        request.validate()?;
        let (decl, fetch) = self.derived_op(method)?;
        reject_to_many_paging(fetch)?;
        let plan = self.plan_for(decl)?;
        self.expect_subject(&plan, Subject::Find, "find_slice")?;

        let window = WindowSpec {
            offset: Some(request.offset()),
            limit: Some(request.size + 1),
        };
        let stmt = executor::render_select(
            &self.descriptor,
            &plan,
            params,
            fetch,
            &request.sort,
            window,
            self.lock_timeout(),
        )?;
        let content: Vec<E> = match fetch {
            Some(spec) => {
                executor::fetch_hydrated(conn, &stmt, ctx, &self.descriptor, spec)?
            }
            None => executor::fetch_all(conn, &stmt, ctx)?,
        };
        Ok(Slice::from_overfetch(content, request))
    }

    /// Run a derived count.
    pub fn count_for(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &[ParamValue],
    ) -> QuarryResult<u64> {
        let (decl, _) = self.derived_op(method)?;
        let plan = self.plan_for(decl)?;
        self.expect_subject(&plan, Subject::Count, "count_for")?;
        let stmt = executor::render_count(&self.descriptor, &plan, params)?;
        executor::fetch_count(conn, &stmt, ctx)
    }

    /// Run a derived existence check.
    pub fn exists(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &[ParamValue],
    ) -> QuarryResult<bool> {
        let (decl, _) = self.derived_op(method)?;
        let plan = self.plan_for(decl)?;
        self.expect_subject(&plan, Subject::Exists, "exists")?;
        let stmt = executor::render_count(&self.descriptor, &plan, params)?;
        Ok(executor::fetch_count(conn, &stmt, ctx)? > 0)
    }

    /// Run a derived delete and return the removed-row count.
    pub fn delete_where(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &[ParamValue],
    ) -> QuarryResult<u64> {
        let (decl, _) = self.derived_op(method)?;
        let plan = self.plan_for(decl)?;
        self.expect_subject(&plan, Subject::Delete, "delete_where")?;
        let stmt = executor::render_delete(&self.descriptor, &plan, params)?;
        executor::run_execute(conn, &stmt, ctx)
    }

    // -- explicit entry points -----------------------------------------------

    /// Run an explicit query and materialize full entities.
    pub fn query(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &NamedParams,
    ) -> QuarryResult<Vec<E>> {
        let plan = self.explicit_op(method)?;
        let stmt =
            executor::bind_explicit(plan, params, WindowSpec::default(), self.lock_timeout())?;
        executor::fetch_all(conn, &stmt, ctx)
    }

    /// Run an explicit query expected to match at most one row.
    pub fn query_one(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &NamedParams,
    ) -> QuarryResult<Option<E>> {
        let mut results = self.query(conn, ctx, method, params)?;
        match results.len() {
            0 => Ok(None),
            1 => Ok(results.pop()),
            count => Err(QuarryError::NonUniqueResult {
                method: method.to_string(),
                count,
            }),
        }
    }

    /// Run an explicit query and return raw rows, for value and record
    /// projections the template shapes itself.
    pub fn query_rows(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &NamedParams,
    ) -> QuarryResult<Vec<StoreRow>> {
        let plan = self.explicit_op(method)?;
        let stmt =
            executor::bind_explicit(plan, params, WindowSpec::default(), self.lock_timeout())?;
        executor::run_query(conn, &stmt, ctx)
    }

    /// Page an explicit query. The count uses the registered count template
    /// when one exists, else the base query wrapped in a count subquery.
    ///
    /// Request sort keys must be direct fields; the engine cannot see which
    /// joins a hand-written template performs.
    pub fn query_page(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &NamedParams,
        request: &PageRequest,
    ) -> QuarryResult<Page<E>> {
        request.validate()?;
        let plan = self.explicit_op(method)?;

        let (mut sql, values) = executor::bind_template(&plan.template, params)?;
        if !request.sort.is_empty() {
            let mut clauses: Vec<String> = Vec::new();
            for key in &request.sort {
                let resolved = self.descriptor.resolve_path(&key.path)?;
                if resolved.is_nested() {
                    return Err(QuarryError::InvalidPageRequest {
                        reason: format!(
                            "sort key `{}` traverses an association; explicit queries sort on direct fields only",
                            key.path
                        ),
                    });
                }
                let direction = match key.direction {
                    crate::plan::Direction::Asc => "ASC",
                    crate::plan::Direction::Desc => "DESC",
                };
                clauses.push(format!("\"{}\" {}", resolved.field.name, direction));
            }
            sql.push_str(&format!(" ORDER BY {}", clauses.join(", ")));
        }
        sql.push_str(&format!(" LIMIT {} OFFSET {}", request.size, request.offset()));

        let stmt = Statement {
            sql,
            values,
            lock: plan.lock,
            lock_timeout_ms: if plan.lock == LockMode::None {
                None
            } else {
                self.lock_timeout()
            },
            hints: plan.hints,
        };
        let content: Vec<E> = executor::fetch_all(conn, &stmt, ctx)?;
        let count_stmt = executor::bind_explicit_count(plan, params)?;
        let total = executor::fetch_count(conn, &count_stmt, ctx)?;
        Ok(Page::new(content, request, total))
    }

    /// Run an explicit template as a mutating statement and return the
    /// affected-row count, for hand-written UPDATE/DELETE registrations.
    pub fn execute(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &NamedParams,
    ) -> QuarryResult<u64> {
        let plan = self.explicit_op(method)?;
        let stmt =
            executor::bind_explicit(plan, params, WindowSpec::default(), self.lock_timeout())?;
        executor::run_execute(conn, &stmt, ctx)
    }

    // -- bulk ----------------------------------------------------------------

    /// Run a registered bulk update as one statement.
    pub fn execute_bulk(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        method: &str,
        params: &[ParamValue],
    ) -> QuarryResult<BulkOutcome> {
        let (decl, clears_cache) = match self.op(method)? {
            RegisteredOp::Bulk { decl, clears_cache } => (decl, *clears_cache),
            other => {
                return Err(QuarryError::WrongInvocation {
                    method: method.to_string(),
                    registered_as: other.kind(),
                    called_via: "execute_bulk",
                })
            }
        };
        let plan = self.bulk_plan_for(decl)?;
        let stmt = bulk::render_update(&self.descriptor, &plan, &decl.assignments, params)?;
        let affected = executor::run_execute(conn, &stmt, ctx)?;
        if clears_cache {
            log::debug!(
                "bulk `{method}` affected {affected} rows; cached entity state is stale"
            );
        }
        Ok(BulkOutcome {
            affected,
            clears_cache,
        })
    }

    fn bulk_plan_for(&self, decl: &BulkDecl) -> QuarryResult<Arc<DerivedPlan>> {
        {
            let cache = self
                .plan_cache
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(plan) = cache.get(&decl.name) {
                return Ok(plan.clone());
            }
        }
        let plan = build_bulk(&self.descriptor, decl)?;
        let mut cache = self
            .plan_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        cache.insert(decl.name.clone(), plan.clone());
        Ok(plan)
    }

    // -- keyed CRUD ----------------------------------------------------------

    /// Insert one entity row.
    pub fn insert(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        entity: &E,
    ) -> QuarryResult<u64> {
        let pairs = entity.to_values();
        let mut insert = Query::insert();
        insert.into_table(Alias::new(self.descriptor.table()));
        insert.columns(pairs.iter().map(|(name, _)| Alias::new(name)));
        insert
            .values(pairs.into_iter().map(|(_, value)| Expr::val(value)))
            .map_err(|err| QuarryError::Decode(format!("insert values: {err}")))?;
        let (sql, values) = insert.build(PostgresQueryBuilder);
        let stmt = Statement {
            sql,
            values,
            lock: LockMode::None,
            lock_timeout_ms: None,
            hints: QueryHints::default(),
        };
        executor::run_execute(conn, &stmt, ctx)
    }

    /// Update one entity row by primary key, writing every non-key column.
    pub fn update(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        entity: &E,
    ) -> QuarryResult<u64> {
        let pk = self.descriptor.primary_key();
        let mut update = Query::update();
        update.table(Alias::new(self.descriptor.table()));
        for (name, value) in entity.to_values() {
            if name != pk {
                update.value(Alias::new(&name), value);
            }
        }
        update.and_where(Expr::col(Alias::new(pk)).eq(entity.primary_key()));
        let (sql, values) = update.build(PostgresQueryBuilder);
        let stmt = Statement {
            sql,
            values,
            lock: LockMode::None,
            lock_timeout_ms: None,
            hints: QueryHints::default(),
        };
        executor::run_execute(conn, &stmt, ctx)
    }

    /// Load one entity by primary key.
    pub fn find_by_id(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        id: impl Into<Value>,
    ) -> QuarryResult<Option<E>> {
        let stmt = self.by_id_select(id);
        let mut results: Vec<E> = executor::fetch_all(conn, &stmt, ctx)?;
        Ok(results.pop())
    }

    /// Load every row of the entity's table.
    pub fn find_all(&self, conn: &dyn StoreConnection, ctx: &CallContext) -> QuarryResult<Vec<E>> {
        let mut select = Query::select();
        select
            .column(sea_query::Asterisk)
            .from(Alias::new(self.descriptor.table()));
        let (sql, values) = select.build(PostgresQueryBuilder);
        let stmt = Statement {
            sql,
            values,
            lock: LockMode::None,
            lock_timeout_ms: None,
            hints: QueryHints::default(),
        };
        executor::fetch_all(conn, &stmt, ctx)
    }

    /// Count every row of the entity's table.
    pub fn count(&self, conn: &dyn StoreConnection, ctx: &CallContext) -> QuarryResult<u64> {
        let mut select = Query::select();
        select
            .expr(Expr::cust("COUNT(*)"))
            .from(Alias::new(self.descriptor.table()));
        let (sql, values) = select.build(PostgresQueryBuilder);
        let stmt = Statement {
            sql,
            values,
            lock: LockMode::None,
            lock_timeout_ms: None,
            hints: QueryHints::default(),
        };
        executor::fetch_count(conn, &stmt, ctx)
    }

    /// Delete one row by primary key; returns the removed-row count.
    pub fn delete_by_id(
        &self,
        conn: &dyn StoreConnection,
        ctx: &CallContext,
        id: impl Into<Value>,
    ) -> QuarryResult<u64> {
        let mut delete = Query::delete();
        delete
            .from_table(Alias::new(self.descriptor.table()))
            .and_where(Expr::col(Alias::new(self.descriptor.primary_key())).eq(id.into()));
        let (sql, values) = delete.build(PostgresQueryBuilder);
        let stmt = Statement {
            sql,
            values,
            lock: LockMode::None,
            lock_timeout_ms: None,
            hints: QueryHints::default(),
        };
        executor::run_execute(conn, &stmt, ctx)
    }

    fn by_id_select(&self, id: impl Into<Value>) -> Statement {
        let mut select = Query::select();
        select
            .column(sea_query::Asterisk)
            .from(Alias::new(self.descriptor.table()))
            .and_where(Expr::col(Alias::new(self.descriptor.primary_key())).eq(id.into()))
            .limit(1);
        let (sql, values) = select.build(PostgresQueryBuilder);
        Statement {
            sql,
            values,
            lock: LockMode::None,
            lock_timeout_ms: None,
            hints: QueryHints::default(),
        }
    }
}

fn reject_to_many_paging(fetch: Option<&FetchSpec>) -> QuarryResult<()> {
    if let Some(assoc) = fetch.and_then(FetchSpec::to_many_path) {
        return Err(QuarryError::FetchJoinWithPaging {
            path: assoc.name.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FieldType;
    use crate::entity::{FromStoreRow, HydratedRow};
    use once_cell::sync::Lazy;

    #[derive(Debug, Clone)]
    struct Person {
        id: i64,
        name: String,
        age: i32,
    }

    static PERSON: Lazy<Arc<EntityDescriptor>> = Lazy::new(|| {
        EntityDescriptor::builder("person", "person")
            .field("id", FieldType::BigInt)
            .field("name", FieldType::Text)
            .field("age", FieldType::Int)
            .primary_key("id")
            .build()
            .unwrap()
    });

    impl FromStoreRow for Person {
        fn from_row(row: &StoreRow) -> QuarryResult<Self> {
            Ok(Self {
                id: row.try_i64("id")?,
                name: row.try_string("name")?,
                age: row.try_i32("age")?,
            })
        }
    }

    impl FromHydratedRow for Person {
        fn from_hydrated(row: &HydratedRow) -> QuarryResult<Self> {
            Self::from_row(&row.base)
        }
    }

    impl Entity for Person {
        fn descriptor() -> Arc<EntityDescriptor> {
            PERSON.clone()
        }

        fn to_values(&self) -> Vec<(String, Value)> {
            vec![
                ("id".into(), self.id.into()),
                ("name".into(), self.name.clone().into()),
                ("age".into(), self.age.into()),
            ]
        }

        fn primary_key(&self) -> Value {
            self.id.into()
        }
    }

    fn repo() -> Repository<Person> {
        Repository::<Person>::builder(EngineConfig::default())
            .derived(
                MethodDecl::new("find_by_name")
                    .with_params([ParamSpec::Scalar(FieldType::Text)]),
            )
            .derived(MethodDecl::new("count_by_age").with_params([ParamSpec::Scalar(FieldType::Int)]))
            .explicit(ExplicitDecl::new(
                "find_seniors",
                "select * from person where age >= :age",
            ))
            .bulk(
                BulkDecl::new("raise_age")
                    .matching("age_greater_than_equal")
                    .with_params([ParamSpec::Scalar(FieldType::Int)])
                    .assign(Assignment::add("age", 1))
                    .clears_cache(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn build_registers_and_warms_the_cache() {
        let repo = repo();
        let cache = repo.plan_cache.read().unwrap();
        assert!(cache.contains_key("find_by_name"));
        assert!(cache.contains_key("raise_age"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn build_fails_on_unknown_field() {
        let err = Repository::<Person>::builder(EngineConfig::default())
            .derived(
                MethodDecl::new("find_by_salary")
                    .with_params([ParamSpec::Scalar(FieldType::Int)]),
            )
            .build()
            .err().unwrap();
        assert!(err.is_registration_error());
    }

    #[test]
    fn build_fails_on_malformed_name() {
        let err = Repository::<Person>::builder(EngineConfig::default())
            .derived(MethodDecl::new("fetch_by_name"))
            .build()
            .err().unwrap();
        assert!(matches!(err, QuarryError::MalformedQueryName { .. }));
    }

    #[test]
    fn build_fails_on_duplicate_registration() {
        let err = Repository::<Person>::builder(EngineConfig::default())
            .derived(
                MethodDecl::new("find_by_name")
                    .with_params([ParamSpec::Scalar(FieldType::Text)]),
            )
            .explicit(ExplicitDecl::new("find_by_name", "select 1"))
            .build()
            .err().unwrap();
        assert!(matches!(err, QuarryError::MalformedQueryName { .. }));
    }

    #[test]
    fn build_fails_on_bulk_without_assignments() {
        let err = Repository::<Person>::builder(EngineConfig::default())
            .bulk(BulkDecl::new("noop"))
            .build()
            .err().unwrap();
        assert!(matches!(err, QuarryError::MalformedQueryName { .. }));
    }

    #[test]
    fn build_fails_on_bulk_with_unknown_assignment_field() {
        let err = Repository::<Person>::builder(EngineConfig::default())
            .bulk(BulkDecl::new("raise").assign(Assignment::set("salary", 1)))
            .build()
            .err().unwrap();
        assert!(matches!(err, QuarryError::UnknownField { .. }));
    }

    #[test]
    fn re_derivation_matches_the_warmed_plan() {
        let repo = repo();
        let decl = match repo.op("find_by_name").unwrap() {
            RegisteredOp::Derived { decl, .. } => decl.clone(),
            _ => unreachable!(),
        };
        let warmed = repo.plan_for(&decl).unwrap();
        repo.plan_cache.write().unwrap().clear();
        let rederived = repo.plan_for(&decl).unwrap();
        assert_eq!(warmed.method, rederived.method);
        assert_eq!(warmed.predicates.len(), rederived.predicates.len());
    }
}
