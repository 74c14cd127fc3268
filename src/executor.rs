//! Statement rendering and execution.
//!
//! The executor turns an immutable [`QueryPlan`](crate::plan::QueryPlan)
//! plus call-time parameters into a [`Statement`], rendered SQL with bound
//! values, never interpolated, and runs it over a [`StoreConnection`].
//! It holds no transaction state: every call runs inside whatever
//! unit-of-work the caller's connection is attached to, and may be issued
//! from any thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use sea_query::{
    Alias, Asterisk, Expr, ExprTrait, LockType, Order, PostgresQueryBuilder, Query,
    SelectStatement, Value, Values,
};

use crate::descriptor::{AssociationDef, EntityDescriptor, ResolvedPath};
use crate::entity::{FromHydratedRow, FromStoreRow, HydratedRow, StoreRow};
use crate::error::{QuarryError, QuarryResult, StoreFailure};
use crate::fetch::FetchSpec;
use crate::plan::{
    Combinator, CompareOp, DerivedPlan, Direction, ExplicitPlan, LockMode, ParamValue, QueryHints,
    SortKey,
};

/// A cancellation token shared between a caller and an in-flight call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Deadline and cancellation context for a single call.
///
/// Checked before dispatch and forwarded to the store so the driver can
/// honor it mid-statement. A cancelled call returns no rows, never partial
/// rows.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    token: CancelToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_token(mut self, token: CancelToken) -> Self {
        self.token = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Fail fast if the caller already gave up on this call.
    pub fn check(&self) -> Result<(), StoreFailure> {
        if self.token.is_cancelled() {
            return Err(StoreFailure::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StoreFailure::DeadlineExceeded);
            }
        }
        Ok(())
    }
}

/// A rendered statement: SQL text, bound values, and the pass-through
/// instructions (lock, lock-wait timeout, hints) the store applies itself.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub values: Values,
    pub lock: LockMode,
    pub lock_timeout_ms: Option<u64>,
    pub hints: QueryHints,
}

impl Statement {
    fn new(sql: String, values: Values) -> Self {
        Self {
            sql,
            values,
            lock: LockMode::None,
            lock_timeout_ms: None,
            hints: QueryHints::default(),
        }
    }
}

/// The seam to the backing store.
///
/// Implementations accept rendered statements with bound parameters and
/// return rows or affected-row counts. Dialect translation, connection
/// lifecycle and retry-on-transient-failure live behind this trait, not in
/// the engine; so do lock acquisition, deadlock detection and lock release.
pub trait StoreConnection {
    fn query(&self, statement: &Statement, ctx: &CallContext)
        -> Result<Vec<StoreRow>, StoreFailure>;

    fn execute(&self, statement: &Statement, ctx: &CallContext) -> Result<u64, StoreFailure>;
}

/// Named parameters for explicit query templates.
#[derive(Debug, Clone, Default)]
pub struct NamedParams(Vec<(String, ParamValue)>);

impl NamedParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.0.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }
}

/// Row window applied by the pagination engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowSpec {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

// ---------------------------------------------------------------------------
// Derived-plan rendering
// ---------------------------------------------------------------------------

fn col(table: &str, column: &str) -> (Alias, Alias) {
    (Alias::new(table), Alias::new(column))
}

fn path_col(desc: &EntityDescriptor, path: &ResolvedPath) -> (Alias, Alias) {
    match &path.association {
        Some(assoc) => col(&assoc.target.table, &path.field.name),
        None => col(desc.table(), &path.field.name),
    }
}

struct ParamCursor<'a> {
    method: &'a str,
    values: &'a [ParamValue],
    index: usize,
}

impl<'a> ParamCursor<'a> {
    fn next_scalar(&mut self) -> QuarryResult<Value> {
        match self.next()? {
            ParamValue::Scalar(v) => Ok(v.clone()),
            ParamValue::List(_) => Err(self.mismatch("scalar", "sequence")),
        }
    }

    fn next_list(&mut self) -> QuarryResult<Vec<Value>> {
        match self.next()? {
            ParamValue::List(vs) => Ok(vs.clone()),
            ParamValue::Scalar(_) => Err(self.mismatch("sequence", "scalar")),
        }
    }

    fn next_text(&mut self) -> QuarryResult<String> {
        match self.next_scalar()? {
            Value::String(Some(s)) => Ok(s.clone()),
            other => Err(QuarryError::Decode(format!(
                "method `{}`: pattern parameter must be text, got {other:?}",
                self.method
            ))),
        }
    }

    fn next(&mut self) -> QuarryResult<&'a ParamValue> {
        let value =
            self.values
                .get(self.index)
                .ok_or_else(|| QuarryError::MalformedQueryName {
                    method: self.method.to_string(),
                    reason: format!("call supplied only {} parameters", self.values.len()),
                })?;
        self.index += 1;
        Ok(value)
    }

    fn mismatch(&self, expected: &str, got: &str) -> QuarryError {
        QuarryError::MalformedQueryName {
            method: self.method.to_string(),
            reason: format!("parameter {}: expected {expected}, got {got}", self.index),
        }
    }

    fn finish(self) -> QuarryResult<()> {
        if self.index != self.values.len() {
            return Err(QuarryError::MalformedQueryName {
                method: self.method.to_string(),
                reason: format!(
                    "call supplied {} parameters, predicate consumes {}",
                    self.values.len(),
                    self.index
                ),
            });
        }
        Ok(())
    }
}

/// Render the WHERE condition of a derived plan, consuming `params` in
/// predicate order. Returns `None` for an empty predicate.
pub(crate) fn render_condition(
    desc: &EntityDescriptor,
    plan: &DerivedPlan,
    params: &[ParamValue],
) -> QuarryResult<Option<Expr>> {
    let mut cursor = ParamCursor {
        method: &plan.method,
        values: params,
        index: 0,
    };
    let mut acc: Option<Expr> = None;
    for node in &plan.predicates {
        let column = Expr::col(path_col(desc, &node.path));
        let expr = match node.op {
            CompareOp::Eq => column.eq(cursor.next_scalar()?),
            CompareOp::Ne => column.ne(cursor.next_scalar()?),
            CompareOp::Gt => column.gt(cursor.next_scalar()?),
            CompareOp::Gte => column.gte(cursor.next_scalar()?),
            CompareOp::Lt => column.lt(cursor.next_scalar()?),
            CompareOp::Lte => column.lte(cursor.next_scalar()?),
            CompareOp::Between => {
                let low = cursor.next_scalar()?;
                let high = cursor.next_scalar()?;
                column.between(low, high)
            }
            CompareOp::In => column.is_in(cursor.next_list()?),
            CompareOp::NotIn => column.is_not_in(cursor.next_list()?),
            CompareOp::Like => column.like(cursor.next_text()?),
            CompareOp::NotLike => column.not_like(cursor.next_text()?),
            CompareOp::StartingWith => column.like(format!("{}%", cursor.next_text()?)),
            CompareOp::EndingWith => column.like(format!("%{}", cursor.next_text()?)),
            CompareOp::Containing => column.like(format!("%{}%", cursor.next_text()?)),
            CompareOp::IsNull => column.is_null(),
            CompareOp::IsNotNull => column.is_not_null(),
            CompareOp::IsTrue => column.eq(true),
            CompareOp::IsFalse => column.eq(false),
        };
        acc = Some(match (acc, node.link) {
            (None, _) => expr,
            (Some(left), Combinator::And) => left.and(expr),
            (Some(left), Combinator::Or) => left.or(expr),
        });
    }
    cursor.finish()?;
    Ok(acc)
}

fn join_associations(
    plan: &DerivedPlan,
    fetch: Option<&FetchSpec>,
    sort: &[SortKey],
    desc: &EntityDescriptor,
) -> QuarryResult<Vec<AssociationDef>> {
    let mut joins: Vec<AssociationDef> = Vec::new();
    fn add(joins: &mut Vec<AssociationDef>, assoc: &AssociationDef) {
        if !joins.iter().any(|a| a.name == assoc.name) {
            joins.push(assoc.clone());
        }
    }
    for node in &plan.predicates {
        if let Some(assoc) = &node.path.association {
            add(&mut joins, assoc);
        }
    }
    for key in &plan.order_by {
        if let Some(assoc) = &desc.resolve_path(&key.path)?.association {
            add(&mut joins, assoc);
        }
    }
    for key in sort {
        if let Some(assoc) = &desc.resolve_path(&key.path)?.association {
            add(&mut joins, assoc);
        }
    }
    if let Some(paths) = &plan.projection {
        for path in paths {
            if let Some(assoc) = &desc.resolve_path(path)?.association {
                add(&mut joins, assoc);
            }
        }
    }
    if let Some(spec) = fetch {
        for assoc in spec.paths() {
            add(&mut joins, assoc);
        }
    }
    Ok(joins)
}

fn apply_joins(select: &mut SelectStatement, desc: &EntityDescriptor, joins: &[AssociationDef]) {
    for assoc in joins {
        select.left_join(
            Alias::new(&assoc.target.table),
            Expr::col(col(desc.table(), &assoc.local_column))
                .equals(col(&assoc.target.table, &assoc.target_column)),
        );
    }
}

fn apply_order(
    select: &mut SelectStatement,
    desc: &EntityDescriptor,
    keys: &[SortKey],
) -> QuarryResult<()> {
    for key in keys {
        let resolved = desc.resolve_path(&key.path)?;
        let order = match key.direction {
            Direction::Asc => Order::Asc,
            Direction::Desc => Order::Desc,
        };
        select.order_by(path_col(desc, &resolved), order);
    }
    Ok(())
}

fn order_dedup(declared: &[SortKey], requested: &[SortKey]) -> Vec<SortKey> {
    // Method-declared order always comes first; a request-supplied key on
    // the same path would contradict it and is dropped.
    let mut keys: Vec<SortKey> = declared.to_vec();
    for key in requested {
        if !keys.iter().any(|k| k.path == key.path) {
            keys.push(key.clone());
        }
    }
    keys
}

/// Render a derived plan into a SELECT statement.
#[allow(clippy::too_many_arguments)]
pub(crate) fn render_select(
    desc: &EntityDescriptor,
    plan: &DerivedPlan,
    params: &[ParamValue],
    fetch: Option<&FetchSpec>,
    requested_sort: &[SortKey],
    window: WindowSpec,
    lock_timeout_ms: Option<u64>,
) -> QuarryResult<Statement> {
    let sort = order_dedup(&plan.order_by, requested_sort);
    let joins = join_associations(plan, fetch, &sort, desc)?;

    let mut select = Query::select();
    select.from(Alias::new(desc.table()));

    match &plan.projection {
        Some(paths) => {
            for path in paths {
                let resolved = desc.resolve_path(path)?;
                select.expr_as(Expr::col(path_col(desc, &resolved)), Alias::new(path.as_str()));
            }
        }
        None if joins.is_empty() => {
            select.column(Asterisk);
        }
        None => {
            // Joined statements project the base columns explicitly so the
            // joined tables never leak into entity rows.
            for field in desc.fields() {
                select.column(col(desc.table(), &field.name));
            }
            if let Some(spec) = fetch {
                for assoc in spec.paths() {
                    for field in &assoc.target.fields {
                        select.expr_as(
                            Expr::col(col(&assoc.target.table, &field.name)),
                            Alias::new(format!("{}__{}", assoc.name, field.name)),
                        );
                    }
                }
            }
        }
    }

    apply_joins(&mut select, desc, &joins);
    if let Some(condition) = render_condition(desc, plan, params)? {
        select.and_where(condition);
    }
    apply_order(&mut select, desc, &sort)?;
    if let Some(limit) = window.limit {
        select.limit(limit);
    }
    if let Some(offset) = window.offset {
        select.offset(offset);
    }
    match plan.lock {
        LockMode::None => {}
        LockMode::Share => {
            select.lock(LockType::Share);
        }
        LockMode::Update => {
            select.lock(LockType::Update);
        }
    }

    let (sql, values) = select.build(PostgresQueryBuilder);
    let mut statement = Statement::new(sql, values);
    statement.lock = plan.lock;
    statement.hints = plan.hints;
    if plan.lock != LockMode::None {
        statement.lock_timeout_ms = lock_timeout_ms;
    }
    Ok(statement)
}

/// Render the companion count statement for a derived plan: same filter, no
/// projection, no ordering, no window. Joins are added only when the filter
/// itself reaches through an association.
pub(crate) fn render_count(
    desc: &EntityDescriptor,
    plan: &DerivedPlan,
    params: &[ParamValue],
) -> QuarryResult<Statement> {
    let joins = join_associations(plan, None, &[], desc)?;
    let mut select = Query::select();
    select
        .expr(Expr::cust("COUNT(*)"))
        .from(Alias::new(desc.table()));
    apply_joins(&mut select, desc, &joins);
    if let Some(condition) = render_condition(desc, plan, params)? {
        select.and_where(condition);
    }
    let (sql, values) = select.build(PostgresQueryBuilder);
    Ok(Statement::new(sql, values))
}

/// Render a derived delete. Association traversal is rejected at
/// registration, so every predicate here is a direct column.
pub(crate) fn render_delete(
    desc: &EntityDescriptor,
    plan: &DerivedPlan,
    params: &[ParamValue],
) -> QuarryResult<Statement> {
    let mut delete = Query::delete();
    delete.from_table(Alias::new(desc.table()));
    if let Some(condition) = render_condition(desc, plan, params)? {
        delete.and_where(condition);
    }
    let (sql, values) = delete.build(PostgresQueryBuilder);
    Ok(Statement::new(sql, values))
}

// ---------------------------------------------------------------------------
// Explicit-plan binding
// ---------------------------------------------------------------------------

static NAMED_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r":[A-Za-z_][A-Za-z0-9_]*").unwrap_or_else(|e| panic!("named-param regex: {e}"))
});

/// Substitute `:name` references in a template with positional placeholders
/// and collect bound values in placeholder order.
///
/// A `::` sequence is a cast, not a parameter. Sequence-valued parameters
/// expand to a parenthesized placeholder list so `in :names` works. A
/// referenced name absent from `params` fails with `UnboundParameter`;
/// supplied names the template never references are ignored with a debug
/// log.
pub(crate) fn bind_template(
    template: &str,
    params: &NamedParams,
) -> QuarryResult<(String, Values)> {
    let mut sql = String::with_capacity(template.len());
    let mut values: Vec<Value> = Vec::new();
    let mut last = 0;
    let mut referenced: Vec<&str> = Vec::new();

    for found in NAMED_PARAM.find_iter(template) {
        let start = found.start();
        // `::text`-style casts are not parameters.
        if start > 0 && template.as_bytes()[start - 1] == b':' {
            continue;
        }
        let name = &found.as_str()[1..];
        sql.push_str(&template[last..start]);
        last = found.end();
        referenced.push(name);

        let value = params
            .get(name)
            .ok_or_else(|| QuarryError::UnboundParameter {
                name: name.to_string(),
            })?;
        match value {
            ParamValue::Scalar(v) => {
                values.push(v.clone());
                sql.push_str(&format!("${}", values.len()));
            }
            ParamValue::List(vs) => {
                sql.push('(');
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    values.push(v.clone());
                    sql.push_str(&format!("${}", values.len()));
                }
                sql.push(')');
            }
        }
    }
    sql.push_str(&template[last..]);

    for name in params.names() {
        if !referenced.contains(&name) {
            log::debug!("named parameter `{name}` supplied but not referenced by template");
        }
    }

    Ok((sql, Values(values)))
}

/// Bind an explicit plan's main template.
pub(crate) fn bind_explicit(
    plan: &ExplicitPlan,
    params: &NamedParams,
    window: WindowSpec,
    lock_timeout_ms: Option<u64>,
) -> QuarryResult<Statement> {
    let (mut sql, values) = bind_template(&plan.template, params)?;
    if let Some(limit) = window.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = window.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }
    let mut statement = Statement::new(sql, values);
    statement.lock = plan.lock;
    statement.hints = plan.hints;
    if plan.lock != LockMode::None {
        statement.lock_timeout_ms = lock_timeout_ms;
    }
    Ok(statement)
}

/// Bind an explicit plan's count statement: the registered count template if
/// one was supplied, otherwise the base template wrapped in a count
/// subquery.
pub(crate) fn bind_explicit_count(
    plan: &ExplicitPlan,
    params: &NamedParams,
) -> QuarryResult<Statement> {
    let (sql, values) = match &plan.count_template {
        Some(template) => bind_template(template, params)?,
        None => {
            let (base, values) = bind_template(&plan.template, params)?;
            (format!("SELECT COUNT(*) FROM ({base}) AS count_sub"), values)
        }
    };
    Ok(Statement::new(sql, values))
}

// ---------------------------------------------------------------------------
// Dispatch and materialization
// ---------------------------------------------------------------------------

#[cfg(feature = "tracing")]
fn statement_span(sql: &str) -> tracing::Span {
    tracing::debug_span!("quarry_statement", sql = %sql)
}

/// Run a query statement and return raw rows.
pub fn run_query<C: StoreConnection + ?Sized>(
    conn: &C,
    statement: &Statement,
    ctx: &CallContext,
) -> QuarryResult<Vec<StoreRow>> {
    ctx.check()?;
    #[cfg(feature = "tracing")]
    let _span = statement_span(&statement.sql).entered();
    log::debug!("query: {}", statement.sql);
    Ok(conn.query(statement, ctx)?)
}

/// Run a mutating statement and return the affected-row count.
pub fn run_execute<C: StoreConnection + ?Sized>(
    conn: &C,
    statement: &Statement,
    ctx: &CallContext,
) -> QuarryResult<u64> {
    ctx.check()?;
    #[cfg(feature = "tracing")]
    let _span = statement_span(&statement.sql).entered();
    log::debug!("execute: {}", statement.sql);
    Ok(conn.execute(statement, ctx)?)
}

/// Run a query and materialize each row.
pub fn fetch_all<T: FromStoreRow, C: StoreConnection + ?Sized>(
    conn: &C,
    statement: &Statement,
    ctx: &CallContext,
) -> QuarryResult<Vec<T>> {
    run_query(conn, statement, ctx)?
        .iter()
        .map(T::from_row)
        .collect()
}

/// Run a count-shaped query: one row, one integer column.
pub fn fetch_count<C: StoreConnection + ?Sized>(
    conn: &C,
    statement: &Statement,
    ctx: &CallContext,
) -> QuarryResult<u64> {
    let rows = run_query(conn, statement, ctx)?;
    let row = rows
        .first()
        .ok_or_else(|| QuarryError::Decode("count query returned no rows".into()))?;
    let value = row
        .get_at(0)
        .ok_or_else(|| QuarryError::Decode("count query returned an empty row".into()))?;
    match value {
        Value::BigInt(Some(v)) if *v >= 0 => Ok(*v as u64),
        Value::Int(Some(v)) if *v >= 0 => Ok(*v as u64),
        Value::BigUnsigned(Some(v)) => Ok(*v),
        Value::Unsigned(Some(v)) => Ok(u64::from(*v)),
        other => Err(QuarryError::Decode(format!("count query returned {other:?}"))),
    }
}

/// Run a fetch-join query and regroup the joined rows.
pub fn fetch_hydrated<T: FromHydratedRow, C: StoreConnection + ?Sized>(
    conn: &C,
    statement: &Statement,
    ctx: &CallContext,
    desc: &EntityDescriptor,
    spec: &FetchSpec,
) -> QuarryResult<Vec<T>> {
    let rows = run_query(conn, statement, ctx)?;
    let hydrated = regroup(rows, desc, spec)?;
    hydrated.iter().map(T::from_hydrated).collect()
}

/// Regroup fetch-join rows into one parent per primary key.
///
/// The first-seen row wins; eager rows from subsequent duplicates are
/// appended to the same in-memory parent, preserving store order. All-NULL
/// sub-rows from unmatched left joins are dropped.
pub(crate) fn regroup(
    rows: Vec<StoreRow>,
    desc: &EntityDescriptor,
    spec: &FetchSpec,
) -> QuarryResult<Vec<HydratedRow>> {
    let mut parents: Vec<HydratedRow> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let pk = desc.primary_key();

    for row in rows {
        let mut base = StoreRow::default();
        let mut children: Vec<(String, StoreRow)> = spec
            .paths()
            .iter()
            .map(|a| (a.name.clone(), StoreRow::default()))
            .collect();

        'cols: for (name, value) in row.columns() {
            for (assoc, child) in children.iter_mut() {
                let prefix = format!("{assoc}__");
                if let Some(stripped) = name.strip_prefix(prefix.as_str()) {
                    child.push(stripped, value.clone());
                    continue 'cols;
                }
            }
            base.push(name, value.clone());
        }

        let key = format!("{:?}", base.try_get(pk)?);
        let slot = match index.get(&key) {
            Some(&i) => i,
            None => {
                parents.push(HydratedRow {
                    base,
                    children: Default::default(),
                });
                index.insert(key, parents.len() - 1);
                parents.len() - 1
            }
        };
        let parent = &mut parents[slot];
        for (assoc, child) in children {
            if child.all_null() {
                continue;
            }
            let bucket = parent.children.entry(assoc).or_default();
            // A to-one join repeats the same child on every duplicate row.
            if !bucket.contains(&child) {
                bucket.push(child);
            }
        }
    }
    Ok(parents)
}
