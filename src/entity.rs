//! Row materialization and explicit association state.
//!
//! Entities are plain value records: no proxies, no dirty checking, no
//! hidden lazy loads. An association field is either [`Assoc::Loaded`] /
//! [`Rel::Loaded`] because the executing plan carried a fetch spec for it,
//! or it is `NotLoaded` and stays that way until the caller runs a query
//! that loads it.

use std::collections::BTreeMap;
use std::sync::Arc;

use sea_query::Value;

use crate::descriptor::EntityDescriptor;
use crate::error::{QuarryError, QuarryResult};

/// A flat row returned by the store: ordered column name/value pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreRow {
    columns: Vec<(String, Value)>,
}

impl StoreRow {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self { columns }
    }

    pub fn from_pairs<N: Into<String>, V: Into<Value>>(
        pairs: impl IntoIterator<Item = (N, V)>,
    ) -> Self {
        Self {
            columns: pairs
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.columns.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Positional access, for projection tuples.
    pub fn get_at(&self, index: usize) -> Option<&Value> {
        self.columns.get(index).map(|(_, v)| v)
    }

    pub fn try_get(&self, name: &str) -> QuarryResult<&Value> {
        self.get(name)
            .ok_or_else(|| QuarryError::Decode(format!("missing column `{name}`")))
    }

    pub fn try_i64(&self, name: &str) -> QuarryResult<i64> {
        match self.try_get(name)? {
            Value::BigInt(Some(v)) => Ok(*v),
            Value::Int(Some(v)) => Ok(i64::from(*v)),
            Value::SmallInt(Some(v)) => Ok(i64::from(*v)),
            other => Err(decode_mismatch(name, "integer", other)),
        }
    }

    pub fn try_i32(&self, name: &str) -> QuarryResult<i32> {
        match self.try_get(name)? {
            Value::Int(Some(v)) => Ok(*v),
            Value::SmallInt(Some(v)) => Ok(i32::from(*v)),
            Value::BigInt(Some(v)) => i32::try_from(*v)
                .map_err(|_| decode_mismatch(name, "i32", &Value::BigInt(Some(*v)))),
            other => Err(decode_mismatch(name, "integer", other)),
        }
    }

    pub fn try_string(&self, name: &str) -> QuarryResult<String> {
        match self.try_get(name)? {
            Value::String(Some(v)) => Ok(v.clone()),
            other => Err(decode_mismatch(name, "text", other)),
        }
    }

    pub fn try_bool(&self, name: &str) -> QuarryResult<bool> {
        match self.try_get(name)? {
            Value::Bool(Some(v)) => Ok(*v),
            other => Err(decode_mismatch(name, "bool", other)),
        }
    }

    pub fn try_opt_i64(&self, name: &str) -> QuarryResult<Option<i64>> {
        match self.try_get(name)? {
            Value::BigInt(None) | Value::Int(None) | Value::SmallInt(None) => Ok(None),
            _ => self.try_i64(name).map(Some),
        }
    }

    pub fn try_opt_string(&self, name: &str) -> QuarryResult<Option<String>> {
        match self.try_get(name)? {
            Value::String(None) => Ok(None),
            _ => self.try_string(name).map(Some),
        }
    }

    /// Whether every column in the row is NULL. A left-joined child that
    /// matched nothing comes back as an all-NULL sub-row.
    pub fn all_null(&self) -> bool {
        self.columns.iter().all(|(_, v)| is_null(v))
    }
}

fn is_null(value: &Value) -> bool {
    matches!(
        value,
        Value::Bool(None)
            | Value::TinyInt(None)
            | Value::SmallInt(None)
            | Value::Int(None)
            | Value::BigInt(None)
            | Value::TinyUnsigned(None)
            | Value::SmallUnsigned(None)
            | Value::Unsigned(None)
            | Value::BigUnsigned(None)
            | Value::Float(None)
            | Value::Double(None)
            | Value::String(None)
            | Value::Char(None)
            | Value::Bytes(None)
            | Value::Json(None)
    )
}

fn decode_mismatch(name: &str, expected: &str, got: &Value) -> QuarryError {
    QuarryError::Decode(format!("column `{name}`: expected {expected}, got {got:?}"))
}

/// A base row plus the eager-collection accumulation produced by a
/// fetch-join execution, keyed by association name.
#[derive(Debug, Clone, Default)]
pub struct HydratedRow {
    pub base: StoreRow,
    pub children: BTreeMap<String, Vec<StoreRow>>,
}

impl HydratedRow {
    pub fn children_of(&self, association: &str) -> &[StoreRow] {
        self.children
            .get(association)
            .map_or(&[], Vec::as_slice)
    }
}

/// Materialize a type from a flat row. Associations come out `NotLoaded`.
pub trait FromStoreRow: Sized {
    fn from_row(row: &StoreRow) -> QuarryResult<Self>;
}

/// Materialize a type from a fetch-join execution: the base row plus the
/// pre-loaded rows of each eager association path.
pub trait FromHydratedRow: Sized {
    fn from_hydrated(row: &HydratedRow) -> QuarryResult<Self>;
}

/// A primary-keyed record mapped to a stored row.
pub trait Entity: FromStoreRow + Clone + std::fmt::Debug {
    /// The registration-time descriptor for this entity.
    fn descriptor() -> Arc<EntityDescriptor>;

    /// Column values for insert/update, primary key included.
    fn to_values(&self) -> Vec<(String, Value)>;

    /// Primary key value of this instance.
    fn primary_key(&self) -> Value;
}

/// Explicit state of a to-many association: pre-loaded per fetch spec, or
/// absent. There is no silent on-demand fetch.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Assoc<T> {
    #[default]
    NotLoaded,
    Loaded(Vec<T>),
}

impl<T> Assoc<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub fn loaded(&self) -> Option<&[T]> {
        match self {
            Self::Loaded(items) => Some(items),
            Self::NotLoaded => None,
        }
    }
}

/// Explicit state of a to-one association.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Rel<T> {
    #[default]
    NotLoaded,
    /// Loaded; `None` when the foreign key was NULL or matched nothing.
    Loaded(Option<Box<T>>),
}

impl<T> Rel<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub fn loaded(&self) -> Option<Option<&T>> {
        match self {
            Self::Loaded(inner) => Some(inner.as_deref()),
            Self::NotLoaded => None,
        }
    }
}
