//! Entity descriptors.
//!
//! A descriptor is the registration-time picture of a stored row: its typed
//! fields, which one is the primary key, and its associations. Every derived
//! predicate, sort key, projection and fetch path is resolved against a
//! descriptor when the repository is built, so a bad field name fails the
//! application at startup instead of the first call.

use std::sync::Arc;

use crate::error::{QuarryError, QuarryResult};

/// Storage type of a field. Maps one-to-one onto the `sea_query::Value`
/// variants the engine binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int,
    BigInt,
    Float,
    Text,
    Uuid,
    Timestamp,
    Json,
}

impl FieldType {
    /// Whether a declared parameter of type `other` may bind against a field
    /// of this type. Integer widths are interchangeable at the binding level;
    /// everything else must match exactly.
    pub fn accepts(self, other: FieldType) -> bool {
        match (self, other) {
            (Self::Int | Self::BigInt, Self::Int | Self::BigInt) => true,
            (a, b) => a == b,
        }
    }
}

/// A typed field on an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

/// Association cardinality, seen from the declaring entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    ToOne,
    ToMany,
}

/// Flat view of an association target.
///
/// Deliberately does not point back at a full [`EntityDescriptor`]: the two
/// sides of a bidirectional association would otherwise form a reference
/// cycle. The target ref carries exactly what rendering and validation need.
#[derive(Debug, Clone)]
pub struct TargetRef {
    pub entity: String,
    pub table: String,
    pub primary_key: String,
    pub fields: Vec<FieldDef>,
}

impl TargetRef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// An association declared on an entity.
#[derive(Debug, Clone)]
pub struct AssociationDef {
    pub name: String,
    pub target: TargetRef,
    pub cardinality: Cardinality,
    /// Column on the declaring entity's table participating in the join.
    pub local_column: String,
    /// Column on the target table it joins to.
    pub target_column: String,
    /// Whether the declaring side owns the foreign key.
    pub owning: bool,
}

/// A field reference resolved against a descriptor.
///
/// Direct fields have no association hop; nested paths such as `team.name`
/// carry the association they were reached through. One hop is supported,
/// matching what a single join can answer.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// Dotted form, e.g. `team.name`.
    pub path: String,
    /// Terminal field definition.
    pub field: FieldDef,
    /// Association traversed to reach the field, if any.
    pub association: Option<AssociationDef>,
}

impl ResolvedPath {
    pub fn is_nested(&self) -> bool {
        self.association.is_some()
    }
}

/// Registration-time description of an entity.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    name: String,
    table: String,
    fields: Vec<FieldDef>,
    primary_key: String,
    associations: Vec<AssociationDef>,
}

impl EntityDescriptor {
    pub fn builder(name: impl Into<String>, table: impl Into<String>) -> EntityDescriptorBuilder {
        EntityDescriptorBuilder {
            name: name.into(),
            table: table.into(),
            fields: Vec::new(),
            primary_key: None,
            associations: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn primary_key_field(&self) -> &FieldDef {
        // Validated by the builder.
        self.fields
            .iter()
            .find(|f| f.name == self.primary_key)
            .unwrap()
    }

    pub fn associations(&self) -> &[AssociationDef] {
        &self.associations
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn association(&self, name: &str) -> Option<&AssociationDef> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// Flat view of this descriptor, usable as an association target.
    pub fn target_ref(&self) -> TargetRef {
        TargetRef {
            entity: self.name.clone(),
            table: self.table.clone(),
            primary_key: self.primary_key.clone(),
            fields: self.fields.clone(),
        }
    }

    /// Resolve a dotted path (`age`, `team.name`) against this descriptor.
    pub fn resolve_path(&self, path: &str) -> QuarryResult<ResolvedPath> {
        match path.split_once('.') {
            None => {
                let field = self.field(path).ok_or_else(|| self.unknown(path))?;
                Ok(ResolvedPath {
                    path: path.to_string(),
                    field: field.clone(),
                    association: None,
                })
            }
            Some((assoc_name, rest)) => {
                let assoc = self.association(assoc_name).ok_or_else(|| self.unknown(path))?;
                // One hop only: the remainder must be a plain field on the target.
                let field = assoc.target.field(rest).ok_or_else(|| self.unknown(path))?;
                Ok(ResolvedPath {
                    path: path.to_string(),
                    field: field.clone(),
                    association: Some(assoc.clone()),
                })
            }
        }
    }

    /// Resolve a snake_case method-name token (`age`, `team_name`) the way
    /// the derivator sees it: a direct field wins; otherwise the token is
    /// split at association boundaries and walked one hop.
    pub fn resolve_token(&self, token: &str) -> QuarryResult<ResolvedPath> {
        if self.field(token).is_some() {
            return self.resolve_path(token);
        }
        for assoc in &self.associations {
            let prefix = format!("{}_", assoc.name);
            if let Some(rest) = token.strip_prefix(&prefix) {
                if assoc.target.field(rest).is_some() {
                    return self.resolve_path(&format!("{}.{}", assoc.name, rest));
                }
            }
        }
        Err(self.unknown(token))
    }

    fn unknown(&self, path: &str) -> QuarryError {
        QuarryError::UnknownField {
            entity: self.name.clone(),
            path: path.to_string(),
        }
    }
}

/// Builder for [`EntityDescriptor`]. Validates at `build()`: the primary key
/// must name a declared field, and association join columns must exist on
/// both sides.
pub struct EntityDescriptorBuilder {
    name: String,
    table: String,
    fields: Vec<FieldDef>,
    primary_key: Option<String>,
    associations: Vec<AssociationDef>,
}

impl EntityDescriptorBuilder {
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            field_type,
            nullable: false,
        });
        self
    }

    pub fn nullable_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            field_type,
            nullable: true,
        });
        self
    }

    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = Some(name.into());
        self
    }

    /// Declare a many-to-one association owned by this entity
    /// (`local_column` holds the foreign key).
    pub fn to_one(
        mut self,
        name: impl Into<String>,
        target: TargetRef,
        local_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        self.associations.push(AssociationDef {
            name: name.into(),
            target,
            cardinality: Cardinality::ToOne,
            local_column: local_column.into(),
            target_column: target_column.into(),
            owning: true,
        });
        self
    }

    /// Declare a one-to-many association; the foreign key lives on the
    /// target (`target_column`).
    pub fn to_many(
        mut self,
        name: impl Into<String>,
        target: TargetRef,
        local_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        self.associations.push(AssociationDef {
            name: name.into(),
            target,
            cardinality: Cardinality::ToMany,
            local_column: local_column.into(),
            target_column: target_column.into(),
            owning: false,
        });
        self
    }

    pub fn build(self) -> QuarryResult<Arc<EntityDescriptor>> {
        let primary_key = self.primary_key.ok_or_else(|| QuarryError::UnknownField {
            entity: self.name.clone(),
            path: "<primary key>".into(),
        })?;
        if !self.fields.iter().any(|f| f.name == primary_key) {
            return Err(QuarryError::UnknownField {
                entity: self.name,
                path: primary_key,
            });
        }
        for assoc in &self.associations {
            if !self.fields.iter().any(|f| f.name == assoc.local_column) {
                return Err(QuarryError::UnknownField {
                    entity: self.name.clone(),
                    path: assoc.local_column.clone(),
                });
            }
            if assoc.target.field(&assoc.target_column).is_none() {
                return Err(QuarryError::UnknownField {
                    entity: assoc.target.entity.clone(),
                    path: assoc.target_column.clone(),
                });
            }
        }
        Ok(Arc::new(EntityDescriptor {
            name: self.name,
            table: self.table,
            fields: self.fields,
            primary_key,
            associations: self.associations,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team() -> Arc<EntityDescriptor> {
        EntityDescriptor::builder("team", "team")
            .field("id", FieldType::BigInt)
            .field("name", FieldType::Text)
            .primary_key("id")
            .build()
            .unwrap()
    }

    fn member() -> Arc<EntityDescriptor> {
        EntityDescriptor::builder("member", "member")
            .field("id", FieldType::BigInt)
            .field("username", FieldType::Text)
            .field("age", FieldType::Int)
            .nullable_field("team_id", FieldType::BigInt)
            .primary_key("id")
            .to_one("team", team().target_ref(), "team_id", "id")
            .build()
            .unwrap()
    }

    #[test]
    fn resolves_direct_field() {
        let desc = member();
        let resolved = desc.resolve_path("age").unwrap();
        assert_eq!(resolved.field.field_type, FieldType::Int);
        assert!(!resolved.is_nested());
    }

    #[test]
    fn resolves_nested_path_through_association() {
        let desc = member();
        let resolved = desc.resolve_path("team.name").unwrap();
        assert!(resolved.is_nested());
        assert_eq!(resolved.association.as_ref().unwrap().target.table, "team");
        assert_eq!(resolved.field.name, "name");
    }

    #[test]
    fn unknown_field_is_an_error() {
        let desc = member();
        let err = desc.resolve_path("nickname").unwrap_err();
        assert!(matches!(err, QuarryError::UnknownField { .. }));
    }

    #[test]
    fn token_resolution_prefers_direct_fields() {
        let desc = member();
        // `team_id` is both a real column and a potential `team` + `id` walk;
        // the direct field must win.
        let resolved = desc.resolve_token("team_id").unwrap();
        assert!(!resolved.is_nested());
        let nested = desc.resolve_token("team_name").unwrap();
        assert_eq!(nested.path, "team.name");
    }

    #[test]
    fn builder_rejects_missing_primary_key_field() {
        let err = EntityDescriptor::builder("broken", "broken")
            .field("name", FieldType::Text)
            .primary_key("id")
            .build()
            .unwrap_err();
        assert!(matches!(err, QuarryError::UnknownField { .. }));
    }

    #[test]
    fn builder_rejects_bad_join_column() {
        let err = EntityDescriptor::builder("member", "member")
            .field("id", FieldType::BigInt)
            .primary_key("id")
            .to_one("team", team().target_ref(), "team_id", "id")
            .build()
            .unwrap_err();
        assert!(matches!(err, QuarryError::UnknownField { .. }));
    }
}
