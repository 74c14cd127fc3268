//! Eager-fetch planning.
//!
//! A [`FetchSpec`] names the association paths a query should materialize
//! eagerly, in one fetch-join round trip, instead of leaving them
//! `NotLoaded`. Planning resolves every path against the entity descriptor
//! and applies the cross-product policy: any number of to-one paths combine
//! freely, but more than one to-many path multiplies rows and is rejected
//! (or merely logged, per configuration).

use crate::config::AmbiguousFetchPolicy;
use crate::descriptor::{AssociationDef, Cardinality, EntityDescriptor};
use crate::error::{QuarryError, QuarryResult};

/// Ordered, de-duplicated set of association paths to eagerly materialize.
#[derive(Debug, Clone)]
pub struct FetchSpec {
    paths: Vec<AssociationDef>,
}

impl FetchSpec {
    /// Resolve `paths` against `descriptor` and build a spec.
    ///
    /// Fails with `UnknownField` for a path that is not an association of
    /// the entity, and with `AmbiguousFetchCombination` when more than one
    /// to-many path is requested under the `Reject` policy.
    pub fn plan(
        descriptor: &EntityDescriptor,
        paths: &[&str],
        policy: AmbiguousFetchPolicy,
    ) -> QuarryResult<Self> {
        let mut resolved: Vec<AssociationDef> = Vec::new();
        for path in paths {
            let assoc = descriptor
                .association(path)
                .ok_or_else(|| QuarryError::UnknownField {
                    entity: descriptor.name().to_string(),
                    path: (*path).to_string(),
                })?;
            if resolved.iter().any(|a| a.name == assoc.name) {
                continue;
            }
            resolved.push(assoc.clone());
        }

        let to_many: Vec<String> = resolved
            .iter()
            .filter(|a| a.cardinality == Cardinality::ToMany)
            .map(|a| a.name.clone())
            .collect();
        if to_many.len() > 1 {
            match policy {
                AmbiguousFetchPolicy::Reject => {
                    return Err(QuarryError::AmbiguousFetchCombination { paths: to_many });
                }
                AmbiguousFetchPolicy::Warn => {
                    log::warn!(
                        "fetch plan for `{}` joins multiple to-many paths {:?}; \
                         expect a row cross-product",
                        descriptor.name(),
                        to_many
                    );
                }
            }
        }

        Ok(Self { paths: resolved })
    }

    pub fn paths(&self) -> &[AssociationDef] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// First to-many path, if any. Row-based paging over such a spec is
    /// rejected because the joined row count no longer matches the entity
    /// count.
    pub fn to_many_path(&self) -> Option<&AssociationDef> {
        self.paths
            .iter()
            .find(|a| a.cardinality == Cardinality::ToMany)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FieldType;
    use std::sync::Arc;

    fn team_with_members() -> Arc<EntityDescriptor> {
        let member = EntityDescriptor::builder("member", "member")
            .field("id", FieldType::BigInt)
            .field("username", FieldType::Text)
            .nullable_field("team_id", FieldType::BigInt)
            .primary_key("id")
            .build()
            .unwrap();
        let coach = EntityDescriptor::builder("coach", "coach")
            .field("id", FieldType::BigInt)
            .field("name", FieldType::Text)
            .primary_key("id")
            .build()
            .unwrap();
        EntityDescriptor::builder("team", "team")
            .field("id", FieldType::BigInt)
            .field("name", FieldType::Text)
            .field("coach_id", FieldType::BigInt)
            .primary_key("id")
            .to_many("members", member.target_ref(), "id", "team_id")
            .to_many("reserves", member.target_ref(), "id", "team_id")
            .to_one("coach", coach.target_ref(), "coach_id", "id")
            .build()
            .unwrap()
    }

    #[test]
    fn plans_single_to_many_path() {
        let spec = FetchSpec::plan(
            &team_with_members(),
            &["members"],
            AmbiguousFetchPolicy::Reject,
        )
        .unwrap();
        assert_eq!(spec.paths().len(), 1);
        assert!(spec.to_many_path().is_some());
    }

    #[test]
    fn duplicate_paths_collapse() {
        let spec = FetchSpec::plan(
            &team_with_members(),
            &["members", "members"],
            AmbiguousFetchPolicy::Reject,
        )
        .unwrap();
        assert_eq!(spec.paths().len(), 1);
    }

    #[test]
    fn rejects_unknown_association() {
        let err = FetchSpec::plan(
            &team_with_members(),
            &["sponsors"],
            AmbiguousFetchPolicy::Reject,
        )
        .unwrap_err();
        assert!(matches!(err, QuarryError::UnknownField { .. }));
    }

    #[test]
    fn rejects_two_to_many_paths_by_default() {
        let err = FetchSpec::plan(
            &team_with_members(),
            &["members", "reserves"],
            AmbiguousFetchPolicy::Reject,
        )
        .unwrap_err();
        match err {
            QuarryError::AmbiguousFetchCombination { paths } => {
                assert_eq!(paths, vec!["members".to_string(), "reserves".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn warn_policy_builds_the_plan_anyway() {
        let spec = FetchSpec::plan(
            &team_with_members(),
            &["members", "reserves"],
            AmbiguousFetchPolicy::Warn,
        )
        .unwrap();
        assert_eq!(spec.paths().len(), 2);
    }

    #[test]
    fn to_one_paths_combine_freely() {
        let spec = FetchSpec::plan(
            &team_with_members(),
            &["coach", "members"],
            AmbiguousFetchPolicy::Reject,
        )
        .unwrap();
        assert_eq!(spec.paths().len(), 2);
        assert_eq!(spec.to_many_path().unwrap().name, "members");
    }
}
