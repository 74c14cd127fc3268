//! Shared test fixtures: a two-entity domain and a pre-registered
//! repository covering every kind of method declaration.
//!
//! Public so integration tests and doc examples can use the same fixtures
//! as the unit tests.

use std::sync::Arc;

use once_cell::sync::Lazy;
use sea_query::Value;

use crate::bulk::Assignment;
use crate::config::EngineConfig;
use crate::descriptor::{EntityDescriptor, FieldType};
use crate::entity::{Assoc, Entity, FromHydratedRow, FromStoreRow, HydratedRow, Rel, StoreRow};
use crate::error::QuarryResult;
use crate::plan::{LockMode, ParamSpec};
use crate::repository::{BulkDecl, ExplicitDecl, MethodDecl, Repository};

pub static TEAM: Lazy<Arc<EntityDescriptor>> = Lazy::new(|| {
    let member_flat = EntityDescriptor::builder("member", "member")
        .field("id", FieldType::BigInt)
        .field("username", FieldType::Text)
        .field("age", FieldType::Int)
        .nullable_field("team_id", FieldType::BigInt)
        .primary_key("id")
        .build()
        .unwrap_or_else(|e| panic!("member descriptor: {e}"));
    EntityDescriptor::builder("team", "team")
        .field("id", FieldType::BigInt)
        .field("name", FieldType::Text)
        .primary_key("id")
        .to_many("members", member_flat.target_ref(), "id", "team_id")
        .build()
        .unwrap_or_else(|e| panic!("team descriptor: {e}"))
});

pub static MEMBER: Lazy<Arc<EntityDescriptor>> = Lazy::new(|| {
    EntityDescriptor::builder("member", "member")
        .field("id", FieldType::BigInt)
        .field("username", FieldType::Text)
        .field("age", FieldType::Int)
        .nullable_field("team_id", FieldType::BigInt)
        .primary_key("id")
        .to_one("team", TEAM.target_ref(), "team_id", "id")
        .build()
        .unwrap_or_else(|e| panic!("member descriptor: {e}"))
});

#[derive(Debug, Clone)]
pub struct Member {
    pub id: i64,
    pub username: String,
    pub age: i32,
    pub team_id: Option<i64>,
    pub team: Rel<Team>,
}

#[derive(Debug, Clone)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub members: Assoc<Member>,
}

impl FromStoreRow for Member {
    fn from_row(row: &StoreRow) -> QuarryResult<Self> {
        Ok(Self {
            id: row.try_i64("id")?,
            username: row.try_string("username")?,
            age: row.try_i32("age")?,
            team_id: row.try_opt_i64("team_id")?,
            team: Rel::NotLoaded,
        })
    }
}

impl FromHydratedRow for Member {
    fn from_hydrated(row: &HydratedRow) -> QuarryResult<Self> {
        let mut member = Self::from_row(&row.base)?;
        match row.children_of("team").first() {
            Some(team_row) => {
                member.team = Rel::Loaded(Some(Box::new(Team::from_row(team_row)?)));
            }
            None => {
                member.team = Rel::Loaded(None);
            }
        }
        Ok(member)
    }
}

impl Entity for Member {
    fn descriptor() -> Arc<EntityDescriptor> {
        MEMBER.clone()
    }

    fn to_values(&self) -> Vec<(String, Value)> {
        vec![
            ("id".into(), self.id.into()),
            ("username".into(), self.username.clone().into()),
            ("age".into(), self.age.into()),
            ("team_id".into(), self.team_id.into()),
        ]
    }

    fn primary_key(&self) -> Value {
        self.id.into()
    }
}

impl FromStoreRow for Team {
    fn from_row(row: &StoreRow) -> QuarryResult<Self> {
        Ok(Self {
            id: row.try_i64("id")?,
            name: row.try_string("name")?,
            members: Assoc::NotLoaded,
        })
    }
}

impl FromHydratedRow for Team {
    fn from_hydrated(row: &HydratedRow) -> QuarryResult<Self> {
        let mut team = Self::from_row(&row.base)?;
        let members: QuarryResult<Vec<Member>> = row
            .children_of("members")
            .iter()
            .map(Member::from_row)
            .collect();
        team.members = Assoc::Loaded(members?);
        Ok(team)
    }
}

impl Entity for Team {
    fn descriptor() -> Arc<EntityDescriptor> {
        TEAM.clone()
    }

    fn to_values(&self) -> Vec<(String, Value)> {
        vec![
            ("id".into(), self.id.into()),
            ("name".into(), self.name.clone().into()),
        ]
    }

    fn primary_key(&self) -> Value {
        self.id.into()
    }
}

pub fn member(id: i64, username: &str, age: i32, team_id: Option<i64>) -> Member {
    Member {
        id,
        username: username.to_string(),
        age,
        team_id,
        team: Rel::NotLoaded,
    }
}

pub fn member_row(id: i64, username: &str, age: i32, team_id: Option<i64>) -> StoreRow {
    StoreRow::from_pairs([
        ("id", Value::from(id)),
        ("username", Value::from(username)),
        ("age", Value::from(age)),
        (
            "team_id",
            match team_id {
                Some(v) => Value::from(v),
                None => Value::BigInt(None),
            },
        ),
    ])
}

/// The full method surface exercised across the test suite.
pub fn member_repository() -> Repository<Member> {
    member_repository_with(EngineConfig::default())
}

pub fn member_repository_with(config: EngineConfig) -> Repository<Member> {
    Repository::<Member>::builder(config)
        .derived(MethodDecl::new("find_by_username_and_age_greater_than").with_params([
            ParamSpec::Scalar(FieldType::Text),
            ParamSpec::Scalar(FieldType::Int),
        ]))
        .derived(
            MethodDecl::new("find_by_username").with_params([ParamSpec::Scalar(FieldType::Text)]),
        )
        .derived(MethodDecl::new("find_by_age").with_params([ParamSpec::Scalar(FieldType::Int)]))
        .derived(
            MethodDecl::new("find_by_age_order_by_username_desc")
                .with_params([ParamSpec::Scalar(FieldType::Int)]),
        )
        .derived(
            MethodDecl::new("find_by_username_in").with_params([ParamSpec::List(FieldType::Text)]),
        )
        .derived(MethodDecl::new("count_by_age").with_params([ParamSpec::Scalar(FieldType::Int)]))
        .derived(
            MethodDecl::new("exists_by_username")
                .with_params([ParamSpec::Scalar(FieldType::Text)]),
        )
        .derived(
            MethodDecl::new("delete_by_age_less_than")
                .with_params([ParamSpec::Scalar(FieldType::Int)]),
        )
        .derived(MethodDecl::new("find_all_with_team").with_fetch(["team"]))
        .derived(
            MethodDecl::new("find_with_team_by_username")
                .with_params([ParamSpec::Scalar(FieldType::Text)])
                .with_fetch(["team"]),
        )
        .derived(
            MethodDecl::new("find_read_only_by_username")
                .with_params([ParamSpec::Scalar(FieldType::Text)])
                .read_only(),
        )
        .derived(
            MethodDecl::new("find_lock_by_username")
                .with_params([ParamSpec::Scalar(FieldType::Text)])
                .with_lock(LockMode::Update),
        )
        .derived(
            MethodDecl::new("find_usernames_by_age_greater_than_equal")
                .with_params([ParamSpec::Scalar(FieldType::Int)])
                .with_projection(["username"]),
        )
        .explicit(ExplicitDecl::new(
            "find_user",
            "select * from member where username = :username and age = :age",
        ))
        .explicit(ExplicitDecl::new(
            "find_member_summary",
            "select m.id, m.username, t.name from member m \
             left join team t on m.team_id = t.id",
        ))
        .explicit(ExplicitDecl::new(
            "find_by_names",
            "select * from member where username in :names",
        ))
        .explicit(
            ExplicitDecl::new("find_page_by_age", "select * from member where age = :age")
                .with_count("select count(*) from member where age = :age"),
        )
        .explicit(ExplicitDecl::new(
            "reset_age",
            "update member set age = :age where username = :username",
        ))
        .bulk(
            BulkDecl::new("bulk_age_plus")
                .matching("age_greater_than_equal")
                .with_params([ParamSpec::Scalar(FieldType::Int)])
                .assign(Assignment::add("age", 1))
                .clears_cache(),
        )
        .build()
        .unwrap_or_else(|e| panic!("member repository: {e}"))
}

/// Repository over [`Team`], for to-many fetch joins.
pub fn team_repository() -> Repository<Team> {
    Repository::<Team>::builder(EngineConfig::default())
        .derived(MethodDecl::new("find_all_with_members").with_fetch(["members"]))
        .derived(
            MethodDecl::new("find_with_members_by_name")
                .with_params([ParamSpec::Scalar(FieldType::Text)])
                .with_fetch(["members"]),
        )
        .derived(MethodDecl::new("find_by_name").with_params([ParamSpec::Scalar(FieldType::Text)]))
        .build()
        .unwrap_or_else(|e| panic!("team repository: {e}"))
}
