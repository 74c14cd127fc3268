//! Fetch-join execution: one round trip, regrouped parents, loaded
//! associations.

use quarry::mock::MockStore;
use quarry::tests_cfg::{member_repository, team_repository};
use quarry::{Assoc, CallContext, PageRequest, QuarryError, Rel, StoreRow};
use sea_query::Value;

fn team_row_with_member(team_id: i64, team_name: &str, member: Option<(i64, &str)>) -> StoreRow {
    let (member_id, member_name) = match member {
        Some((id, name)) => (Value::from(id), Value::from(name)),
        None => (Value::BigInt(None), Value::String(None)),
    };
    StoreRow::from_pairs([
        ("id", Value::from(team_id)),
        ("name", Value::from(team_name)),
        ("members__id", member_id),
        ("members__username", member_name),
        (
            "members__age",
            match member {
                Some(_) => Value::from(20i32),
                None => Value::Int(None),
            },
        ),
        (
            "members__team_id",
            match member {
                Some(_) => Value::from(team_id),
                None => Value::BigInt(None),
            },
        ),
    ])
}

#[test]
fn to_many_fetch_regroups_duplicate_parents() {
    let repo = team_repository();
    // The join returns one row per (team, member) pair; two members of the
    // same team must collapse into one parent with both children.
    let store = MockStore::new().append_rows(vec![
        team_row_with_member(1, "teamA", Some((10, "m1"))),
        team_row_with_member(1, "teamA", Some((11, "m2"))),
        team_row_with_member(2, "teamB", Some((12, "m3"))),
    ]);

    let teams = repo
        .find_fetched(&store, &CallContext::new(), "find_all_with_members", &[])
        .unwrap();

    assert_eq!(teams.len(), 2);
    assert_eq!(teams[0].name, "teamA");
    match &teams[0].members {
        Assoc::Loaded(members) => {
            assert_eq!(members.len(), 2);
            assert_eq!(members[0].username, "m1");
            assert_eq!(members[1].username, "m2");
        }
        Assoc::NotLoaded => panic!("members not loaded"),
    }
    match &teams[1].members {
        Assoc::Loaded(members) => assert_eq!(members.len(), 1),
        Assoc::NotLoaded => panic!("members not loaded"),
    }

    // Single round trip.
    assert_eq!(store.statement_count(), 1);
    let sql = &store.statements()[0].sql;
    assert!(sql.contains("LEFT JOIN"), "sql: {sql}");
    assert!(sql.contains("members__username"), "sql: {sql}");
}

#[test]
fn memberless_parent_gets_an_empty_loaded_collection() {
    let repo = team_repository();
    let store = MockStore::new().append_rows(vec![team_row_with_member(3, "teamC", None)]);

    let teams = repo
        .find_fetched(&store, &CallContext::new(), "find_all_with_members", &[])
        .unwrap();

    assert_eq!(teams.len(), 1);
    match &teams[0].members {
        Assoc::Loaded(members) => assert!(members.is_empty()),
        Assoc::NotLoaded => panic!("members not loaded"),
    }
}

#[test]
fn to_one_fetch_loads_the_parent_side() {
    let repo = member_repository();
    let store = MockStore::new().append_rows(vec![StoreRow::from_pairs([
        ("id", Value::from(4i64)),
        ("username", Value::from("BBB")),
        ("age", Value::from(20i32)),
        ("team_id", Value::from(1i64)),
        ("team__id", Value::from(1i64)),
        ("team__name", Value::from("teamA")),
    ])]);

    let members = repo
        .find_fetched(
            &store,
            &CallContext::new(),
            "find_with_team_by_username",
            &["BBB".into()],
        )
        .unwrap();

    assert_eq!(members.len(), 1);
    match &members[0].team {
        Rel::Loaded(Some(team)) => assert_eq!(team.name, "teamA"),
        other => panic!("team not loaded: {other:?}"),
    }
    assert_eq!(store.statement_count(), 1);
}

#[test]
fn to_one_fetch_with_null_foreign_key_loads_none() {
    let repo = member_repository();
    let store = MockStore::new().append_rows(vec![StoreRow::from_pairs([
        ("id", Value::from(5i64)),
        ("username", Value::from("CCC")),
        ("age", Value::from(30i32)),
        ("team_id", Value::BigInt(None)),
        ("team__id", Value::BigInt(None)),
        ("team__name", Value::String(None)),
    ])]);

    let members = repo
        .find_fetched(&store, &CallContext::new(), "find_all_with_team", &[])
        .unwrap();

    assert_eq!(members.len(), 1);
    assert!(matches!(members[0].team, Rel::Loaded(None)));
}

#[test]
fn paging_over_a_to_many_fetch_is_rejected() {
    let repo = team_repository();
    let store = MockStore::new();
    let err = repo
        .find_page(
            &store,
            &CallContext::new(),
            "find_with_members_by_name",
            &["teamA".into()],
            &PageRequest::of(0, 3),
        )
        .unwrap_err();
    match err {
        QuarryError::FetchJoinWithPaging { path } => assert_eq!(path, "members"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.statement_count(), 0);
}

#[test]
fn slicing_over_a_to_many_fetch_is_rejected() {
    let repo = team_repository();
    let store = MockStore::new();
    let err = repo
        .find_slice(
            &store,
            &CallContext::new(),
            "find_with_members_by_name",
            &["teamA".into()],
            &PageRequest::of(0, 3),
        )
        .unwrap_err();
    assert!(matches!(err, QuarryError::FetchJoinWithPaging { .. }));
}

#[test]
fn paging_combines_with_a_to_one_fetch() {
    let repo = member_repository();
    let store = MockStore::new()
        .append_rows(vec![StoreRow::from_pairs([
            ("id", Value::from(4i64)),
            ("username", Value::from("BBB")),
            ("age", Value::from(20i32)),
            ("team_id", Value::from(1i64)),
            ("team__id", Value::from(1i64)),
            ("team__name", Value::from("teamA")),
        ])])
        .append_rows(vec![StoreRow::from_pairs([("count", Value::from(1i64))])]);

    let page = repo
        .find_page(
            &store,
            &CallContext::new(),
            "find_all_with_team",
            &[],
            &PageRequest::of(0, 3),
        )
        .unwrap();

    assert_eq!(page.content().len(), 1);
    assert_eq!(page.total_elements(), 1);
    match &page.content()[0].team {
        Rel::Loaded(Some(team)) => assert_eq!(team.name, "teamA"),
        other => panic!("team not loaded: {other:?}"),
    }
    // The count statement carries no join: the filter never touches the
    // association.
    let statements = store.statements();
    assert!(!statements[1].sql.contains("JOIN"), "sql: {}", statements[1].sql);
}

#[test]
fn plain_find_on_a_fetch_method_is_rejected() {
    let repo = member_repository();
    let store = MockStore::new();
    let err = repo
        .find(&store, &CallContext::new(), "find_all_with_team", &[])
        .unwrap_err();
    assert!(matches!(err, QuarryError::WrongInvocation { .. }));
}

#[test]
fn plain_method_cannot_use_find_fetched() {
    let repo = member_repository();
    let store = MockStore::new();
    let err = repo
        .find_fetched(&store, &CallContext::new(), "find_by_username", &["AAA".into()])
        .unwrap_err();
    assert!(matches!(err, QuarryError::WrongInvocation { .. }));
}
