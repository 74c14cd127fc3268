//! Page and slice behavior over the scripted mock store.

use quarry::mock::MockStore;
use quarry::tests_cfg::{member_repository, member_row};
use quarry::{CallContext, NamedParams, PageRequest, ParamValue, QuarryError, SortKey};
use sea_query::Value;

fn count_row(total: i64) -> quarry::StoreRow {
    quarry::StoreRow::from_pairs([("count", Value::from(total))])
}

#[test]
fn first_page_of_five_rows_at_size_three() {
    let repo = member_repository();
    let store = MockStore::new()
        .append_rows(vec![
            member_row(1, "member1", 10, None),
            member_row(2, "member2", 10, None),
            member_row(3, "member3", 10, None),
        ])
        .append_rows(vec![count_row(5)]);
    let request = PageRequest::of(0, 3);

    let page = repo
        .find_page(
            &store,
            &CallContext::new(),
            "find_by_age",
            &[ParamValue::from(10)],
            &request,
        )
        .unwrap();

    assert_eq!(page.content().len(), 3);
    assert_eq!(page.total_elements(), 5);
    assert_eq!(page.total_pages(), 2);
    assert!(page.is_first());
    assert!(page.has_next());

    let statements = store.statements();
    assert_eq!(statements.len(), 2);
    assert!(statements[0].sql.contains("LIMIT"), "sql: {}", statements[0].sql);
    assert!(statements[1].sql.contains("COUNT(*)"));
    assert!(!statements[1].sql.contains("LIMIT"));
}

#[test]
fn second_page_is_last_and_short() {
    let repo = member_repository();
    let store = MockStore::new()
        .append_rows(vec![
            member_row(4, "member4", 10, None),
            member_row(5, "member5", 10, None),
        ])
        .append_rows(vec![count_row(5)]);
    let request = PageRequest::of(1, 3);

    let page = repo
        .find_page(
            &store,
            &CallContext::new(),
            "find_by_age",
            &[ParamValue::from(10)],
            &request,
        )
        .unwrap();

    assert_eq!(page.content().len(), 2);
    assert!(!page.is_first());
    assert!(page.is_last());
    assert!(!page.has_next());
    assert_eq!(page.number(), 1);
}

#[test]
fn request_sort_is_validated_and_rendered() {
    let repo = member_repository();
    let store = MockStore::new()
        .append_rows(vec![])
        .append_rows(vec![count_row(0)]);
    let request = PageRequest::of(0, 3).with_sort(SortKey::desc("username"));

    repo.find_page(
        &store,
        &CallContext::new(),
        "find_by_age",
        &[ParamValue::from(10)],
        &request,
    )
    .unwrap();

    let statements = store.statements();
    assert!(
        statements[0].sql.contains("\"username\" DESC"),
        "sql: {}",
        statements[0].sql
    );
}

#[test]
fn sort_on_unknown_field_fails_before_dispatch() {
    let repo = member_repository();
    let store = MockStore::new();
    let request = PageRequest::of(0, 3).with_sort(SortKey::asc("nickname"));

    let err = repo
        .find_page(
            &store,
            &CallContext::new(),
            "find_by_age",
            &[ParamValue::from(10)],
            &request,
        )
        .unwrap_err();
    assert!(matches!(err, QuarryError::UnknownField { .. }));
    assert_eq!(store.statement_count(), 0);
}

#[test]
fn zero_page_size_is_rejected() {
    let repo = member_repository();
    let store = MockStore::new();
    let err = repo
        .find_page(
            &store,
            &CallContext::new(),
            "find_by_age",
            &[ParamValue::from(10)],
            &PageRequest::of(0, 0),
        )
        .unwrap_err();
    assert!(matches!(err, QuarryError::InvalidPageRequest { .. }));
}

#[test]
fn slice_overfetches_and_trims() {
    let repo = member_repository();
    // Four rows scripted for a size-3 window: the sentinel proves a next
    // window and is trimmed from the content.
    let store = MockStore::new().append_rows(vec![
        member_row(1, "member1", 10, None),
        member_row(2, "member2", 10, None),
        member_row(3, "member3", 10, None),
        member_row(4, "member4", 10, None),
    ]);
    let request = PageRequest::of(0, 3);

    let slice = repo
        .find_slice(
            &store,
            &CallContext::new(),
            "find_by_age",
            &[ParamValue::from(10)],
            &request,
        )
        .unwrap();

    assert_eq!(slice.content().len(), 3);
    assert!(slice.has_next());

    let statements = store.statements();
    // One statement only: no count query for a slice.
    assert_eq!(statements.len(), 1);
    assert!(statements[0].sql.contains("LIMIT"), "sql: {}", statements[0].sql);
}

#[test]
fn slice_last_window_has_no_next() {
    let repo = member_repository();
    let store = MockStore::new().append_rows(vec![
        member_row(4, "member4", 10, None),
        member_row(5, "member5", 10, None),
    ]);
    let slice = repo
        .find_slice(
            &store,
            &CallContext::new(),
            "find_by_age",
            &[ParamValue::from(10)],
            &PageRequest::of(1, 3),
        )
        .unwrap();
    assert_eq!(slice.content().len(), 2);
    assert!(!slice.has_next());
}

#[test]
fn declared_order_wins_over_request_sort() {
    let repo = member_repository();
    let store = MockStore::new()
        .append_rows(vec![])
        .append_rows(vec![count_row(0)]);
    let request = PageRequest::of(0, 3).with_sort(SortKey::asc("id"));

    repo.find_page(
        &store,
        &CallContext::new(),
        "find_by_age_order_by_username_desc",
        &[ParamValue::from(10)],
        &request,
    )
    .unwrap();

    let sql = &store.statements()[0].sql;
    let declared = sql.find("\"username\" DESC").expect("declared key");
    let requested = sql.rfind("\"id\" ASC").expect("requested key");
    assert!(declared < requested, "sql: {sql}");
}

#[test]
fn explicit_page_uses_the_registered_count_template() {
    let repo = member_repository();
    let store = MockStore::new()
        .append_rows(vec![member_row(1, "AAA", 10, None)])
        .append_rows(vec![count_row(7)]);
    let params = NamedParams::new().set("age", 10);

    let page = repo
        .query_page(
            &store,
            &CallContext::new(),
            "find_page_by_age",
            &params,
            &PageRequest::of(0, 1),
        )
        .unwrap();

    assert_eq!(page.total_elements(), 7);
    assert_eq!(page.total_pages(), 7);

    let statements = store.statements();
    assert!(statements[0].sql.contains("LIMIT 1 OFFSET 0"), "sql: {}", statements[0].sql);
    assert!(statements[1].sql.starts_with("select count(*)"), "sql: {}", statements[1].sql);
    // The count template binds its own copy of the parameter.
    assert_eq!(statements[1].values.0.len(), 1);
}

#[test]
fn explicit_page_sort_must_be_a_direct_field() {
    let repo = member_repository();
    let store = MockStore::new();
    let err = repo
        .query_page(
            &store,
            &CallContext::new(),
            "find_page_by_age",
            &NamedParams::new().set("age", 10),
            &PageRequest::of(0, 1).with_sort(SortKey::asc("team.name")),
        )
        .unwrap_err();
    assert!(matches!(err, QuarryError::InvalidPageRequest { .. }));
}
