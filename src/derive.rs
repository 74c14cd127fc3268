//! Method-name query derivation.
//!
//! Parses repository method names such as
//! `find_by_username_and_age_greater_than` into a [`DerivedPlan`] at
//! registration time. The grammar is a fixed keyword table, not reflection:
//! subjects (`find`, `count`, `exists`, `delete`), an optional descriptive
//! filler before `_by_`, predicate tokens joined by `_and_`/`_or_`, and an
//! optional `_order_by_<field>[_asc|_desc]...` suffix.
//!
//! Everything that can go wrong here goes wrong while the repository is
//! being built. A name that parses never fails field resolution or arity
//! checks at call time.

use once_cell::sync::Lazy;

use crate::descriptor::{EntityDescriptor, FieldType};
use crate::error::{QuarryError, QuarryResult};
use crate::plan::{
    Combinator, CompareOp, DerivedPlan, Direction, ParamSpec, PredicateNode, SortKey, Subject,
};

/// Keyword table, longest suffix first so `_greater_than_equal` wins over
/// `_greater_than`. Each keyword maps to exactly one operator.
static KEYWORDS: Lazy<Vec<(&'static str, CompareOp)>> = Lazy::new(|| {
    vec![
        ("_greater_than_equal", CompareOp::Gte),
        ("_less_than_equal", CompareOp::Lte),
        ("_greater_than", CompareOp::Gt),
        ("_starting_with", CompareOp::StartingWith),
        ("_is_not_null", CompareOp::IsNotNull),
        ("_ending_with", CompareOp::EndingWith),
        ("_containing", CompareOp::Containing),
        ("_less_than", CompareOp::Lt),
        ("_not_like", CompareOp::NotLike),
        ("_is_null", CompareOp::IsNull),
        ("_between", CompareOp::Between),
        ("_not_in", CompareOp::NotIn),
        ("_false", CompareOp::IsFalse),
        ("_like", CompareOp::Like),
        ("_true", CompareOp::IsTrue),
        ("_not", CompareOp::Ne),
        ("_in", CompareOp::In),
    ]
});

const ORDER_BY: &str = "_order_by_";
const BY: &str = "_by_";

/// Derive a plan from a method name and its declared parameters.
///
/// Pure and deterministic: deriving the same name twice yields plans that
/// render identically, so callers may cache the result and re-derive on a
/// cache miss without coordination.
pub fn derive_plan(
    method: &str,
    params: &[ParamSpec],
    descriptor: &EntityDescriptor,
) -> QuarryResult<DerivedPlan> {
    let (subject, rest) = parse_subject(method)?;

    let (predicate_part, order_part) = match rest.find(ORDER_BY) {
        Some(pos) => (&rest[..pos], Some(&rest[pos + ORDER_BY.len()..])),
        None => (rest, None),
    };

    let predicate_part = match predicate_part.find(BY) {
        Some(pos) => &predicate_part[pos + BY.len()..],
        // No `_by_`: the whole segment is descriptive filler (`find_all`).
        None => "",
    };

    let predicates = parse_predicates(method, predicate_part, descriptor)?;
    check_params(method, &predicates, params)?;

    let order_by = match order_part {
        Some(part) => parse_order(method, part, descriptor)?,
        None => Vec::new(),
    };

    Ok(DerivedPlan {
        method: method.to_string(),
        subject,
        predicates,
        order_by,
        param_specs: params.to_vec(),
        projection: None,
        lock: Default::default(),
        hints: Default::default(),
    })
}

fn parse_subject(method: &str) -> QuarryResult<(Subject, &str)> {
    for (prefix, subject) in [
        ("find", Subject::Find),
        ("count", Subject::Count),
        ("exists", Subject::Exists),
        ("delete", Subject::Delete),
    ] {
        if let Some(rest) = method.strip_prefix(prefix) {
            if rest.is_empty() || rest.starts_with('_') {
                return Ok((subject, rest));
            }
        }
    }
    Err(malformed(
        method,
        "must start with find, count, exists or delete",
    ))
}

fn parse_predicates(
    method: &str,
    part: &str,
    descriptor: &EntityDescriptor,
) -> QuarryResult<Vec<PredicateNode>> {
    if part.is_empty() {
        return Ok(Vec::new());
    }
    let mut nodes = Vec::new();
    let mut link = Combinator::And;
    let mut rest = part;
    loop {
        let (token, next) = split_condition(rest);
        if token.is_empty() {
            return Err(malformed(method, "empty predicate token"));
        }
        nodes.push(parse_condition(method, token, link, descriptor)?);
        match next {
            Some((next_link, remainder)) => {
                link = next_link;
                rest = remainder;
            }
            None => break,
        }
    }
    Ok(nodes)
}

/// Split off the first condition token at the earliest `_and_`/`_or_`.
fn split_condition(part: &str) -> (&str, Option<(Combinator, &str)>) {
    let and_pos = part.find("_and_");
    let or_pos = part.find("_or_");
    match (and_pos, or_pos) {
        (Some(a), Some(o)) if a < o => (&part[..a], Some((Combinator::And, &part[a + 5..]))),
        (Some(_), Some(o)) => (&part[..o], Some((Combinator::Or, &part[o + 4..]))),
        (Some(a), None) => (&part[..a], Some((Combinator::And, &part[a + 5..]))),
        (None, Some(o)) => (&part[..o], Some((Combinator::Or, &part[o + 4..]))),
        (None, None) => (part, None),
    }
}

fn parse_condition(
    method: &str,
    token: &str,
    link: Combinator,
    descriptor: &EntityDescriptor,
) -> QuarryResult<PredicateNode> {
    // A field whose name happens to end in a keyword wins over the keyword
    // reading.
    if let Ok(path) = descriptor.resolve_token(token) {
        return Ok(PredicateNode {
            path,
            op: CompareOp::Eq,
            link,
        });
    }
    for (keyword, op) in KEYWORDS.iter() {
        if let Some(stripped) = token.strip_suffix(keyword) {
            if stripped.is_empty() {
                continue;
            }
            if let Ok(path) = descriptor.resolve_token(stripped) {
                return check_operand(method, path, *op).map(|path| PredicateNode {
                    path,
                    op: *op,
                    link,
                });
            }
        }
    }
    // Nothing resolved; report the token as the offending path.
    Err(QuarryError::UnknownField {
        entity: descriptor.name().to_string(),
        path: token.to_string(),
    })
}

fn check_operand(
    method: &str,
    path: crate::descriptor::ResolvedPath,
    op: CompareOp,
) -> QuarryResult<crate::descriptor::ResolvedPath> {
    if op.requires_text() && path.field.field_type != FieldType::Text {
        return Err(malformed(
            method,
            &format!("operator {op:?} requires a text field, `{}` is {:?}", path.path, path.field.field_type),
        ));
    }
    if op.requires_bool() && path.field.field_type != FieldType::Bool {
        return Err(malformed(
            method,
            &format!("operator {op:?} requires a boolean field, `{}` is {:?}", path.path, path.field.field_type),
        ));
    }
    Ok(path)
}

/// Bind predicate nodes left-to-right against the declared parameters and
/// verify count and types.
fn check_params(
    method: &str,
    predicates: &[PredicateNode],
    params: &[ParamSpec],
) -> QuarryResult<()> {
    let mut idx = 0;
    for node in predicates {
        let field_type = node.path.field.field_type;
        if node.op.takes_sequence() {
            let spec = next_param(method, params, &mut idx, node)?;
            match spec {
                ParamSpec::List(t) if field_type.accepts(t) => {}
                ParamSpec::List(t) => {
                    return Err(malformed(
                        method,
                        &format!("`{}` is {field_type:?} but parameter {idx} is a sequence of {t:?}", node.path.path),
                    ));
                }
                ParamSpec::Scalar(_) => {
                    return Err(malformed(
                        method,
                        &format!("operator {:?} on `{}` needs a sequence parameter", node.op, node.path.path),
                    ));
                }
            }
            continue;
        }
        for _ in 0..node.op.arity() {
            let spec = next_param(method, params, &mut idx, node)?;
            match spec {
                ParamSpec::Scalar(t) if field_type.accepts(t) => {}
                ParamSpec::Scalar(t) => {
                    return Err(malformed(
                        method,
                        &format!("`{}` is {field_type:?} but parameter {idx} is {t:?}", node.path.path),
                    ));
                }
                ParamSpec::List(_) => {
                    return Err(malformed(
                        method,
                        &format!("operator {:?} on `{}` takes a scalar, got a sequence", node.op, node.path.path),
                    ));
                }
            }
        }
    }
    if idx != params.len() {
        return Err(malformed(
            method,
            &format!("predicate consumes {idx} parameters but {} were declared", params.len()),
        ));
    }
    Ok(())
}

fn next_param(
    method: &str,
    params: &[ParamSpec],
    idx: &mut usize,
    node: &PredicateNode,
) -> QuarryResult<ParamSpec> {
    let spec = params.get(*idx).copied().ok_or_else(|| {
        malformed(
            method,
            &format!("predicate on `{}` needs a parameter but only {} were declared", node.path.path, params.len()),
        )
    })?;
    *idx += 1;
    Ok(spec)
}

fn parse_order(
    method: &str,
    part: &str,
    descriptor: &EntityDescriptor,
) -> QuarryResult<Vec<SortKey>> {
    if part.is_empty() {
        return Err(malformed(method, "empty order-by clause"));
    }
    let mut keys = Vec::new();
    let mut rest = part;
    while !rest.is_empty() {
        let (token, direction, remainder) = split_order_key(rest);
        if token.is_empty() {
            return Err(malformed(method, "empty order-by field"));
        }
        let resolved = descriptor.resolve_token(token)?;
        keys.push(SortKey {
            path: resolved.path,
            direction,
        });
        rest = remainder;
    }
    Ok(keys)
}

/// Split off one `<field>[_asc|_desc]` key. A direction marker only counts
/// at a token boundary (end of string or followed by `_`).
fn split_order_key(part: &str) -> (&str, Direction, &str) {
    let mut best: Option<(usize, usize, Direction)> = None;
    for (marker, direction) in [("_asc", Direction::Asc), ("_desc", Direction::Desc)] {
        let mut from = 0;
        while let Some(pos) = part[from..].find(marker) {
            let pos = from + pos;
            let end = pos + marker.len();
            let at_boundary = end == part.len() || part.as_bytes()[end] == b'_';
            if at_boundary && best.map_or(true, |(b, _, _)| pos < b) {
                best = Some((pos, end, direction));
                break;
            }
            from = end;
        }
    }
    match best {
        Some((pos, end, direction)) => {
            let remainder = part[end..].strip_prefix('_').unwrap_or(&part[end..]);
            (&part[..pos], direction, remainder)
        }
        // No direction marker: the whole remainder is one ascending key.
        None => (part, Direction::Asc, ""),
    }
}

fn malformed(method: &str, reason: &str) -> QuarryError {
    QuarryError::MalformedQueryName {
        method: method.to_string(),
        reason: reason.to_string(),
    }
}
