//! FROM-clause scanning: resolve table references through the router and
//! build the initial plan tree.
//!
//! Fusion rules, leaves first:
//! - a single table reference becomes a `MergeNode`;
//! - a side consisting only of GLOBAL tables fuses into its sibling (the
//!   join runs shard-local against the replica), except onto the outer
//!   side of a LEFT JOIN, where per-shard preserved rows would duplicate;
//! - anything else becomes a `JoinNode`, Cartesian until the ON/WHERE
//!   analysis finds better.

use sqlparser::ast::{
    Expr, Join, JoinConstraint, JoinOperator, TableFactor, TableWithJoins, Value as AstValue,
};

use kestrel_common::error::{KestrelError, PlanError};
use kestrel_router::{Router, Segment, ShardType};

use crate::analyzer::{self, and_expr};
use crate::join_node::{JoinNode, JoinStrategy};
use crate::merge_node::MergeNode;
use crate::node::SelectNode;

/// Routing metadata for one table occurrence in the FROM clause.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub database: String,
    /// Logical table name.
    pub table: String,
    /// The name the query refers to it by: the alias when present.
    pub alias: String,
    pub shard_type: ShardType,
    /// Shard-key column; empty for Global/Single tables.
    pub shard_key: String,
    /// Live segments; narrowed in place by route calculation.
    pub segments: Vec<Segment>,
}

/// How two merge leaves combine when they fuse into one node.
pub(crate) enum FuseOp {
    Comma,
    Cross,
    Inner(Option<Expr>),
    Left(Option<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinKind {
    Comma,
    Cross,
    Inner,
    Left,
}

/// Walk the FROM clause and produce the initial `SelectNode` tree.
pub(crate) fn scan_table_exprs(
    router: &Router,
    database: &str,
    from: &[TableWithJoins],
) -> Result<SelectNode, KestrelError> {
    let mut acc: Option<SelectNode> = None;
    for twj in from {
        let node = scan_table_with_joins(router, database, twj)?;
        acc = Some(match acc {
            None => node,
            Some(prev) => join(router, prev, node, JoinKind::Comma, None)?,
        });
    }
    acc.ok_or_else(|| PlanError::Unsupported("select without a FROM clause".to_string()).into())
}

fn scan_table_with_joins(
    router: &Router,
    database: &str,
    twj: &TableWithJoins,
) -> Result<SelectNode, KestrelError> {
    let mut node = scan_table_factor(router, database, &twj.relation)?;
    for j in &twj.joins {
        let right = scan_table_factor(router, database, &j.relation)?;
        node = match &j.join_operator {
            JoinOperator::Inner(c) => {
                join(router, node, right, JoinKind::Inner, constraint_on(c)?)?
            }
            JoinOperator::LeftOuter(c) => {
                join(router, node, right, JoinKind::Left, constraint_on(c)?)?
            }
            JoinOperator::RightOuter(c) => {
                // A RIGHT JOIN B == B LEFT JOIN A.
                join(router, right, node, JoinKind::Left, constraint_on(c)?)?
            }
            JoinOperator::CrossJoin => join(router, node, right, JoinKind::Cross, None)?,
            other => {
                return Err(PlanError::UnsupportedJoinShape(format!("{:?}", other)).into());
            }
        };
    }
    Ok(node)
}

fn constraint_on(constraint: &JoinConstraint) -> Result<Option<Expr>, KestrelError> {
    match constraint {
        JoinConstraint::On(e) => Ok(Some(e.clone())),
        JoinConstraint::None => Ok(None),
        JoinConstraint::Using(_) => {
            Err(PlanError::UnsupportedJoinShape("JOIN ... USING".to_string()).into())
        }
        JoinConstraint::Natural => {
            Err(PlanError::UnsupportedJoinShape("NATURAL JOIN".to_string()).into())
        }
    }
}

fn scan_table_factor(
    router: &Router,
    database: &str,
    factor: &TableFactor,
) -> Result<SelectNode, KestrelError> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let parts = &name.0;
            let table = parts
                .last()
                .map(|i| i.value.clone())
                .ok_or_else(|| KestrelError::Parse("empty table name".to_string()))?;
            let db = if parts.len() >= 2 {
                parts[parts.len() - 2].value.clone()
            } else {
                database.to_string()
            };
            let alias_name = match alias {
                Some(a) => {
                    if !a.columns.is_empty() {
                        return Err(PlanError::Unsupported(
                            "column aliases on a table reference".to_string(),
                        )
                        .into());
                    }
                    a.name.value.clone()
                }
                None => table.clone(),
            };
            let route = router.table(&db, &table)?;
            let info = TableInfo {
                database: db,
                table,
                alias: alias_name,
                shard_type: route.shard_type,
                shard_key: route.shard_key,
                segments: route.segments,
            };
            Ok(SelectNode::Merge(MergeNode::new_leaf(info)?))
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            let mut node = scan_table_with_joins(router, database, table_with_joins)?;
            node.set_paren(true);
            Ok(node)
        }
        TableFactor::Derived { .. } => Err(PlanError::UnsupportedSubquery.into()),
        other => Err(PlanError::Unsupported(format!("table expression {:?}", other)).into()),
    }
}

/// Combine two scanned subtrees under a join operator.
fn join(
    router: &Router,
    left: SelectNode,
    right: SelectNode,
    kind: JoinKind,
    on: Option<Expr>,
) -> Result<SelectNode, KestrelError> {
    for alias in right.referred_aliases() {
        if left.referred_aliases().contains(&alias) {
            return Err(PlanError::DuplicateTableAlias(alias).into());
        }
    }

    // All-GLOBAL sides collapse into the sibling for a shard-local join.
    if let (SelectNode::Merge(l), SelectNode::Merge(r)) = (&left, &right) {
        let l_global = l.non_global_cnt == 0;
        let r_global = r.non_global_cnt == 0;
        let left_join_outer_global = kind == JoinKind::Left && l_global && !r_global;
        if (l_global || r_global) && !left_join_outer_global {
            let (SelectNode::Merge(l), SelectNode::Merge(r)) = (left, right) else {
                unreachable!("checked merge variants above");
            };
            let op = match kind {
                JoinKind::Comma => FuseOp::Comma,
                JoinKind::Cross => FuseOp::Cross,
                JoinKind::Inner => FuseOp::Inner(on),
                JoinKind::Left => FuseOp::Left(on),
            };
            return Ok(SelectNode::Merge(fuse_merge(l, r, op)?));
        }
    }

    let mut jn = JoinNode::new(left, right, kind == JoinKind::Left, kind == JoinKind::Comma);
    if let Some(on_expr) = on {
        let scope: Vec<String> = jn
            .left
            .referred_aliases()
            .into_iter()
            .chain(jn.right.referred_aliases())
            .collect();
        let had_col_refs = !analyzer::column_refs(&on_expr).is_empty();
        let (joins, filters) = analyzer::parse_where_or_join(&on_expr, &scope)?;
        for tuple in joins {
            jn.attach_join_tuple(tuple)?;
        }
        for filter in filters {
            push_on_filter(&mut jn, filter, router)?;
        }
        if jn.strategy == JoinStrategy::Cartesian && had_col_refs {
            jn.strategy = JoinStrategy::NestedLoop;
        }
    }
    Ok(SelectNode::Join(jn))
}

/// Route a non-equality ON conjunct. ON predicates filter the join pairs,
/// so inner-side pushes stay correct even under a LEFT JOIN; outer-side
/// pushes would not.
fn push_on_filter(
    jn: &mut JoinNode,
    filter: crate::tuples::FilterTuple,
    router: &Router,
) -> Result<(), KestrelError> {
    let left_aliases = jn.left.referred_aliases();
    let right_aliases = jn.right.referred_aliases();
    if filter.refer_tables.is_empty() {
        return jn.right.push_filter(vec![filter], router);
    }
    let in_left = filter.refer_tables.iter().all(|t| left_aliases.contains(t));
    let in_right = filter
        .refer_tables
        .iter()
        .all(|t| right_aliases.contains(t));
    if in_right {
        return jn.right.push_filter(vec![filter], router);
    }
    if in_left {
        if jn.is_left_join {
            return Err(PlanError::UnsupportedJoinShape(format!(
                "ON filter on the outer side of a LEFT JOIN: {}",
                analyzer::canonical(&filter.expr)
            ))
            .into());
        }
        return jn.left.push_filter(vec![filter], router);
    }
    if !jn.is_left_join {
        if let Some(alias) = filter
            .refer_tables
            .iter()
            .find(|t| right_aliases.contains(*t))
        {
            let alias = alias.clone();
            jn.strategy = JoinStrategy::NestedLoop;
            jn.right.add_where_covering(filter.expr, &alias);
            return Ok(());
        }
    }
    Err(PlanError::UnsupportedJoinShape(format!(
        "ON predicate spanning both join sides: {}",
        analyzer::canonical(&filter.expr)
    ))
    .into())
}

/// Fuse two merge leaves into one pushdown node, combining FROM clauses
/// and WHERE predicates.
pub(crate) fn fuse_merge(
    mut left: MergeNode,
    right: MergeNode,
    op: FuseOp,
) -> Result<MergeNode, KestrelError> {
    for alias in right.tables.keys() {
        if left.tables.contains_key(alias) {
            return Err(PlanError::DuplicateTableAlias(alias.clone()).into());
        }
    }
    let right_from = right.select().from.clone();
    let right_where = right.select().selection.clone();
    let right_paren = right.has_paren;

    match op {
        FuseOp::Comma => {
            left.select_mut().from.extend(right_from);
            if let Some(w) = right_where {
                merge_where(&mut left, w);
            }
        }
        other => {
            if right_from.len() != 1 {
                return Err(PlanError::UnsupportedJoinShape(
                    "parenthesized table list in join".to_string(),
                )
                .into());
            }
            let rtwj = right_from.into_iter().next().expect("length checked");
            let relation = if rtwj.joins.is_empty() && !right_paren {
                rtwj.relation
            } else {
                TableFactor::NestedJoin {
                    table_with_joins: Box::new(rtwj),
                    alias: None,
                }
            };
            let (operator, keep_where) = match other {
                FuseOp::Cross => (JoinOperator::CrossJoin, true),
                FuseOp::Inner(cond) => {
                    let constraint = match cond {
                        Some(e) => JoinConstraint::On(e),
                        None => JoinConstraint::None,
                    };
                    (JoinOperator::Inner(constraint), true)
                }
                FuseOp::Left(cond) => {
                    // Inner-side predicates belong in the ON clause; merged
                    // into the WHERE they would drop preserved rows.
                    let cond = match (cond, right_where.clone()) {
                        (Some(c), Some(w)) => Some(and_expr(Some(c), w)),
                        (Some(c), None) => Some(c),
                        (None, Some(w)) => Some(w),
                        (None, None) => None,
                    };
                    let constraint = match cond {
                        Some(e) => JoinConstraint::On(e),
                        None => JoinConstraint::On(Expr::Value(AstValue::Boolean(true))),
                    };
                    (JoinOperator::LeftOuter(constraint), false)
                }
                FuseOp::Comma => unreachable!("handled above"),
            };
            left.select_mut()
                .from
                .last_mut()
                .expect("from is never empty")
                .joins
                .push(Join {
                    relation,
                    join_operator: operator,
                });
            if keep_where {
                if let Some(w) = right_where {
                    merge_where(&mut left, w);
                }
            }
        }
    }

    left.tables.extend(right.tables);
    left.non_global_cnt += right.non_global_cnt;
    left.filter_keys.extend(right.filter_keys);
    left.fields.extend(right.fields);
    left.has_paren = false;
    Ok(left)
}

fn merge_where(node: &mut MergeNode, expr: Expr) {
    let sel = node.select_mut();
    sel.selection = Some(and_expr(sel.selection.take(), expr));
}
