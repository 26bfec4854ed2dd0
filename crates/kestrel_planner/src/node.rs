//! The plan-node variants and the post-operator tree they carry.

use std::collections::HashSet;

use sqlparser::ast::{Expr, Offset, OrderByExpr, Select};

use kestrel_common::error::{KestrelError, PlanError};
use kestrel_router::Router;

use crate::aggregate_plan::AggregatePlan;
use crate::join_node::JoinNode;
use crate::limit_plan::LimitPlan;
use crate::merge_node::{MergeNode, QueryTuple};
use crate::orderby_plan::OrderByPlan;
use crate::table_info::{fuse_merge, FuseOp, TableInfo};
use crate::tuples::{AggPush, ColumnRef, FilterTuple, GroupTuple, JoinTuple, SelectTuple};

/// Plan kind tags, used by the explain document and the result pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanType {
    Select,
    Aggregate,
    OrderBy,
    Limit,
}

/// A proxy-side post-processing operator attached under a plan node.
#[derive(Debug)]
pub enum ChildPlan {
    Aggregate(AggregatePlan),
    OrderBy(OrderByPlan),
    Limit(LimitPlan),
}

impl ChildPlan {
    pub fn plan_type(&self) -> PlanType {
        match self {
            ChildPlan::Aggregate(_) => PlanType::Aggregate,
            ChildPlan::OrderBy(_) => PlanType::OrderBy,
            ChildPlan::Limit(_) => PlanType::Limit,
        }
    }
}

/// Ordered list of the post-operators applied to the gathered stream.
#[derive(Debug, Default)]
pub struct PlanTree {
    plans: Vec<ChildPlan>,
}

impl PlanTree {
    pub fn new() -> Self {
        PlanTree::default()
    }

    pub fn add(&mut self, plan: ChildPlan) {
        self.plans.push(plan);
    }

    pub fn plans(&self) -> &[ChildPlan] {
        &self.plans
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }
}

/// A node of the plan tree: either a pushdown leaf or a proxy-side join.
#[derive(Debug)]
pub enum SelectNode {
    Merge(MergeNode),
    Join(JoinNode),
}

impl SelectNode {
    pub fn as_merge(&self) -> Option<&MergeNode> {
        match self {
            SelectNode::Merge(m) => Some(m),
            SelectNode::Join(_) => None,
        }
    }

    pub fn as_join(&self) -> Option<&JoinNode> {
        match self {
            SelectNode::Join(j) => Some(j),
            SelectNode::Merge(_) => None,
        }
    }

    /// Aliases of every table under this subtree.
    pub fn referred_aliases(&self) -> Vec<String> {
        match self {
            SelectNode::Merge(m) => m.tables.keys().cloned().collect(),
            SelectNode::Join(j) => {
                let mut out = j.left.referred_aliases();
                out.extend(j.right.referred_aliases());
                out
            }
        }
    }

    pub(crate) fn find_table(&self, alias: &str) -> Option<&TableInfo> {
        match self {
            SelectNode::Merge(m) => m.tables.get(alias),
            SelectNode::Join(j) => j
                .left
                .find_table(alias)
                .or_else(|| j.right.find_table(alias)),
        }
    }

    pub(crate) fn set_paren(&mut self, has_paren: bool) {
        match self {
            SelectNode::Merge(m) => m.has_paren = has_paren,
            SelectNode::Join(j) => j.has_paren = has_paren,
        }
    }

    /// Push each filter to the deepest node covering its tables.
    pub(crate) fn push_filter(
        &mut self,
        filters: Vec<FilterTuple>,
        router: &Router,
    ) -> Result<(), KestrelError> {
        match self {
            SelectNode::Merge(m) => m.push_filter(filters, router),
            SelectNode::Join(j) => {
                for filter in filters {
                    j.push_filter(filter, router)?;
                }
                Ok(())
            }
        }
    }

    /// Attach equality-join predicates at their lowest common ancestor.
    pub(crate) fn push_equal_cmpr(&mut self, joins: Vec<JoinTuple>) -> Result<(), KestrelError> {
        match self {
            SelectNode::Merge(m) => {
                for tuple in joins {
                    m.add_where(tuple.expr);
                }
                Ok(())
            }
            SelectNode::Join(jn) => {
                for tuple in joins {
                    let left_aliases = jn.left.referred_aliases();
                    let right_aliases = jn.right.referred_aliases();
                    let l_side = (
                        left_aliases.contains(&tuple.left.table),
                        right_aliases.contains(&tuple.left.table),
                    );
                    let r_side = (
                        left_aliases.contains(&tuple.right.table),
                        right_aliases.contains(&tuple.right.table),
                    );
                    match (l_side, r_side) {
                        ((true, _), (_, true)) | ((_, true), (true, _)) => {
                            if jn.is_left_join {
                                return Err(PlanError::UnsupportedJoinShape(format!(
                                    "where equality across a LEFT JOIN: {}",
                                    crate::analyzer::canonical(&tuple.expr)
                                ))
                                .into());
                            }
                            jn.attach_join_tuple(tuple)?;
                        }
                        ((true, _), (true, _)) => jn.left.push_equal_cmpr(vec![tuple])?,
                        ((_, true), (_, true)) => jn.right.push_equal_cmpr(vec![tuple])?,
                        _ => {
                            return Err(PlanError::ColumnUnknown(format!(
                                "{} = {}",
                                tuple.left.label(),
                                tuple.right.label()
                            ))
                            .into())
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Resolve routes bottom-up. A join whose two sides pin to the same
    /// backend collapses into a single pushdown leaf; this is the single
    /// most important optimization the planner performs.
    pub(crate) fn calc_route(self, router: &Router) -> Result<SelectNode, KestrelError> {
        match self {
            SelectNode::Merge(mut m) => {
                m.calc_route(router)?;
                Ok(SelectNode::Merge(m))
            }
            SelectNode::Join(jn) => {
                let JoinNode {
                    left,
                    right,
                    strategy,
                    is_left_join,
                    from_comma,
                    has_paren,
                    join_on,
                    vars,
                    fields,
                    children,
                    order,
                } = jn;
                let left = (*left).calc_route(router)?;
                let right = (*right).calc_route(router)?;

                let fusable = matches!(
                    (&left, &right),
                    (SelectNode::Merge(l), SelectNode::Merge(r))
                        if l.route_len == 1
                            && r.route_len == 1
                            && l.backend.is_some()
                            && l.backend == r.backend
                );
                if fusable {
                    let (SelectNode::Merge(l), SelectNode::Merge(r)) = (left, right) else {
                        unreachable!("fusable implies two merge children");
                    };
                    tracing::debug!(backend = ?l.backend, "route: join fused into single backend");
                    let backend = l.backend.clone();
                    let index = l.index.clone();
                    let on_cond = join_on
                        .iter()
                        .map(|t| t.expr.clone())
                        .reduce(|a, b| crate::analyzer::and_expr(Some(a), b));
                    let op = if from_comma {
                        FuseOp::Comma
                    } else if is_left_join {
                        FuseOp::Left(on_cond.clone())
                    } else if on_cond.is_none() && strategy == crate::join_node::JoinStrategy::Cartesian
                    {
                        FuseOp::Cross
                    } else {
                        FuseOp::Inner(on_cond.clone())
                    };
                    let mut fused = fuse_merge(l, r, op)?;
                    if from_comma {
                        // Comma joins have no ON clause; the equalities live
                        // in the WHERE.
                        for tuple in join_on {
                            fused.add_where(tuple.expr);
                        }
                    }
                    fused.backend = backend;
                    fused.index = index;
                    fused.route_len = 1;
                    return Ok(SelectNode::Merge(fused));
                }

                Ok(SelectNode::Join(JoinNode {
                    left: Box::new(left),
                    right: Box::new(right),
                    strategy,
                    is_left_join,
                    from_comma,
                    has_paren,
                    join_on,
                    vars,
                    fields,
                    children,
                    order,
                }))
            }
        }
    }

    pub(crate) fn push_misc(&mut self, locks: &[sqlparser::ast::LockClause]) {
        match self {
            SelectNode::Merge(m) => m.push_misc(locks),
            SelectNode::Join(j) => {
                j.left.push_misc(locks);
                j.right.push_misc(locks);
            }
        }
    }

    pub(crate) fn push_select_exprs(
        &mut self,
        fields: Vec<SelectTuple>,
        groups: Vec<GroupTuple>,
        sel: &Select,
        order_by: &[OrderByExpr],
        agg_push: AggPush,
    ) -> Result<(), KestrelError> {
        match self {
            SelectNode::Merge(m) => m.push_select_exprs(fields, groups, sel, order_by, agg_push),
            SelectNode::Join(j) => j.push_select_exprs(fields, groups, sel, agg_push),
        }
    }

    pub(crate) fn push_select_expr(&mut self, tuple: SelectTuple) -> Result<(), KestrelError> {
        match self {
            SelectNode::Merge(m) => {
                m.push_select_expr(tuple);
                Ok(())
            }
            SelectNode::Join(j) => j.push_select_expr(tuple),
        }
    }

    pub(crate) fn push_col_if_absent(&mut self, col: &ColumnRef) -> Result<(), KestrelError> {
        match self {
            SelectNode::Merge(m) => {
                m.push_col_if_absent(col);
                Ok(())
            }
            SelectNode::Join(j) => {
                if j.left.referred_aliases().contains(&col.table) {
                    j.left.push_col_if_absent(col)
                } else if j.right.referred_aliases().contains(&col.table) {
                    j.right.push_col_if_absent(col)
                } else {
                    Err(PlanError::ColumnUnknown(col.label()).into())
                }
            }
        }
    }

    pub(crate) fn append_order_by_col(&mut self, col: &ColumnRef) {
        match self {
            SelectNode::Merge(m) => m.append_order_by_col(col),
            SelectNode::Join(j) => {
                if j.left.referred_aliases().contains(&col.table) {
                    j.left.append_order_by_col(col);
                } else {
                    j.right.append_order_by_col(col);
                }
            }
        }
    }

    /// AND a predicate into the WHERE of the merge leaf serving `alias`.
    pub(crate) fn add_where_covering(&mut self, expr: Expr, alias: &str) {
        match self {
            SelectNode::Merge(m) => m.add_where(expr),
            SelectNode::Join(j) => {
                if j.left.referred_aliases().iter().any(|a| a == alias) {
                    j.left.add_where_covering(expr, alias);
                } else {
                    j.right.add_where_covering(expr, alias);
                }
            }
        }
    }

    pub(crate) fn collect_external_refs(&self) -> Vec<ColumnRef> {
        match self {
            SelectNode::Merge(m) => m.external_refs(),
            SelectNode::Join(j) => {
                let mut out = j.left.collect_external_refs();
                out.extend(j.right.collect_external_refs());
                out
            }
        }
    }

    pub(crate) fn push_having(&mut self, havings: Vec<FilterTuple>) -> Result<(), KestrelError> {
        match self {
            SelectNode::Merge(m) => m.push_having(havings),
            SelectNode::Join(j) => j.push_having(havings),
        }
    }

    pub(crate) fn push_order_by(&mut self, order_by: &[OrderByExpr]) -> Result<(), KestrelError> {
        match self {
            SelectNode::Merge(m) => m.push_order_by(order_by),
            SelectNode::Join(j) => j.push_order_by(order_by),
        }
    }

    pub(crate) fn push_limit(
        &mut self,
        limit: Option<&Expr>,
        offset: Option<&Offset>,
    ) -> Result<(), KestrelError> {
        match self {
            SelectNode::Merge(m) => m.push_limit(limit, offset),
            SelectNode::Join(j) => j.push_limit(limit, offset),
        }
    }

    /// Cap every shard-bound query in the subtree at `total` rows.
    pub(crate) fn set_shard_limit(&mut self, total: usize) {
        match self {
            SelectNode::Merge(m) => m.set_shard_limit(total),
            SelectNode::Join(j) => {
                j.left.set_shard_limit(total);
                j.right.set_shard_limit(total);
            }
        }
    }

    pub(crate) fn build_query(&mut self, all_aliases: &HashSet<String>) -> Result<(), KestrelError> {
        match self {
            SelectNode::Merge(m) => m.build_query(all_aliases),
            SelectNode::Join(j) => j.build_query(all_aliases),
        }
    }

    /// All rendered per-backend queries under this subtree.
    pub fn get_query(&self) -> Vec<QueryTuple> {
        match self {
            SelectNode::Merge(m) => m.querys.to_vec(),
            SelectNode::Join(j) => {
                let mut out = j.left.get_query();
                out.extend(j.right.get_query());
                out
            }
        }
    }

    pub fn fields(&self) -> Vec<SelectTuple> {
        match self {
            SelectNode::Merge(m) => m.fields(),
            SelectNode::Join(j) => j.fields.clone(),
        }
    }

    pub fn children(&self) -> &PlanTree {
        match self {
            SelectNode::Merge(m) => &m.children,
            SelectNode::Join(j) => &j.children,
        }
    }

    /// Assign execution order indices, children before parents.
    pub(crate) fn re_order(&mut self, start: usize) -> usize {
        match self {
            SelectNode::Merge(m) => {
                m.order = start + 1;
                m.order
            }
            SelectNode::Join(j) => {
                let after_left = j.left.re_order(start);
                let after_right = j.right.re_order(after_left);
                j.order = after_right + 1;
                j.order
            }
        }
    }

    pub fn order(&self) -> usize {
        match self {
            SelectNode::Merge(m) => m.order,
            SelectNode::Join(j) => j.order,
        }
    }
}
