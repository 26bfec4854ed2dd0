//! Cross-shard joins executed in the proxy.

use std::collections::HashSet;

use sqlparser::ast::{Expr, Offset, OrderByExpr, Select};

use kestrel_common::error::{KestrelError, PlanError};

use crate::analyzer;
use crate::limit_plan::LimitPlan;
use crate::node::{ChildPlan, PlanTree, SelectNode};
use crate::orderby_plan::OrderByPlan;
use crate::tuples::{AggPush, FilterTuple, GroupTuple, JoinTuple, SelectTuple};

/// How the proxy drives a cross-shard join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStrategy {
    /// No usable predicate; every row pair is produced.
    Cartesian,
    /// Equi-join; both inputs arrive sorted on the join keys and are
    /// merged streaming.
    SortMerge,
    /// Non-equi predicates; the inner side is re-queried per outer row
    /// through bind variables.
    NestedLoop,
}

/// A column procured from the outer side and substituted as a bind
/// variable in the inner side's query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinVar {
    pub name: String,
    pub table: String,
    pub column: String,
}

#[derive(Debug)]
pub struct JoinNode {
    pub(crate) left: Box<SelectNode>,
    pub(crate) right: Box<SelectNode>,
    pub(crate) strategy: JoinStrategy,
    pub(crate) is_left_join: bool,
    /// True when the join came from a comma-separated FROM list.
    pub(crate) from_comma: bool,
    pub(crate) has_paren: bool,
    pub(crate) join_on: Vec<JoinTuple>,
    pub(crate) vars: Vec<JoinVar>,
    pub(crate) fields: Vec<SelectTuple>,
    pub(crate) children: PlanTree,
    pub(crate) order: usize,
}

impl JoinNode {
    pub(crate) fn new(
        left: SelectNode,
        right: SelectNode,
        is_left_join: bool,
        from_comma: bool,
    ) -> JoinNode {
        JoinNode {
            left: Box::new(left),
            right: Box::new(right),
            strategy: JoinStrategy::Cartesian,
            is_left_join,
            from_comma,
            has_paren: false,
            join_on: Vec::new(),
            vars: Vec::new(),
            fields: Vec::new(),
            children: PlanTree::new(),
            order: 0,
        }
    }

    pub fn strategy(&self) -> JoinStrategy {
        self.strategy
    }

    pub fn is_left_join(&self) -> bool {
        self.is_left_join
    }

    pub fn left(&self) -> &SelectNode {
        &self.left
    }

    pub fn right(&self) -> &SelectNode {
        &self.right
    }

    pub fn vars(&self) -> &[JoinVar] {
        &self.vars
    }

    /// Record one cross-side equality, orienting it left-to-right. An
    /// equality upgrades a Cartesian join to SortMerge: both sides ship
    /// sorted on the keys and the proxy merge-joins the streams. Once a
    /// predicate forced the nested loop, equalities stay there too (they
    /// become bind-variable filters on the inner side).
    pub(crate) fn attach_join_tuple(&mut self, tuple: JoinTuple) -> Result<(), KestrelError> {
        let left_aliases = self.left.referred_aliases();
        let oriented = if left_aliases.contains(&tuple.left.table) {
            tuple
        } else {
            JoinTuple {
                expr: tuple.expr,
                left: tuple.right,
                right: tuple.left,
            }
        };
        if self.strategy == JoinStrategy::Cartesian {
            self.strategy = JoinStrategy::SortMerge;
        }
        self.join_on.push(oriented);
        Ok(())
    }

    /// Route one WHERE filter to the covering side. Filters on the inner
    /// side of a LEFT JOIN cannot be pushed below the join without
    /// dropping preserved rows.
    pub(crate) fn push_filter(
        &mut self,
        filter: FilterTuple,
        router: &kestrel_router::Router,
    ) -> Result<(), KestrelError> {
        if filter.refer_tables.is_empty() {
            self.left.push_filter(vec![filter.clone()], router)?;
            self.right.push_filter(vec![filter], router)?;
            return Ok(());
        }
        let left_aliases = self.left.referred_aliases();
        let right_aliases = self.right.referred_aliases();
        let in_left = filter.refer_tables.iter().all(|t| left_aliases.contains(t));
        let in_right = filter
            .refer_tables
            .iter()
            .all(|t| right_aliases.contains(t));
        if in_left {
            return self.left.push_filter(vec![filter], router);
        }
        if in_right {
            if self.is_left_join {
                return Err(PlanError::UnsupportedJoinShape(format!(
                    "where filter on the inner side of a LEFT JOIN: {}",
                    analyzer::canonical(&filter.expr)
                ))
                .into());
            }
            return self.right.push_filter(vec![filter], router);
        }
        // Crossing both sides without being an equality: only the nested
        // loop can evaluate it, as a bind-variable predicate on the inner
        // side.
        if !self.is_left_join {
            if let Some(alias) = filter
                .refer_tables
                .iter()
                .find(|t| right_aliases.contains(*t))
            {
                let alias = alias.clone();
                self.strategy = JoinStrategy::NestedLoop;
                self.right.add_where_covering(filter.expr, &alias);
                return Ok(());
            }
        }
        Err(PlanError::UnsupportedJoinShape(format!(
            "filter spanning both join sides: {}",
            analyzer::canonical(&filter.expr)
        ))
        .into())
    }

    /// Distribute the projection to the covering sides. Aggregates over a
    /// cross-shard join would need a proxy-side expression evaluator that
    /// is out of scope, so they are rejected.
    pub(crate) fn push_select_exprs(
        &mut self,
        fields: Vec<SelectTuple>,
        _groups: Vec<GroupTuple>,
        _sel: &Select,
        agg_push: AggPush,
    ) -> Result<(), KestrelError> {
        if agg_push != AggPush::NoAgg {
            return Err(
                PlanError::UnsupportedAggregate("in cross-shard join".to_string()).into(),
            );
        }
        self.fields = fields.clone();
        for tuple in fields {
            self.push_select_expr(tuple)?;
        }
        Ok(())
    }

    pub(crate) fn push_select_expr(&mut self, tuple: SelectTuple) -> Result<(), KestrelError> {
        if tuple.is_star && tuple.table.is_empty() {
            self.left.push_select_expr(tuple.clone())?;
            self.right.push_select_expr(tuple)?;
            return Ok(());
        }
        let left_aliases = self.left.referred_aliases();
        let right_aliases = self.right.referred_aliases();
        let refers = if tuple.is_star {
            vec![tuple.table.clone()]
        } else {
            tuple.refer_tables.clone()
        };
        if refers.is_empty() {
            // Unqualified columns cannot pick a side; constants go left.
            let has_cols = match &tuple.item {
                sqlparser::ast::SelectItem::UnnamedExpr(e)
                | sqlparser::ast::SelectItem::ExprWithAlias { expr: e, .. } => {
                    !analyzer::column_refs(e).is_empty()
                }
                _ => false,
            };
            if has_cols {
                return Err(PlanError::AmbiguousColumn(tuple.field.clone()).into());
            }
            return self.left.push_select_expr(tuple);
        }
        let in_left = refers.iter().all(|t| left_aliases.contains(t));
        let in_right = refers.iter().all(|t| right_aliases.contains(t));
        match (in_left, in_right) {
            (true, _) => self.left.push_select_expr(tuple),
            (_, true) => self.right.push_select_expr(tuple),
            _ => Err(PlanError::Unsupported(format!(
                "expression referencing both join sides: {}",
                tuple.field
            ))
            .into()),
        }
    }

    pub(crate) fn push_having(&mut self, havings: Vec<FilterTuple>) -> Result<(), KestrelError> {
        let left_aliases = self.left.referred_aliases();
        let right_aliases = self.right.referred_aliases();
        for filter in havings {
            if filter.refer_tables.is_empty() {
                self.left.push_having(vec![filter.clone()])?;
                self.right.push_having(vec![filter])?;
                continue;
            }
            let in_left = filter.refer_tables.iter().all(|t| left_aliases.contains(t));
            let in_right = filter
                .refer_tables
                .iter()
                .all(|t| right_aliases.contains(t));
            if in_left {
                self.left.push_having(vec![filter])?;
            } else if in_right && !self.is_left_join {
                self.right.push_having(vec![filter])?;
            } else {
                return Err(PlanError::UnsupportedHaving(format!(
                    "crossing join sides: {}",
                    analyzer::canonical(&filter.expr)
                ))
                .into());
            }
        }
        Ok(())
    }

    /// The gathered join output is sorted in the proxy; `GatherMerge`
    /// surfaces the keys in the explain document.
    pub(crate) fn push_order_by(&mut self, order_by: &[OrderByExpr]) -> Result<(), KestrelError> {
        if order_by.is_empty() {
            return Ok(());
        }
        let plan = OrderByPlan::build(order_by, &self.fields)?;
        self.children.add(ChildPlan::OrderBy(plan));
        Ok(())
    }

    /// The proxy applies the original `(offset, count)` after the join;
    /// each side still ships `LIMIT offset+count` so no backend returns
    /// more rows than the join driver can use.
    pub(crate) fn push_limit(
        &mut self,
        limit: Option<&Expr>,
        offset: Option<&Offset>,
    ) -> Result<(), KestrelError> {
        let plan = LimitPlan::build(limit, offset)?;
        let (_, total) = plan.rewritten();
        self.left.set_shard_limit(total);
        self.right.set_shard_limit(total);
        self.children.add(ChildPlan::Limit(plan));
        Ok(())
    }

    /// Materialize the join bookkeeping into the children, then render
    /// both sides.
    ///
    /// - SortMerge: the key columns join both select lists and both sides
    ///   get an ascending ORDER BY on them, so streams merge directly.
    /// - NestedLoop/Cartesian: the equality predicates move into the inner
    ///   side's WHERE; outer-side references render as bind variables and
    ///   the referenced columns are procured into the outer select list.
    pub(crate) fn build_query(
        &mut self,
        all_aliases: &HashSet<String>,
    ) -> Result<(), KestrelError> {
        let join_on = self.join_on.clone();
        match self.strategy {
            JoinStrategy::SortMerge => {
                for tuple in &join_on {
                    self.left.push_col_if_absent(&tuple.left)?;
                    self.right.push_col_if_absent(&tuple.right)?;
                    self.left.append_order_by_col(&tuple.left);
                    self.right.append_order_by_col(&tuple.right);
                }
            }
            JoinStrategy::NestedLoop => {
                for tuple in &join_on {
                    let alias = tuple.right.table.clone();
                    self.right.add_where_covering(tuple.expr.clone(), &alias);
                }
            }
            JoinStrategy::Cartesian => {}
        }

        // Procure outer columns the inner side references as bind vars.
        let left_aliases: Vec<String> = self.left.referred_aliases();
        self.vars.clear();
        for col in self.right.collect_external_refs() {
            if !left_aliases.contains(&col.table) {
                continue;
            }
            self.left.push_col_if_absent(&col)?;
            let name = format!("{}_{}", col.table, col.column);
            if !self.vars.iter().any(|v| v.name == name) {
                self.vars.push(JoinVar {
                    name,
                    table: col.table,
                    column: col.column,
                });
            }
        }

        self.left.build_query(all_aliases)?;
        self.right.build_query(all_aliases)?;
        tracing::debug!(
            strategy = ?self.strategy,
            vars = self.vars.len(),
            "build: join node rendered"
        );
        Ok(())
    }
}

