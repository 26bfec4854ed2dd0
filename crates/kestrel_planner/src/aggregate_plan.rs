//! Splits aggregation between the shards and the proxy and rewrites the
//! shard-bound projection accordingly.
//!
//! Push-down `AVG(x)` ships as the pair `SUM(x), COUNT(x)`; the proxy
//! reconstructs the quotient and drops the count column. Distinct
//! aggregates never push down: the shards ship the bare argument values
//! and the proxy de-duplicates while aggregating.

use sqlparser::ast::{Expr, Function, Ident, ObjectName, SelectItem, Value as AstValue};

use kestrel_common::error::{KestrelError, PlanError};

use crate::analyzer;
use crate::tuples::{Aggregator, AggrType, ColumnRef, GroupTuple, SelectTuple};

#[derive(Debug)]
pub struct AggregatePlan {
    normal_aggrs: Vec<Aggregator>,
    group_aggrs: Vec<Aggregator>,
    rewritten: Vec<SelectItem>,
    is_push_down: bool,
}

impl AggregatePlan {
    pub(crate) fn build(
        fields: &[SelectTuple],
        groups: &[GroupTuple],
        is_push_down: bool,
    ) -> Result<AggregatePlan, KestrelError> {
        let mut normal_aggrs = Vec::new();
        let mut group_aggrs = Vec::new();
        let mut rewritten = Vec::new();
        let mut idx = 0usize;

        for tuple in fields {
            match &tuple.agg {
                Some(agg) => {
                    let label = tuple.label().to_string();
                    if is_push_down {
                        debug_assert!(!agg.distinct, "distinct aggregates never push down");
                        if agg.typ == AggrType::Avg {
                            let func = extract_function(&tuple.item)?;
                            let sum = rename_function(func, "sum");
                            let count = rename_function(func, "count");
                            normal_aggrs.push(Aggregator {
                                field: label,
                                index: idx,
                                typ: AggrType::Avg,
                                distinct: false,
                            });
                            normal_aggrs.push(Aggregator {
                                field: sum.to_string(),
                                index: idx,
                                typ: AggrType::Sum,
                                distinct: false,
                            });
                            normal_aggrs.push(Aggregator {
                                field: count.to_string(),
                                index: idx + 1,
                                typ: AggrType::Count,
                                distinct: false,
                            });
                            rewritten.push(SelectItem::UnnamedExpr(Expr::Function(sum)));
                            rewritten.push(SelectItem::UnnamedExpr(Expr::Function(count)));
                            idx += 2;
                        } else {
                            normal_aggrs.push(Aggregator {
                                field: label,
                                index: idx,
                                typ: agg.typ,
                                distinct: false,
                            });
                            rewritten.push(tuple.item.clone());
                            idx += 1;
                        }
                    } else {
                        // Value gathering: the shard evaluates only the
                        // argument expression; the proxy aggregates.
                        let arg = agg.arg.clone().unwrap_or_else(|| {
                            Expr::Value(AstValue::Number("1".to_string(), false))
                        });
                        normal_aggrs.push(Aggregator {
                            field: label,
                            index: idx,
                            typ: agg.typ,
                            distinct: agg.distinct,
                        });
                        rewritten.push(SelectItem::UnnamedExpr(arg));
                        idx += 1;
                    }
                }
                None => {
                    let is_group_key = groups.iter().any(|g| {
                        g.in_select
                            && (g.field == tuple.field
                                || (!tuple.alias.is_empty() && g.field == tuple.alias))
                            && (g.table.is_empty()
                                || tuple.table.is_empty()
                                || g.table == tuple.table)
                    });
                    if is_group_key {
                        group_aggrs.push(Aggregator {
                            field: tuple.label().to_string(),
                            index: idx,
                            typ: AggrType::GroupBy,
                            distinct: false,
                        });
                    }
                    rewritten.push(tuple.item.clone());
                    idx += 1;
                }
            }
        }

        // Group keys missing from the projection ship as hidden trailing
        // columns; the caller strips them from the final rows.
        for g in groups.iter().filter(|g| !g.in_select) {
            let col = ColumnRef {
                table: g.table.clone(),
                column: g.field.clone(),
            };
            rewritten.push(SelectItem::UnnamedExpr(analyzer::column_expr(&col)));
            group_aggrs.push(Aggregator {
                field: col.label(),
                index: idx,
                typ: AggrType::GroupBy,
                distinct: false,
            });
            idx += 1;
        }

        Ok(AggregatePlan {
            normal_aggrs,
            group_aggrs,
            rewritten,
            is_push_down,
        })
    }

    /// Aggregates the proxy evaluates over the gathered stream.
    pub fn normal_aggrs(&self) -> &[Aggregator] {
        &self.normal_aggrs
    }

    /// Hash-group-by key columns.
    pub fn group_aggrs(&self) -> &[Aggregator] {
        &self.group_aggrs
    }

    /// The shard-bound projection after rewriting.
    pub fn rewritten(&self) -> &[SelectItem] {
        &self.rewritten
    }

    pub fn is_push_down(&self) -> bool {
        self.is_push_down
    }
}

fn extract_function(item: &SelectItem) -> Result<&Function, KestrelError> {
    match item {
        SelectItem::UnnamedExpr(Expr::Function(f))
        | SelectItem::ExprWithAlias {
            expr: Expr::Function(f),
            ..
        } => Ok(f),
        other => Err(PlanError::UnsupportedAggregate(format!("{:?}", other)).into()),
    }
}

fn rename_function(func: &Function, name: &str) -> Function {
    Function {
        name: ObjectName(vec![Ident::new(name)]),
        ..func.clone()
    }
}
