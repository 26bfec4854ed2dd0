//! Proxy-side ordering of the gathered streams: a k-way merge over
//! per-shard sorted results, multi-key with per-key direction.

use sqlparser::ast::OrderByExpr;

use kestrel_common::error::{KestrelError, PlanError};

use crate::analyzer;
use crate::tuples::SelectTuple;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// One ordering key resolved against the gathered field list.
#[derive(Debug, Clone)]
pub struct OrderTuple {
    pub table: String,
    pub field: String,
    pub direction: Direction,
    /// Index into the gathered field list.
    pub index: usize,
}

impl OrderTuple {
    pub fn label(&self) -> String {
        if self.table.is_empty() {
            self.field.clone()
        } else {
            format!("{}.{}", self.table, self.field)
        }
    }
}

#[derive(Debug)]
pub struct OrderByPlan {
    order_bys: Vec<OrderTuple>,
}

impl OrderByPlan {
    pub(crate) fn build(
        order_by: &[OrderByExpr],
        fields: &[SelectTuple],
    ) -> Result<OrderByPlan, KestrelError> {
        let mut order_bys = Vec::with_capacity(order_by.len());
        for ob in order_by {
            let col = analyzer::as_column_ref(&ob.expr).ok_or_else(|| {
                PlanError::Unsupported(format!(
                    "order by expression: {}",
                    analyzer::canonical(&ob.expr)
                ))
            })?;
            let (index, tuple) = fields
                .iter()
                .enumerate()
                .find(|(_, t)| {
                    if t.is_star {
                        return t.table.is_empty()
                            || col.table.is_empty()
                            || t.table == col.table;
                    }
                    if !t.alias.is_empty() && t.alias == col.column && col.table.is_empty() {
                        return true;
                    }
                    t.field == col.column && (col.table.is_empty() || t.table == col.table)
                })
                .ok_or_else(|| PlanError::ColumnUnknown(col.label()))?;
            let table = if col.table.is_empty() {
                tuple.table.clone()
            } else {
                col.table.clone()
            };
            let direction = if ob.asc.unwrap_or(true) {
                Direction::Asc
            } else {
                Direction::Desc
            };
            order_bys.push(OrderTuple {
                table,
                field: col.column,
                direction,
                index,
            });
        }
        Ok(OrderByPlan { order_bys })
    }

    pub fn order_bys(&self) -> &[OrderTuple] {
        &self.order_bys
    }
}
