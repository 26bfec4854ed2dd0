//! LIMIT handling: the proxy applies the original `(offset, count)`; the
//! shards receive `(0, offset + count)` so every candidate row arrives.

use sqlparser::ast::{Expr, Offset, Value as AstValue};

use kestrel_common::error::{KestrelError, PlanError};

#[derive(Debug)]
pub struct LimitPlan {
    offset: usize,
    count: usize,
}

impl LimitPlan {
    pub(crate) fn build(
        limit: Option<&Expr>,
        offset: Option<&Offset>,
    ) -> Result<LimitPlan, KestrelError> {
        let count = match limit {
            Some(expr) => parse_count(expr)?,
            None => {
                return Err(
                    PlanError::InvalidLimit("OFFSET without a row count".to_string()).into(),
                )
            }
        };
        let offset = match offset {
            Some(o) => parse_count(&o.value)?,
            None => 0,
        };
        Ok(LimitPlan { offset, count })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn limit(&self) -> usize {
        self.count
    }

    /// The shard-bound form: offset folded into the count.
    pub fn rewritten(&self) -> (usize, usize) {
        (0, self.offset + self.count)
    }
}

fn parse_count(expr: &Expr) -> Result<usize, KestrelError> {
    match expr {
        Expr::Value(AstValue::Number(n, _)) => n
            .parse::<usize>()
            .map_err(|_| PlanError::InvalidLimit(n.clone()).into()),
        other => Err(PlanError::InvalidLimit(format!("{}", other)).into()),
    }
}
